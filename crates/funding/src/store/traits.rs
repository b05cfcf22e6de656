//! FundingStore trait definition

use async_trait::async_trait;
use uuid::Uuid;

use crate::types::{Allocation, Donation, Entity, Fundable, FundableKind, Project};

/// Errors that can occur in the store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A conditional write lost a race; nothing was written
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Unique project name violated
    #[error("Duplicate project name: {0}")]
    Duplicate(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: FundableKind, id: i64 },

    #[error("Backend error: {0}")]
    Backend(String),
}

/// Result type for FundingStore operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A counterpart mutated by a matching run, with the balance it was read at
#[derive(Debug, Clone)]
pub struct TouchedEntity {
    pub entity: Entity,
    /// `invested_amount` observed when the open list was read
    pub expected_invested: u64,
}

/// Everything one matching run writes, committed as a single unit
#[derive(Debug, Clone)]
pub struct AllocationCommit {
    /// Newly created entity, inserted by the commit
    pub subject: Entity,
    /// Counterparts whose balances changed
    pub touched: Vec<TouchedEntity>,
    /// Audit records for each transfer
    pub allocations: Vec<Allocation>,
}

impl AllocationCommit {
    /// Commit for a subject that matched nothing
    pub fn standalone(subject: Entity) -> Self {
        Self {
            subject,
            touched: Vec::new(),
            allocations: Vec::new(),
        }
    }
}

/// FundingStore trait - persistence for donations, projects and allocations
///
/// Implementations must make [`FundingStore::commit_allocation`] atomic:
/// either every write in the commit becomes visible or none does.
#[async_trait]
pub trait FundingStore: Send + Sync {
    /// Reserve an identifier for a new entity of `kind`
    async fn next_id(&self, kind: FundableKind) -> StoreResult<i64>;

    /// Get an entity by kind and id
    async fn get_by_id(&self, kind: FundableKind, id: i64) -> StoreResult<Option<Entity>>;

    /// Get a project by exact (case-sensitive) name
    async fn get_project_by_name(&self, name: &str) -> StoreResult<Option<Project>>;

    /// All entities of `kind` that are not fully invested
    ///
    /// Ordered by `created_at` ascending, ties broken by `id` ascending.
    /// This ordering decides who gets funded first.
    async fn list_open(&self, kind: FundableKind) -> StoreResult<Vec<Entity>>;

    /// All projects, oldest first
    async fn list_projects(&self) -> StoreResult<Vec<Project>>;

    /// All donations, optionally filtered by donor, oldest first
    async fn list_donations(&self, donor_id: Option<Uuid>) -> StoreResult<Vec<Donation>>;

    /// Allocation history of one entity, in commit order
    async fn list_allocations(&self, kind: FundableKind, id: i64) -> StoreResult<Vec<Allocation>>;

    /// Atomically insert the subject, write touched counterparts and append allocations
    ///
    /// Fails with [`StoreError::Conflict`] if any touched counterpart no longer
    /// has its expected invested amount or is already closed.
    async fn commit_allocation(&self, commit: AllocationCommit) -> StoreResult<()>;

    /// Write an edited project, provided its stored balance is unchanged and it is open
    async fn update_project(&self, project: &Project, expected_invested: u64) -> StoreResult<()>;

    /// Remove a project that has never received funds, returning it
    async fn delete_project(&self, id: i64) -> StoreResult<Project>;

    /// Get a project by id
    async fn get_project(&self, id: i64) -> StoreResult<Option<Project>> {
        Ok(self
            .get_by_id(FundableKind::Project, id)
            .await?
            .and_then(Entity::into_project))
    }

    /// Get a donation by id
    async fn get_donation(&self, id: i64) -> StoreResult<Option<Donation>> {
        Ok(self
            .get_by_id(FundableKind::Donation, id)
            .await?
            .and_then(Entity::into_donation))
    }

    /// Re-read the persisted state of an entity
    async fn refresh(&self, entity: &Entity) -> StoreResult<Entity> {
        let (kind, id) = (entity.kind(), entity.id());
        self.get_by_id(kind, id)
            .await?
            .ok_or(StoreError::NotFound { kind, id })
    }
}
