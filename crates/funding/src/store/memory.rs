//! In-memory funding store implementation

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

use crate::store::traits::{AllocationCommit, FundingStore, StoreError, StoreResult};
use crate::types::{Allocation, Donation, Entity, Fundable, FundableKind, Project};

#[derive(Default)]
struct Ledger {
    donations: BTreeMap<i64, Donation>,
    projects: BTreeMap<i64, Project>,
    allocations: Vec<Allocation>,
    last_donation_id: i64,
    last_project_id: i64,
}

impl Ledger {
    fn get(&self, kind: FundableKind, id: i64) -> Option<Entity> {
        match kind {
            FundableKind::Donation => self.donations.get(&id).cloned().map(Entity::from),
            FundableKind::Project => self.projects.get(&id).cloned().map(Entity::from),
        }
    }

    fn name_taken(&self, name: &str, except_id: i64) -> bool {
        self.projects
            .values()
            .any(|p| p.id != except_id && p.name == name)
    }

    fn put(&mut self, entity: Entity) {
        match entity {
            Entity::Donation(d) => {
                self.donations.insert(d.id, d);
            }
            Entity::Project(p) => {
                self.projects.insert(p.id, p);
            }
        }
    }
}

/// In-memory funding store for testing and development
///
/// All state sits behind one lock, so every multi-entity write is atomic.
pub struct InMemoryFundingStore {
    ledger: RwLock<Ledger>,
}

impl InMemoryFundingStore {
    /// Create a new, empty in-memory store
    pub fn new() -> Self {
        Self {
            ledger: RwLock::new(Ledger::default()),
        }
    }

    fn read(&self) -> StoreResult<RwLockReadGuard<'_, Ledger>> {
        self.ledger
            .read()
            .map_err(|_| StoreError::Backend("ledger lock poisoned".to_string()))
    }

    fn write(&self) -> StoreResult<RwLockWriteGuard<'_, Ledger>> {
        self.ledger
            .write()
            .map_err(|_| StoreError::Backend("ledger lock poisoned".to_string()))
    }
}

impl Default for InMemoryFundingStore {
    fn default() -> Self {
        Self::new()
    }
}

fn oldest_first<T: Fundable>(items: &mut [T]) {
    items.sort_by(|a, b| {
        a.created_at()
            .cmp(&b.created_at())
            .then_with(|| a.id().cmp(&b.id()))
    });
}

#[async_trait]
impl FundingStore for InMemoryFundingStore {
    async fn next_id(&self, kind: FundableKind) -> StoreResult<i64> {
        let mut ledger = self.write()?;
        let counter = match kind {
            FundableKind::Donation => &mut ledger.last_donation_id,
            FundableKind::Project => &mut ledger.last_project_id,
        };
        *counter += 1;
        Ok(*counter)
    }

    async fn get_by_id(&self, kind: FundableKind, id: i64) -> StoreResult<Option<Entity>> {
        Ok(self.read()?.get(kind, id))
    }

    async fn get_project_by_name(&self, name: &str) -> StoreResult<Option<Project>> {
        let ledger = self.read()?;
        Ok(ledger.projects.values().find(|p| p.name == name).cloned())
    }

    async fn list_open(&self, kind: FundableKind) -> StoreResult<Vec<Entity>> {
        let ledger = self.read()?;
        let mut open: Vec<Entity> = match kind {
            FundableKind::Donation => ledger
                .donations
                .values()
                .filter(|d| d.is_open())
                .cloned()
                .map(Entity::from)
                .collect(),
            FundableKind::Project => ledger
                .projects
                .values()
                .filter(|p| p.is_open())
                .cloned()
                .map(Entity::from)
                .collect(),
        };
        oldest_first(&mut open);
        Ok(open)
    }

    async fn list_projects(&self) -> StoreResult<Vec<Project>> {
        let mut projects: Vec<Project> = self.read()?.projects.values().cloned().collect();
        oldest_first(&mut projects);
        Ok(projects)
    }

    async fn list_donations(&self, donor_id: Option<Uuid>) -> StoreResult<Vec<Donation>> {
        let ledger = self.read()?;
        let mut donations: Vec<Donation> = ledger
            .donations
            .values()
            .filter(|d| donor_id.map_or(true, |uid| d.donor_id == uid))
            .cloned()
            .collect();
        oldest_first(&mut donations);
        Ok(donations)
    }

    async fn list_allocations(&self, kind: FundableKind, id: i64) -> StoreResult<Vec<Allocation>> {
        let ledger = self.read()?;
        Ok(ledger
            .allocations
            .iter()
            .filter(|a| a.involves(kind, id))
            .cloned()
            .collect())
    }

    async fn commit_allocation(&self, commit: AllocationCommit) -> StoreResult<()> {
        let mut ledger = self.write()?;
        let subject = &commit.subject;

        // Validate the whole batch before touching anything
        if ledger.get(subject.kind(), subject.id()).is_some() {
            return Err(StoreError::Conflict(format!(
                "{} {} already exists",
                subject.kind(),
                subject.id()
            )));
        }
        if let Some(project) = subject.as_project() {
            if ledger.name_taken(&project.name, project.id) {
                return Err(StoreError::Duplicate(project.name.clone()));
            }
        }
        for touched in &commit.touched {
            let (kind, id) = (touched.entity.kind(), touched.entity.id());
            let stored = ledger.get(kind, id).ok_or_else(|| {
                StoreError::Conflict(format!("{} {} disappeared during allocation", kind, id))
            })?;
            if !stored.is_open() || stored.invested_amount() != touched.expected_invested {
                return Err(StoreError::Conflict(format!(
                    "{} {} changed: expected invested {}, found {}",
                    kind,
                    id,
                    touched.expected_invested,
                    stored.invested_amount()
                )));
            }
        }

        ledger.put(commit.subject);
        for touched in commit.touched {
            ledger.put(touched.entity);
        }
        ledger.allocations.extend(commit.allocations);

        Ok(())
    }

    async fn update_project(&self, project: &Project, expected_invested: u64) -> StoreResult<()> {
        let mut ledger = self.write()?;

        let stored = ledger.projects.get(&project.id).ok_or(StoreError::NotFound {
            kind: FundableKind::Project,
            id: project.id,
        })?;
        if !stored.is_open() || stored.invested_amount() != expected_invested {
            return Err(StoreError::Conflict(format!(
                "project {} changed while being edited",
                project.id
            )));
        }
        if ledger.name_taken(&project.name, project.id) {
            return Err(StoreError::Duplicate(project.name.clone()));
        }

        ledger.projects.insert(project.id, project.clone());
        Ok(())
    }

    async fn delete_project(&self, id: i64) -> StoreResult<Project> {
        let mut ledger = self.write()?;

        let stored = ledger.projects.get(&id).ok_or(StoreError::NotFound {
            kind: FundableKind::Project,
            id,
        })?;
        if stored.invested_amount() > 0 || !stored.is_open() {
            return Err(StoreError::Conflict(format!(
                "project {} received funds while being deleted",
                id
            )));
        }

        ledger.projects.remove(&id).ok_or(StoreError::NotFound {
            kind: FundableKind::Project,
            id,
        })
    }
}
