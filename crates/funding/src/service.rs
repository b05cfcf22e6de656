//! Funding Service - entry point for every ledger mutation
//!
//! Creating a donation or project runs the matching engine against the open
//! entities of the other kind and commits the result as one unit.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use common::types::Principal;
use observability::FundingMetrics;

use crate::error::{FundingError, Result};
use crate::guards;
use crate::matching::run_matching;
use crate::store::traits::{AllocationCommit, FundingStore, StoreError, TouchedEntity};
use crate::types::{
    timestamp_now, Allocation, Donation, Entity, Fundable, FundableKind, NewDonation, NewProject,
    Project, ProjectUpdate,
};

/// Retry policy for allocation commits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationSettings {
    /// Extra attempts after the first commit loses a race
    pub max_commit_retries: u32,
    /// Base delay, multiplied by the attempt number
    pub retry_backoff: Duration,
}

impl Default for AllocationSettings {
    fn default() -> Self {
        Self {
            max_commit_retries: 3,
            retry_backoff: Duration::from_millis(25),
        }
    }
}

/// Funding Service - creates, edits and removes fundables
pub struct FundingService {
    store: Arc<dyn FundingStore>,
    settings: AllocationSettings,
    /// Serializes read-match-commit sequences and edits in this process
    allocation_lock: Mutex<()>,
    metrics: FundingMetrics,
}

impl FundingService {
    /// Create a new FundingService
    pub fn new(store: Arc<dyn FundingStore>, settings: AllocationSettings) -> Self {
        Self {
            store,
            settings,
            allocation_lock: Mutex::new(()),
            metrics: FundingMetrics::new(),
        }
    }

    /// Underlying store
    pub fn store(&self) -> &Arc<dyn FundingStore> {
        &self.store
    }

    /// Create a project and fund it from open donations
    ///
    /// Flow:
    /// 1. Check the caller is an admin
    /// 2. Validate input and name uniqueness
    /// 3. Match against open donations, oldest first
    /// 4. Commit project, touched donations and allocations together
    pub async fn create_project(&self, principal: &Principal, input: NewProject) -> Result<Project> {
        principal.require_admin("create project")?;
        guards::validate_new_project(&input)?;

        let holder = self.store.get_project_by_name(&input.name).await?;
        guards::check_name_available(&input.name, holder.as_ref(), None)?;

        let id = self.store.next_id(FundableKind::Project).await?;
        let project = Project::new(id, input.name, input.description, input.full_amount);
        info!(project_id = id, name = %project.name, full_amount = project.full_amount(), "Creating project");

        self.allocate(project.into())
            .await?
            .into_project()
            .ok_or_else(|| FundingError::Storage("allocation returned a non-project".to_string()))
    }

    /// Record a donation from the caller and allocate it to open projects
    pub async fn create_donation(&self, principal: &Principal, input: NewDonation) -> Result<Donation> {
        guards::validate_new_donation(&input)?;

        let id = self.store.next_id(FundableKind::Donation).await?;
        let donation = Donation::new(id, principal.user_id, input.full_amount, input.comment);
        info!(donation_id = id, donor_id = %principal.user_id, full_amount = donation.full_amount(), "Creating donation");

        self.allocate(donation.into())
            .await?
            .into_donation()
            .ok_or_else(|| FundingError::Storage("allocation returned a non-donation".to_string()))
    }

    /// Edit an open project
    pub async fn update_project(
        &self,
        principal: &Principal,
        id: i64,
        update: ProjectUpdate,
    ) -> Result<Project> {
        principal.require_admin("update project")?;
        let _guard = self.allocation_lock.lock().await;

        let mut project = self.require_project(id).await?;
        if let Some(name) = &update.name {
            let holder = self.store.get_project_by_name(name).await?;
            guards::check_name_available(name, holder.as_ref(), Some(id))?;
        }

        let expected_invested = project.invested_amount();
        guards::apply_update(&mut project, update, timestamp_now())?;
        self.store.update_project(&project, expected_invested).await?;

        if !project.is_open() {
            self.metrics.record_closed(FundableKind::Project.as_str(), 1);
            info!(project_id = id, "Project closed by edit");
        }
        info!(project_id = id, "Project updated");
        Ok(project)
    }

    /// Delete a project that never received funds, returning it
    pub async fn delete_project(&self, principal: &Principal, id: i64) -> Result<Project> {
        principal.require_admin("delete project")?;
        let _guard = self.allocation_lock.lock().await;

        let project = self.require_project(id).await?;
        guards::check_deletable(&project)?;

        let removed = self.store.delete_project(id).await?;
        info!(project_id = id, name = %removed.name, "Project deleted");
        Ok(removed)
    }

    /// Get a project by id
    pub async fn get_project(&self, id: i64) -> Result<Project> {
        self.require_project(id).await
    }

    /// All projects, oldest first
    pub async fn list_projects(&self) -> Result<Vec<Project>> {
        Ok(self.store.list_projects().await?)
    }

    /// All donations (admin only)
    pub async fn list_donations(&self, principal: &Principal) -> Result<Vec<Donation>> {
        principal.require_admin("list all donations")?;
        Ok(self.store.list_donations(None).await?)
    }

    /// Donations made by the caller
    pub async fn list_my_donations(&self, principal: &Principal) -> Result<Vec<Donation>> {
        Ok(self.store.list_donations(Some(principal.user_id)).await?)
    }

    /// Transfers recorded for one entity (admin only)
    pub async fn allocation_history(
        &self,
        principal: &Principal,
        kind: FundableKind,
        id: i64,
    ) -> Result<Vec<Allocation>> {
        principal.require_admin("read allocation history")?;
        if self.store.get_by_id(kind, id).await?.is_none() {
            return Err(FundingError::NotFound { kind, id });
        }
        Ok(self.store.list_allocations(kind, id).await?)
    }

    async fn require_project(&self, id: i64) -> Result<Project> {
        self.store
            .get_project(id)
            .await?
            .ok_or(FundingError::NotFound {
                kind: FundableKind::Project,
                id,
            })
    }

    /// Run matching for a new subject and commit, retrying on conflict
    ///
    /// Each attempt starts from the unallocated subject and freshly read
    /// balances, so a lost race never leaks into the next attempt. The
    /// returned entity is the subject as re-read from the store.
    async fn allocate(&self, subject: Entity) -> Result<Entity> {
        let _guard = self.allocation_lock.lock().await;
        let subject_kind = subject.kind();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let started = Instant::now();

            let open = self.store.list_open(subject_kind.counterpart()).await?;
            let expected: HashMap<i64, u64> = open
                .iter()
                .map(|e| (e.id(), e.invested_amount()))
                .collect();

            let mut candidate = subject.clone();
            let result = run_matching(&mut candidate, open, timestamp_now());

            let transfers = result.allocations.len() as u64;
            let amount = result.total_transferred();
            let closed_counterparts = result.touched.iter().filter(|e| !e.is_open()).count() as u64;

            let touched = result
                .touched
                .into_iter()
                .map(|entity| TouchedEntity {
                    expected_invested: expected.get(&entity.id()).copied().unwrap_or_default(),
                    entity,
                })
                .collect();
            let commit = AllocationCommit {
                subject: candidate.clone(),
                touched,
                allocations: result.allocations,
            };

            match self.store.commit_allocation(commit).await {
                Ok(()) => {
                    let persisted = self.store.refresh(&candidate).await?;
                    self.metrics
                        .record_run(subject_kind.as_str(), started.elapsed(), transfers, amount);
                    self.metrics
                        .record_closed(subject_kind.counterpart().as_str(), closed_counterparts);
                    if !persisted.is_open() {
                        self.metrics.record_closed(subject_kind.as_str(), 1);
                    }
                    debug!(
                        subject_kind = %subject_kind,
                        subject_id = persisted.id(),
                        transfers,
                        amount,
                        attempt,
                        "Allocation committed"
                    );
                    return Ok(persisted);
                }
                Err(StoreError::Conflict(reason)) => {
                    self.metrics.record_conflict();
                    if attempt > self.settings.max_commit_retries {
                        warn!(
                            subject_kind = %subject_kind,
                            subject_id = subject.id(),
                            attempts = attempt,
                            %reason,
                            "Allocation retries exhausted"
                        );
                        return Err(FundingError::Transient(format!(
                            "allocation for {} {} conflicted {} times: {}",
                            subject_kind,
                            subject.id(),
                            attempt,
                            reason
                        )));
                    }
                    warn!(
                        subject_kind = %subject_kind,
                        subject_id = subject.id(),
                        attempt,
                        %reason,
                        "Allocation commit conflicted, retrying"
                    );
                    tokio::time::sleep(self.settings.retry_backoff * attempt).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
