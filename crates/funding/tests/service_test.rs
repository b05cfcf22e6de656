//! Funding service integration tests

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use common::types::Principal;
use funding::{
    AllocationCommit, AllocationSettings, Donation, Entity, Fundable, FundableKind, FundingError,
    FundingService, FundingStore, InMemoryFundingStore, NewDonation, NewProject, Project,
    ProjectUpdate, StoreError, StoreResult,
};
use uuid::Uuid;

fn admin() -> Principal {
    Principal::admin(Uuid::new_v4())
}

fn fast_settings() -> AllocationSettings {
    AllocationSettings {
        max_commit_retries: 3,
        retry_backoff: Duration::from_millis(1),
    }
}

fn service_with(store: Arc<dyn FundingStore>) -> FundingService {
    FundingService::new(store, fast_settings())
}

fn in_memory() -> (Arc<InMemoryFundingStore>, FundingService) {
    let store = Arc::new(InMemoryFundingStore::new());
    let service = service_with(store.clone());
    (store, service)
}

fn project_input(name: &str, full_amount: u64) -> NewProject {
    NewProject {
        name: name.to_string(),
        description: format!("{} description", name),
        full_amount,
    }
}

fn donation_input(full_amount: u64) -> NewDonation {
    NewDonation {
        full_amount,
        comment: None,
    }
}

async fn assert_ledger_consistent(store: &dyn FundingStore) {
    let projects = store.list_projects().await.unwrap();
    let donations = store.list_donations(None).await.unwrap();

    for p in &projects {
        p.check_invariants().unwrap();
    }
    for d in &donations {
        d.check_invariants().unwrap();
    }

    let into_projects: u64 = projects.iter().map(|p| p.invested_amount()).sum();
    let out_of_donations: u64 = donations.iter().map(|d| d.invested_amount()).sum();
    assert_eq!(into_projects, out_of_donations);
}

#[tokio::test]
async fn test_donation_funds_oldest_project_first() {
    let (store, service) = in_memory();
    let admin = admin();

    let a = service.create_project(&admin, project_input("A", 50)).await.unwrap();
    let b = service.create_project(&admin, project_input("B", 30)).await.unwrap();

    let donor = Principal::donor(Uuid::new_v4());
    let donation = service.create_donation(&donor, donation_input(60)).await.unwrap();

    assert!(!donation.is_open());
    assert_eq!(donation.invested_amount(), 60);
    assert!(donation.funding.closed_at.is_some());

    let a = service.get_project(a.id).await.unwrap();
    let b = service.get_project(b.id).await.unwrap();
    assert!(!a.is_open());
    assert_eq!(a.invested_amount(), 50);
    assert!(b.is_open());
    assert_eq!(b.invested_amount(), 10);

    let history = service
        .allocation_history(&admin, FundableKind::Donation, donation.id)
        .await
        .unwrap();
    let transfers: Vec<(i64, u64)> = history.iter().map(|a| (a.project_id, a.amount)).collect();
    assert_eq!(transfers, vec![(a.id, 50), (b.id, 10)]);

    assert_ledger_consistent(store.as_ref()).await;
}

#[tokio::test]
async fn test_project_absorbs_open_donations() {
    let (store, service) = in_memory();
    let donor = Principal::donor(Uuid::new_v4());

    let d1 = service.create_donation(&donor, donation_input(30)).await.unwrap();
    let d2 = service.create_donation(&donor, donation_input(30)).await.unwrap();

    let project = service.create_project(&admin(), project_input("Clinic", 45)).await.unwrap();

    assert!(!project.is_open());
    assert_eq!(project.invested_amount(), 45);

    let d1 = store.get_donation(d1.id).await.unwrap().unwrap();
    let d2 = store.get_donation(d2.id).await.unwrap().unwrap();
    assert!(!d1.is_open());
    assert_eq!(d2.invested_amount(), 15);
    assert!(d2.is_open());

    assert_ledger_consistent(store.as_ref()).await;
}

#[tokio::test]
async fn test_exact_fit_closes_both() {
    let (store, service) = in_memory();
    let project = service.create_project(&admin(), project_input("Well", 100)).await.unwrap();

    let donation = service
        .create_donation(&Principal::donor(Uuid::new_v4()), donation_input(100))
        .await
        .unwrap();

    let project = service.get_project(project.id).await.unwrap();
    assert!(!donation.is_open());
    assert!(!project.is_open());
    assert_eq!(donation.funding.closed_at, project.funding.closed_at);

    assert_ledger_consistent(store.as_ref()).await;
}

#[tokio::test]
async fn test_nothing_to_match() {
    let (store, service) = in_memory();
    let donor = Principal::donor(Uuid::new_v4());

    let donation = service.create_donation(&donor, donation_input(10)).await.unwrap();

    assert!(donation.is_open());
    assert_eq!(donation.invested_amount(), 0);
    assert!(store
        .list_allocations(FundableKind::Donation, donation.id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_duplicate_project_name() {
    let (_, service) = in_memory();
    let admin = admin();

    service.create_project(&admin, project_input("Shelter", 10)).await.unwrap();
    assert_matches!(
        service.create_project(&admin, project_input("Shelter", 20)).await,
        Err(FundingError::DuplicateName(name)) if name == "Shelter"
    );

    // Names are case-sensitive
    assert!(service.create_project(&admin, project_input("shelter", 20)).await.is_ok());
}

#[tokio::test]
async fn test_rename_to_taken_name_rejected() {
    let (_, service) = in_memory();
    let admin = admin();

    let first = service.create_project(&admin, project_input("Shelter", 10)).await.unwrap();
    service.create_project(&admin, project_input("Food", 10)).await.unwrap();

    let rename = ProjectUpdate {
        name: Some("Food".to_string()),
        ..Default::default()
    };
    assert_matches!(
        service.update_project(&admin, first.id, rename).await,
        Err(FundingError::DuplicateName(_))
    );

    // Keeping its own name is fine
    let same = ProjectUpdate {
        name: Some("Shelter".to_string()),
        description: Some("new text".to_string()),
        ..Default::default()
    };
    let updated = service.update_project(&admin, first.id, same).await.unwrap();
    assert_eq!(updated.description, "new text");
}

#[tokio::test]
async fn test_edit_guard() {
    let (store, service) = in_memory();
    let admin = admin();

    let project = service.create_project(&admin, project_input("Roof", 100)).await.unwrap();
    service
        .create_donation(&Principal::donor(Uuid::new_v4()), donation_input(40))
        .await
        .unwrap();

    let too_low = ProjectUpdate {
        full_amount: Some(39),
        ..Default::default()
    };
    assert_matches!(
        service.update_project(&admin, project.id, too_low).await,
        Err(FundingError::InvalidAmount { requested: 39, invested: 40 })
    );

    let exact = ProjectUpdate {
        full_amount: Some(40),
        ..Default::default()
    };
    let closed = service.update_project(&admin, project.id, exact).await.unwrap();
    assert!(!closed.is_open());
    assert_eq!(store.get_project(project.id).await.unwrap(), Some(closed.clone()));

    let after_close = ProjectUpdate {
        description: Some("late".to_string()),
        ..Default::default()
    };
    assert_matches!(
        service.update_project(&admin, project.id, after_close).await,
        Err(FundingError::EntityClosed { kind: FundableKind::Project, .. })
    );

    assert_ledger_consistent(store.as_ref()).await;
}

#[tokio::test]
async fn test_deletion_guard() {
    let (_, service) = in_memory();
    let admin = admin();

    let funded = service.create_project(&admin, project_input("Funded", 100)).await.unwrap();
    service
        .create_donation(&Principal::donor(Uuid::new_v4()), donation_input(1))
        .await
        .unwrap();

    assert_matches!(
        service.delete_project(&admin, funded.id).await,
        Err(FundingError::NonZeroInvestment { invested: 1, .. })
    );

    let empty = service.create_project(&admin, project_input("Empty", 100)).await.unwrap();
    let removed = service.delete_project(&admin, empty.id).await.unwrap();
    assert_eq!(removed.id, empty.id);
    assert_matches!(service.get_project(empty.id).await, Err(FundingError::NotFound { .. }));
}

#[tokio::test]
async fn test_validation_errors() {
    let (store, service) = in_memory();

    assert_matches!(
        service.create_project(&admin(), project_input("Zero", 0)).await,
        Err(FundingError::Validation(_))
    );
    assert_matches!(
        service
            .create_donation(&Principal::donor(Uuid::new_v4()), donation_input(0))
            .await,
        Err(FundingError::Validation(_))
    );
    assert!(store.list_projects().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_donor_forbidden_from_admin_operations() {
    let (_, service) = in_memory();
    let donor = Principal::donor(Uuid::new_v4());
    let project = service.create_project(&admin(), project_input("P", 10)).await.unwrap();

    let update = ProjectUpdate {
        full_amount: Some(20),
        ..Default::default()
    };
    assert_matches!(
        service.update_project(&donor, project.id, update).await,
        Err(FundingError::Forbidden(_))
    );
    assert_matches!(
        service.allocation_history(&donor, FundableKind::Project, project.id).await,
        Err(FundingError::Forbidden(_))
    );
    assert!(service.list_projects().await.is_ok());
}

/// Store wrapper that lets a competing writer fund projects right before
/// the next `remaining_interference` commits.
struct InterferingStore {
    inner: InMemoryFundingStore,
    remaining_interference: AtomicU32,
    steal: u64,
}

impl InterferingStore {
    fn new(interference: u32, steal: u64) -> Self {
        Self {
            inner: InMemoryFundingStore::new(),
            remaining_interference: AtomicU32::new(interference),
            steal,
        }
    }

    async fn interfere(&self, commit: &AllocationCommit) -> StoreResult<()> {
        if commit.touched.is_empty() {
            return Ok(());
        }
        let fire = self
            .remaining_interference
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !fire {
            return Ok(());
        }
        for touched in &commit.touched {
            if touched.entity.kind() != FundableKind::Project {
                continue;
            }
            if let Some(mut project) = self.inner.get_project(touched.entity.id()).await? {
                if !project.is_open() {
                    continue;
                }
                let before = project.invested_amount();
                let steal = self.steal.min(project.remaining());
                project.add_invested(steal);
                self.inner.update_project(&project, before).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl FundingStore for InterferingStore {
    async fn next_id(&self, kind: FundableKind) -> StoreResult<i64> {
        self.inner.next_id(kind).await
    }

    async fn get_by_id(&self, kind: FundableKind, id: i64) -> StoreResult<Option<Entity>> {
        self.inner.get_by_id(kind, id).await
    }

    async fn get_project_by_name(&self, name: &str) -> StoreResult<Option<Project>> {
        self.inner.get_project_by_name(name).await
    }

    async fn list_open(&self, kind: FundableKind) -> StoreResult<Vec<Entity>> {
        self.inner.list_open(kind).await
    }

    async fn list_projects(&self) -> StoreResult<Vec<Project>> {
        self.inner.list_projects().await
    }

    async fn list_donations(&self, donor_id: Option<Uuid>) -> StoreResult<Vec<Donation>> {
        self.inner.list_donations(donor_id).await
    }

    async fn list_allocations(&self, kind: FundableKind, id: i64) -> StoreResult<Vec<funding::Allocation>> {
        self.inner.list_allocations(kind, id).await
    }

    async fn commit_allocation(&self, commit: AllocationCommit) -> StoreResult<()> {
        self.interfere(&commit).await?;
        self.inner.commit_allocation(commit).await
    }

    async fn update_project(&self, project: &Project, expected_invested: u64) -> StoreResult<()> {
        self.inner.update_project(project, expected_invested).await
    }

    async fn delete_project(&self, id: i64) -> StoreResult<Project> {
        self.inner.delete_project(id).await
    }
}

/// Store whose commits always lose the race
struct AlwaysConflictStore {
    inner: InMemoryFundingStore,
    attempts: AtomicU32,
}

#[async_trait]
impl FundingStore for AlwaysConflictStore {
    async fn next_id(&self, kind: FundableKind) -> StoreResult<i64> {
        self.inner.next_id(kind).await
    }

    async fn get_by_id(&self, kind: FundableKind, id: i64) -> StoreResult<Option<Entity>> {
        self.inner.get_by_id(kind, id).await
    }

    async fn get_project_by_name(&self, name: &str) -> StoreResult<Option<Project>> {
        self.inner.get_project_by_name(name).await
    }

    async fn list_open(&self, kind: FundableKind) -> StoreResult<Vec<Entity>> {
        self.inner.list_open(kind).await
    }

    async fn list_projects(&self) -> StoreResult<Vec<Project>> {
        self.inner.list_projects().await
    }

    async fn list_donations(&self, donor_id: Option<Uuid>) -> StoreResult<Vec<Donation>> {
        self.inner.list_donations(donor_id).await
    }

    async fn list_allocations(&self, kind: FundableKind, id: i64) -> StoreResult<Vec<funding::Allocation>> {
        self.inner.list_allocations(kind, id).await
    }

    async fn commit_allocation(&self, _commit: AllocationCommit) -> StoreResult<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Conflict("simulated concurrent writer".to_string()))
    }

    async fn update_project(&self, project: &Project, expected_invested: u64) -> StoreResult<()> {
        self.inner.update_project(project, expected_invested).await
    }

    async fn delete_project(&self, id: i64) -> StoreResult<Project> {
        self.inner.delete_project(id).await
    }
}

#[tokio::test]
async fn test_conflict_retried_against_fresh_balances() {
    let store = Arc::new(InterferingStore::new(1, 7));
    let service = service_with(store.clone());

    let project = service.create_project(&admin(), project_input("Pantry", 10)).await.unwrap();

    // First commit loses to a writer that funds 7 of the 10; the retry sees 3 left
    let donation = service
        .create_donation(&Principal::donor(Uuid::new_v4()), donation_input(10))
        .await
        .unwrap();

    assert_eq!(donation.invested_amount(), 3);
    assert!(donation.is_open());

    let project = store.get_project(project.id).await.unwrap().unwrap();
    assert_eq!(project.invested_amount(), 10);
    assert!(!project.is_open());
    project.check_invariants().unwrap();
}

#[tokio::test]
async fn test_exhausted_retries_leave_no_partial_state() {
    let store = Arc::new(AlwaysConflictStore {
        inner: InMemoryFundingStore::new(),
        attempts: AtomicU32::new(0),
    });
    let service = service_with(store.clone());

    let result = service
        .create_donation(&Principal::donor(Uuid::new_v4()), donation_input(10))
        .await;

    assert_matches!(result, Err(ref e) if e.is_retryable());
    assert_eq!(store.attempts.load(Ordering::SeqCst), 4);
    assert!(store.list_donations(None).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_donations_never_overfund() {
    let store = Arc::new(InMemoryFundingStore::new());
    let service = Arc::new(service_with(store.clone()));

    let project = service.create_project(&admin(), project_input("Tiny", 10)).await.unwrap();

    let first = {
        let service = service.clone();
        tokio::spawn(async move {
            service
                .create_donation(&Principal::donor(Uuid::new_v4()), donation_input(10))
                .await
        })
    };
    let second = {
        let service = service.clone();
        tokio::spawn(async move {
            service
                .create_donation(&Principal::donor(Uuid::new_v4()), donation_input(10))
                .await
        })
    };
    let (first, second) = futures::join!(first, second);
    let first = first.unwrap().unwrap();
    let second = second.unwrap().unwrap();

    assert_eq!(first.invested_amount() + second.invested_amount(), 10);

    let project = store.get_project(project.id).await.unwrap().unwrap();
    assert_eq!(project.invested_amount(), 10);
    assert!(!project.is_open());

    assert_ledger_consistent(store.as_ref()).await;
}

/// Store wrapper that counts `refresh` calls and stamps a marker comment on
/// refreshed donations, so callers can tell a re-read value from a local one
struct RefreshTrackingStore {
    inner: InMemoryFundingStore,
    refreshes: AtomicU32,
}

#[async_trait]
impl FundingStore for RefreshTrackingStore {
    async fn next_id(&self, kind: FundableKind) -> StoreResult<i64> {
        self.inner.next_id(kind).await
    }

    async fn get_by_id(&self, kind: FundableKind, id: i64) -> StoreResult<Option<Entity>> {
        self.inner.get_by_id(kind, id).await
    }

    async fn get_project_by_name(&self, name: &str) -> StoreResult<Option<Project>> {
        self.inner.get_project_by_name(name).await
    }

    async fn list_open(&self, kind: FundableKind) -> StoreResult<Vec<Entity>> {
        self.inner.list_open(kind).await
    }

    async fn list_projects(&self) -> StoreResult<Vec<Project>> {
        self.inner.list_projects().await
    }

    async fn list_donations(&self, donor_id: Option<Uuid>) -> StoreResult<Vec<Donation>> {
        self.inner.list_donations(donor_id).await
    }

    async fn list_allocations(&self, kind: FundableKind, id: i64) -> StoreResult<Vec<funding::Allocation>> {
        self.inner.list_allocations(kind, id).await
    }

    async fn commit_allocation(&self, commit: AllocationCommit) -> StoreResult<()> {
        self.inner.commit_allocation(commit).await
    }

    async fn update_project(&self, project: &Project, expected_invested: u64) -> StoreResult<()> {
        self.inner.update_project(project, expected_invested).await
    }

    async fn delete_project(&self, id: i64) -> StoreResult<Project> {
        self.inner.delete_project(id).await
    }

    async fn refresh(&self, entity: &Entity) -> StoreResult<Entity> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        let mut stored = self.inner.refresh(entity).await?;
        if let Entity::Donation(donation) = &mut stored {
            donation.comment = Some("from store".to_string());
        }
        Ok(stored)
    }
}

#[tokio::test]
async fn test_created_entities_are_reread_after_commit() {
    let store = Arc::new(RefreshTrackingStore {
        inner: InMemoryFundingStore::new(),
        refreshes: AtomicU32::new(0),
    });
    let service = service_with(store.clone());

    let project = service.create_project(&admin(), project_input("Library", 20)).await.unwrap();
    let donation = service
        .create_donation(&Principal::donor(Uuid::new_v4()), donation_input(5))
        .await
        .unwrap();

    assert_eq!(store.refreshes.load(Ordering::SeqCst), 2);
    assert_eq!(donation.comment.as_deref(), Some("from store"));
    assert_eq!(donation.invested_amount(), 5);
    assert_eq!(project.invested_amount(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_donations_across_services_never_overfund() {
    let store = Arc::new(InMemoryFundingStore::new());
    // Separate services have separate allocation locks; only the
    // conditional commit keeps them from overfunding
    let first_service = Arc::new(service_with(store.clone()));
    let second_service = Arc::new(service_with(store.clone()));

    let project = first_service
        .create_project(&admin(), project_input("Tiny", 10))
        .await
        .unwrap();

    let first = {
        let service = first_service.clone();
        tokio::spawn(async move {
            service
                .create_donation(&Principal::donor(Uuid::new_v4()), donation_input(10))
                .await
        })
    };
    let second = {
        let service = second_service.clone();
        tokio::spawn(async move {
            service
                .create_donation(&Principal::donor(Uuid::new_v4()), donation_input(10))
                .await
        })
    };
    let (first, second) = futures::join!(first, second);
    let first = first.unwrap().unwrap();
    let second = second.unwrap().unwrap();

    assert_eq!(first.invested_amount() + second.invested_amount(), 10);

    let project = store.get_project(project.id).await.unwrap().unwrap();
    assert_eq!(project.invested_amount(), 10);
    assert!(!project.is_open());
    assert_eq!(
        store
            .list_allocations(FundableKind::Project, project.id)
            .await
            .unwrap()
            .len(),
        1
    );

    assert_ledger_consistent(store.as_ref()).await;
}
