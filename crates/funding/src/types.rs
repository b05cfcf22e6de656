//! Ledger domain types
//!
//! Donations and projects share one balance shape, [`Funding`], and expose it
//! through the [`Fundable`] capability trait. The matching engine only ever
//! talks to that trait.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use common::types::FundableKind;

/// Current time truncated to microseconds, the precision the stores persist
pub fn timestamp_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Balance fields shared by every fundable entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Funding {
    /// Target (project) or contribution (donation) amount
    pub full_amount: u64,
    /// Amount already allocated
    pub invested_amount: u64,
    /// True once `invested_amount == full_amount`
    pub fully_invested: bool,
    /// Creation timestamp, orders counterpart selection
    pub created_at: DateTime<Utc>,
    /// Set exactly once, when the entity becomes fully invested
    pub closed_at: Option<DateTime<Utc>>,
}

impl Funding {
    /// Fresh balance with nothing invested
    pub fn new(full_amount: u64, created_at: DateTime<Utc>) -> Self {
        Self {
            full_amount,
            invested_amount: 0,
            fully_invested: false,
            created_at,
            closed_at: None,
        }
    }

    /// `full_amount - invested_amount`
    pub fn remaining(&self) -> u64 {
        self.full_amount.saturating_sub(self.invested_amount)
    }

    /// Record an allocation. Never pushes the balance past `full_amount`.
    pub fn add_invested(&mut self, amount: u64) {
        debug_assert!(amount <= self.remaining(), "allocation exceeds remaining amount");
        self.invested_amount = self
            .invested_amount
            .saturating_add(amount)
            .min(self.full_amount);
    }

    /// Mark as fully invested. `closed_at` is only ever set once.
    pub fn close(&mut self, now: DateTime<Utc>) {
        self.invested_amount = self.full_amount;
        self.fully_invested = true;
        if self.closed_at.is_none() {
            self.closed_at = Some(now);
        }
    }

    /// Check the balance invariants, returning the first violation
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.invested_amount > self.full_amount {
            return Err(format!(
                "invested_amount {} exceeds full_amount {}",
                self.invested_amount, self.full_amount
            ));
        }
        if self.fully_invested != (self.invested_amount == self.full_amount) {
            return Err(format!(
                "fully_invested={} but invested {} of {}",
                self.fully_invested, self.invested_amount, self.full_amount
            ));
        }
        if self.closed_at.is_some() != self.fully_invested {
            return Err(format!(
                "closed_at={:?} disagrees with fully_invested={}",
                self.closed_at, self.fully_invested
            ));
        }
        Ok(())
    }
}

/// Capability shared by donations and projects
pub trait Fundable {
    /// Which ledger this entity lives in
    fn kind(&self) -> FundableKind;

    /// Store-assigned identifier
    fn id(&self) -> i64;

    /// Balance fields
    fn funding(&self) -> &Funding;

    /// Mutable balance fields
    fn funding_mut(&mut self) -> &mut Funding;

    fn remaining(&self) -> u64 {
        self.funding().remaining()
    }

    fn is_open(&self) -> bool {
        !self.funding().fully_invested
    }

    fn full_amount(&self) -> u64 {
        self.funding().full_amount
    }

    fn invested_amount(&self) -> u64 {
        self.funding().invested_amount
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.funding().created_at
    }

    fn add_invested(&mut self, amount: u64) {
        self.funding_mut().add_invested(amount);
    }

    fn close(&mut self, now: DateTime<Utc>) {
        self.funding_mut().close(now);
    }

    fn check_invariants(&self) -> Result<(), String> {
        self.funding()
            .check_invariants()
            .map_err(|e| format!("{} {}: {}", self.kind(), self.id(), e))
    }
}

/// Money contributed by a donor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Donation {
    /// Unique donation identifier
    pub id: i64,
    /// Donor who made the contribution
    pub donor_id: Uuid,
    /// Free-text note, no role in matching
    pub comment: Option<String>,
    #[serde(flatten)]
    pub funding: Funding,
}

impl Donation {
    /// Create a new, unallocated donation
    pub fn new(id: i64, donor_id: Uuid, full_amount: u64, comment: Option<String>) -> Self {
        Self {
            id,
            donor_id,
            comment,
            funding: Funding::new(full_amount, timestamp_now()),
        }
    }
}

impl Fundable for Donation {
    fn kind(&self) -> FundableKind {
        FundableKind::Donation
    }

    fn id(&self) -> i64 {
        self.id
    }

    fn funding(&self) -> &Funding {
        &self.funding
    }

    fn funding_mut(&mut self) -> &mut Funding {
        &mut self.funding
    }
}

/// Charitable project with a funding target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    /// Unique project identifier
    pub id: i64,
    /// Unique project name
    pub name: String,
    /// Project description
    pub description: String,
    #[serde(flatten)]
    pub funding: Funding,
}

impl Project {
    /// Create a new, unfunded project
    pub fn new(id: i64, name: String, description: String, full_amount: u64) -> Self {
        Self {
            id,
            name,
            description,
            funding: Funding::new(full_amount, timestamp_now()),
        }
    }
}

impl Fundable for Project {
    fn kind(&self) -> FundableKind {
        FundableKind::Project
    }

    fn id(&self) -> i64 {
        self.id
    }

    fn funding(&self) -> &Funding {
        &self.funding
    }

    fn funding_mut(&mut self) -> &mut Funding {
        &mut self.funding
    }
}

/// A fundable entity tagged with its kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Entity {
    Donation(Donation),
    Project(Project),
}

impl Entity {
    pub fn as_project(&self) -> Option<&Project> {
        match self {
            Entity::Project(p) => Some(p),
            Entity::Donation(_) => None,
        }
    }

    pub fn into_project(self) -> Option<Project> {
        match self {
            Entity::Project(p) => Some(p),
            Entity::Donation(_) => None,
        }
    }

    pub fn into_donation(self) -> Option<Donation> {
        match self {
            Entity::Donation(d) => Some(d),
            Entity::Project(_) => None,
        }
    }
}

impl Fundable for Entity {
    fn kind(&self) -> FundableKind {
        match self {
            Entity::Donation(_) => FundableKind::Donation,
            Entity::Project(_) => FundableKind::Project,
        }
    }

    fn id(&self) -> i64 {
        match self {
            Entity::Donation(d) => d.id,
            Entity::Project(p) => p.id,
        }
    }

    fn funding(&self) -> &Funding {
        match self {
            Entity::Donation(d) => &d.funding,
            Entity::Project(p) => &p.funding,
        }
    }

    fn funding_mut(&mut self) -> &mut Funding {
        match self {
            Entity::Donation(d) => &mut d.funding,
            Entity::Project(p) => &mut p.funding,
        }
    }
}

impl From<Donation> for Entity {
    fn from(d: Donation) -> Self {
        Entity::Donation(d)
    }
}

impl From<Project> for Entity {
    fn from(p: Project) -> Self {
        Entity::Project(p)
    }
}

/// Audit record of one transfer between a donation and a project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub donation_id: i64,
    pub project_id: i64,
    pub amount: u64,
    pub allocated_at: DateTime<Utc>,
}

impl Allocation {
    /// Build the record for a transfer between `subject` and `counterpart`
    pub fn between(
        subject_kind: FundableKind,
        subject_id: i64,
        counterpart_id: i64,
        amount: u64,
        allocated_at: DateTime<Utc>,
    ) -> Self {
        let (donation_id, project_id) = match subject_kind {
            FundableKind::Donation => (subject_id, counterpart_id),
            FundableKind::Project => (counterpart_id, subject_id),
        };
        Self {
            donation_id,
            project_id,
            amount,
            allocated_at,
        }
    }

    /// Returns true if this allocation involves the given entity
    pub fn involves(&self, kind: FundableKind, id: i64) -> bool {
        match kind {
            FundableKind::Donation => self.donation_id == id,
            FundableKind::Project => self.project_id == id,
        }
    }
}

/// Input for creating a donation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDonation {
    pub full_amount: u64,
    #[serde(default)]
    pub comment: Option<String>,
}

/// Input for creating a project
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewProject {
    pub name: String,
    pub description: String,
    pub full_amount: u64,
}

/// Partial edit of an open project
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub full_amount: Option<u64>,
}

impl ProjectUpdate {
    /// Returns true if no field is set
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.description.is_none() && self.full_amount.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_donation_new() {
        let donation = Donation::new(1, Uuid::new_v4(), 100, Some("for the cats".to_string()));

        assert_eq!(donation.remaining(), 100);
        assert_eq!(donation.invested_amount(), 0);
        assert!(donation.is_open());
        assert!(donation.funding.closed_at.is_none());
        assert!(donation.check_invariants().is_ok());
    }

    #[test]
    fn test_add_invested_and_close() {
        let mut project = Project::new(1, "Shelter".to_string(), "Roof".to_string(), 50);

        project.add_invested(20);
        assert_eq!(project.remaining(), 30);
        assert!(project.is_open());

        let now = timestamp_now();
        project.add_invested(30);
        project.close(now);

        assert!(!project.is_open());
        assert_eq!(project.funding.closed_at, Some(now));
        assert!(project.check_invariants().is_ok());
    }

    #[test]
    fn test_close_sets_timestamp_once() {
        let mut project = Project::new(1, "Shelter".to_string(), "Roof".to_string(), 10);
        let first = timestamp_now();
        project.close(first);
        project.close(first + chrono::Duration::seconds(5));

        assert_eq!(project.funding.closed_at, Some(first));
    }

    #[test]
    fn test_invariant_violations_detected() {
        let mut funding = Funding::new(10, timestamp_now());
        funding.invested_amount = 10;
        assert!(funding.check_invariants().is_err());

        funding.fully_invested = true;
        assert!(funding.check_invariants().is_err());

        funding.closed_at = Some(timestamp_now());
        assert!(funding.check_invariants().is_ok());
    }

    #[test]
    fn test_entity_dispatch() {
        let entity: Entity = Donation::new(7, Uuid::new_v4(), 5, None).into();
        assert_eq!(entity.kind(), FundableKind::Donation);
        assert_eq!(entity.id(), 7);
        assert!(entity.as_project().is_none());
        assert!(entity.into_donation().is_some());
    }

    #[test]
    fn test_entity_serializes_with_kind_tag() {
        let entity: Entity = Project::new(3, "Food".to_string(), "Kibble".to_string(), 40).into();
        let json = serde_json::to_value(&entity).unwrap();

        assert_eq!(json["kind"], "project");
        assert_eq!(json["full_amount"], 40);
        assert_eq!(json["fully_invested"], false);
    }

    #[test]
    fn test_allocation_between() {
        let now = timestamp_now();
        let a = Allocation::between(FundableKind::Donation, 1, 9, 5, now);
        assert_eq!((a.donation_id, a.project_id), (1, 9));

        let b = Allocation::between(FundableKind::Project, 9, 1, 5, now);
        assert_eq!((b.donation_id, b.project_id), (1, 9));
        assert!(b.involves(FundableKind::Project, 9));
        assert!(!b.involves(FundableKind::Donation, 9));
    }
}
