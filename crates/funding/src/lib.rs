//! Donation and project ledger for CharityFund
//!
//! This crate owns the funding domain: the entities, the investment
//! matching engine and the persistence seam.
//!
//! # Features
//!
//! - Donations and charitable projects sharing one funding model
//! - First-come-first-served matching between donations and projects
//! - Atomic allocation commits with optimistic conflict detection
//! - Edit and deletion guards for projects
//! - Allocation audit history
//!
//! # Feature Flags
//!
//! - `postgres` - Enable PostgreSQL storage

pub mod error;
pub mod guards;
pub mod matching;
pub mod service;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use error::{FundingError, Result};
pub use matching::{run_matching, MatchResult};
pub use service::{AllocationSettings, FundingService};
pub use types::{
    timestamp_now, Allocation, Donation, Entity, Fundable, FundableKind, Funding, NewDonation,
    NewProject, Project, ProjectUpdate,
};

// Store exports
pub use store::memory::InMemoryFundingStore;
pub use store::traits::{AllocationCommit, FundingStore, StoreError, StoreResult, TouchedEntity};

#[cfg(feature = "postgres")]
pub use store::postgres::PostgresFundingStore;
