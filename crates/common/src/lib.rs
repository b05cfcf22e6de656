//! Common types and utilities for CharityFund
//!
//! This crate provides shared types used across all CharityFund crates.
//!
//! # Modules
//!
//! - [`error`] - Common error types
//! - [`types`] - Shared domain types (FundableKind, Principal, Role)

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::*;
