//! Common types used across CharityFund
//!
//! This module provides the fundamental domain types shared by the
//! funding core and the binary.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Kind of a fundable entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FundableKind {
    /// Money contributed by a donor
    Donation,
    /// Charitable project with a funding target
    Project,
}

impl FundableKind {
    /// Returns the kind a subject of this kind is matched against
    pub fn counterpart(&self) -> Self {
        match self {
            FundableKind::Donation => FundableKind::Project,
            FundableKind::Project => FundableKind::Donation,
        }
    }

    /// Table/label form of the kind
    pub fn as_str(&self) -> &'static str {
        match self {
            FundableKind::Donation => "donation",
            FundableKind::Project => "project",
        }
    }
}

impl std::fmt::Display for FundableKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for FundableKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "donation" | "donations" => Ok(FundableKind::Donation),
            "project" | "projects" | "charity_project" => Ok(FundableKind::Project),
            other => Err(Error::invalid_input(format!("unknown fundable kind: {}", other))),
        }
    }
}

/// Role of an authenticated caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Regular authenticated user, may donate and read own donations
    #[default]
    Donor,
    /// Administrative user, manages projects and reads all donations
    Admin,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Donor => write!(f, "donor"),
            Role::Admin => write!(f, "admin"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "donor" | "user" => Ok(Role::Donor),
            "admin" | "superuser" => Ok(Role::Admin),
            other => Err(Error::invalid_input(format!("unknown role: {}", other))),
        }
    }
}

/// Authenticated caller, as resolved by the surrounding service layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// Identity of the caller
    pub user_id: Uuid,
    /// Role granted to the caller
    pub role: Role,
}

impl Principal {
    /// Create a donor principal
    pub fn donor(user_id: Uuid) -> Self {
        Self { user_id, role: Role::Donor }
    }

    /// Create an admin principal
    pub fn admin(user_id: Uuid) -> Self {
        Self { user_id, role: Role::Admin }
    }

    /// Returns true if the caller holds the administrative role
    pub fn is_admin(&self) -> bool {
        matches!(self.role, Role::Admin)
    }

    /// Fail unless the caller is an admin
    pub fn require_admin(&self, action: &str) -> Result<()> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(Error::forbidden(format!(
                "{} requires the admin role (caller {} is {})",
                action, self.user_id, self.role
            )))
        }
    }
}
