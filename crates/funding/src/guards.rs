//! Precondition checks run before any mutation
//!
//! Project lifecycle is `OPEN -> CLOSED`, with CLOSED terminal. Everything
//! here is synchronous and side-effect free except [`apply_update`], which
//! mutates the project it is given once all checks have passed.

use chrono::{DateTime, Utc};

use crate::error::{FundingError, Result};
use crate::types::{Fundable, NewDonation, NewProject, Project, ProjectUpdate};

/// Maximum project name length, in characters
pub const MAX_NAME_LEN: usize = 100;

fn validate_name(name: &str) -> Result<()> {
    let len = name.chars().count();
    if name.trim().is_empty() {
        return Err(FundingError::Validation("Project name must not be empty".to_string()));
    }
    if len > MAX_NAME_LEN {
        return Err(FundingError::Validation(format!(
            "Project name must be at most {} characters, got {}",
            MAX_NAME_LEN, len
        )));
    }
    Ok(())
}

fn validate_description(description: &str) -> Result<()> {
    if description.trim().is_empty() {
        return Err(FundingError::Validation(
            "Project description must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn validate_amount(amount: u64) -> Result<()> {
    if amount == 0 {
        return Err(FundingError::Validation(
            "full_amount must be greater than 0".to_string(),
        ));
    }
    Ok(())
}

/// Validate input for a new project
pub fn validate_new_project(input: &NewProject) -> Result<()> {
    validate_name(&input.name)?;
    validate_description(&input.description)?;
    validate_amount(input.full_amount)
}

/// Validate input for a new donation
pub fn validate_new_donation(input: &NewDonation) -> Result<()> {
    validate_amount(input.full_amount)
}

/// Reject if `name` belongs to a project other than `editing_id`
pub fn check_name_available(name: &str, holder: Option<&Project>, editing_id: Option<i64>) -> Result<()> {
    match holder {
        Some(existing) if Some(existing.id) != editing_id => {
            Err(FundingError::DuplicateName(name.to_string()))
        }
        _ => Ok(()),
    }
}

/// Reject edits of a closed project
pub fn check_project_open(project: &Project) -> Result<()> {
    if project.is_open() {
        Ok(())
    } else {
        Err(FundingError::EntityClosed {
            kind: project.kind(),
            id: project.id,
        })
    }
}

/// Reject deletion of a project that received funds or is closed
///
/// Both conditions are checked on their own even though a closed project
/// always has a positive invested amount.
pub fn check_deletable(project: &Project) -> Result<()> {
    if project.invested_amount() > 0 {
        return Err(FundingError::NonZeroInvestment {
            id: project.id,
            invested: project.invested_amount(),
        });
    }
    if project.funding.fully_invested {
        return Err(FundingError::EntityClosed {
            kind: project.kind(),
            id: project.id,
        });
    }
    Ok(())
}

/// Check and apply an edit to an open project
///
/// Lowering `full_amount` to exactly the invested amount closes the project
/// as part of the same edit.
pub fn apply_update(project: &mut Project, update: ProjectUpdate, now: DateTime<Utc>) -> Result<()> {
    if update.is_empty() {
        return Err(FundingError::Validation("Update has no fields set".to_string()));
    }
    check_project_open(project)?;

    if let Some(full_amount) = update.full_amount {
        let invested = project.invested_amount();
        if full_amount < invested {
            return Err(FundingError::InvalidAmount {
                requested: full_amount,
                invested,
            });
        }
        validate_amount(full_amount)?;
    }
    if let Some(name) = &update.name {
        validate_name(name)?;
    }
    if let Some(description) = &update.description {
        validate_description(description)?;
    }

    if let Some(name) = update.name {
        project.name = name;
    }
    if let Some(description) = update.description {
        project.description = description;
    }
    if let Some(full_amount) = update.full_amount {
        project.funding.full_amount = full_amount;
        if full_amount == project.invested_amount() {
            project.close(now);
        }
    }

    Ok(())
}
