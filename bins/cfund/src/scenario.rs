//! Scenario files for `cfund replay`
//!
//! A scenario names its actors and lists steps run in order:
//!
//! Roles accept the aliases understood by `Role::from_str` (`user`,
//! `superuser`).
//!
//! ```yaml
//! actors:
//!   admin: admin
//!   alice: donor
//! steps:
//!   - actor: admin
//!     action: create_project
//!     name: Shelter
//!     description: Roof repair
//!     full_amount: 50
//!   - actor: alice
//!     action: create_donation
//!     full_amount: 60
//! ```

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use common::types::{FundableKind, Principal, Role};
use funding::{
    Allocation, Donation, Fundable, FundingError, FundingService, NewDonation, NewProject, Project,
    ProjectUpdate,
};

/// Name of the actor backed by the configured bootstrap admin
pub const BOOTSTRAP_ADMIN: &str = "admin";

#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    /// Actor name to role name
    #[serde(default)]
    pub actors: BTreeMap<String, String>,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Step {
    pub actor: String,
    #[serde(flatten)]
    pub action: Action,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    CreateProject {
        name: String,
        description: String,
        full_amount: u64,
    },
    CreateDonation {
        full_amount: u64,
        #[serde(default)]
        comment: Option<String>,
    },
    /// Edit a project, referenced by its current name
    UpdateProject {
        project: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        full_amount: Option<u64>,
    },
    DeleteProject {
        project: String,
    },
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::CreateProject { .. } => "create_project",
            Action::CreateDonation { .. } => "create_donation",
            Action::UpdateProject { .. } => "update_project",
            Action::DeleteProject { .. } => "delete_project",
        }
    }
}

impl Scenario {
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse scenario")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepOutcome {
    pub index: usize,
    pub actor: String,
    pub action: &'static str,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplayReport {
    pub fund: String,
    pub steps: Vec<StepOutcome>,
    pub projects: Vec<Project>,
    pub donations: Vec<Donation>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allocations: Vec<Allocation>,
}

impl ReplayReport {
    pub fn failed_steps(&self) -> usize {
        self.steps.iter().filter(|s| !s.ok).count()
    }
}

/// Runs scenario steps against a [`FundingService`]
pub struct Replayer<'a> {
    service: &'a FundingService,
    principals: BTreeMap<String, Principal>,
    /// Admin identity used to read the final ledger
    auditor: Principal,
}

impl<'a> Replayer<'a> {
    /// Assign an identity to every declared actor
    ///
    /// With `bootstrap_admin` set, an undeclared `admin` actor is added.
    pub fn new(
        service: &'a FundingService,
        actors: &BTreeMap<String, String>,
        bootstrap_admin: bool,
    ) -> Result<Self> {
        let mut principals = BTreeMap::new();
        for (name, role) in actors {
            let role: Role = role
                .parse()
                .with_context(|| format!("actor '{}' has an invalid role", name))?;
            let principal = Principal {
                user_id: Uuid::new_v4(),
                role,
            };
            principals.insert(name.clone(), principal);
        }
        if bootstrap_admin {
            principals
                .entry(BOOTSTRAP_ADMIN.to_string())
                .or_insert_with(|| Principal::admin(Uuid::new_v4()));
        }
        Ok(Self {
            service,
            principals,
            auditor: Principal::admin(Uuid::new_v4()),
        })
    }

    /// Run every step, then read back the ledger
    ///
    /// With `history` set, the allocation history of every entity of that
    /// kind is included in the report.
    pub async fn run(
        &self,
        fund: &str,
        steps: Vec<Step>,
        fail_fast: bool,
        history: Option<FundableKind>,
    ) -> Result<ReplayReport> {
        let mut outcomes = Vec::with_capacity(steps.len());

        for (index, step) in steps.into_iter().enumerate() {
            let action = step.action.as_str();
            let outcome = match self.run_step(&step).await {
                Ok(entity_id) => {
                    info!(index, actor = %step.actor, action, entity_id, "Step applied");
                    StepOutcome {
                        index,
                        actor: step.actor,
                        action,
                        ok: true,
                        entity_id: Some(entity_id),
                        error: None,
                    }
                }
                Err(e) => {
                    warn!(index, actor = %step.actor, action, error = %e, "Step failed");
                    StepOutcome {
                        index,
                        actor: step.actor,
                        action,
                        ok: false,
                        entity_id: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            let failed = !outcome.ok;
            outcomes.push(outcome);
            if failed && fail_fast {
                break;
            }
        }

        let projects = self.service.list_projects().await?;
        let donations = self.service.list_donations(&self.auditor).await?;

        let mut allocations = Vec::new();
        if let Some(kind) = history {
            let ids: Vec<i64> = match kind {
                FundableKind::Project => projects.iter().map(|p| p.id).collect(),
                FundableKind::Donation => donations.iter().map(|d| d.id).collect(),
            };
            for id in ids {
                allocations.extend(self.service.allocation_history(&self.auditor, kind, id).await?);
            }
        }

        Ok(ReplayReport {
            fund: fund.to_string(),
            steps: outcomes,
            projects,
            donations,
            allocations,
        })
    }

    async fn run_step(&self, step: &Step) -> Result<i64> {
        let principal = self
            .principals
            .get(&step.actor)
            .ok_or_else(|| anyhow!("unknown actor '{}'", step.actor))?;

        let id = match step.action.clone() {
            Action::CreateProject {
                name,
                description,
                full_amount,
            } => {
                let input = NewProject {
                    name,
                    description,
                    full_amount,
                };
                self.service.create_project(principal, input).await?.id()
            }
            Action::CreateDonation {
                full_amount,
                comment,
            } => {
                let input = NewDonation {
                    full_amount,
                    comment,
                };
                self.service.create_donation(principal, input).await?.id()
            }
            Action::UpdateProject {
                project,
                name,
                description,
                full_amount,
            } => {
                let id = self.resolve_project(&project).await?;
                let update = ProjectUpdate {
                    name,
                    description,
                    full_amount,
                };
                self.service.update_project(principal, id, update).await?.id()
            }
            Action::DeleteProject { project } => {
                let id = self.resolve_project(&project).await?;
                self.service.delete_project(principal, id).await?.id()
            }
        };
        Ok(id)
    }

    async fn resolve_project(&self, name: &str) -> Result<i64> {
        let project = self
            .service
            .store()
            .get_project_by_name(name)
            .await
            .map_err(FundingError::from)?
            .ok_or_else(|| anyhow!("no project named '{}'", name))?;
        Ok(project.id)
    }
}
