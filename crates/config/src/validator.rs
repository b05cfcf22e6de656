use crate::*;
use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

/// Minimum length for the bootstrap admin password
pub const MIN_ADMIN_PASSWORD_LEN: usize = 8;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Fund name is required")]
    MissingFundName,

    #[error("Fund description is required")]
    MissingFundDescription,

    #[error("Invalid version format: {0}. Must be in format X.Y.Z (e.g., 1.0.0)")]
    InvalidVersionFormat(String),

    #[error("Database: {message}")]
    InvalidDatabase { message: String },

    #[error("{field} must be a positive integer")]
    InvalidPositiveInteger { field: String },

    #[error("Admin: {message}")]
    InvalidAdmin { message: String },

    #[error("Invalid log format: {0}. Must be one of: pretty, json, compact")]
    InvalidLogFormat(String),

    #[error("Environment variable '{var}' is missing or invalid: {message}")]
    InvalidEnvVar { var: String, message: String },
}

#[derive(Debug, Clone)]
pub struct ValidationWarning {
    pub field: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct DefaultApplied {
    pub field: String,
    pub value: String,
}

#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
    pub defaults_applied: Vec<DefaultApplied>,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self {
            errors: Vec::new(),
            warnings: Vec::new(),
            defaults_applied: Vec::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, field: &str, message: &str) {
        self.warnings.push(ValidationWarning {
            field: field.to_string(),
            message: message.to_string(),
        });
    }

    pub fn add_default(&mut self, field: &str, value: &str) {
        self.defaults_applied.push(DefaultApplied {
            field: field.to_string(),
            value: value.to_string(),
        });
    }
}

impl Default for ValidationReport {
    fn default() -> Self {
        Self::new()
    }
}

fn version_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\d+\.\d+\.\d+$").expect("version pattern is a valid regex"))
}

fn email_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("email pattern is a valid regex")
    })
}

pub fn validate_config(config: &MasterConfig) -> ValidationReport {
    let mut report = ValidationReport::new();

    validate_fund(&config.fund, &mut report);
    validate_database(&config.database, &mut report);
    validate_admin(config.admin.as_ref(), &mut report);
    validate_allocation(&config.allocation, &mut report);

    if !["pretty", "json", "compact"].contains(&config.logging.format.to_lowercase().as_str()) {
        report.add_error(ValidationError::InvalidLogFormat(config.logging.format.clone()));
    }

    match &config.metrics {
        Some(metrics) if metrics.enabled && metrics.port == 0 => {
            report.add_error(ValidationError::InvalidPositiveInteger {
                field: "metrics.port".to_string(),
            });
        }
        Some(_) => {}
        None => report.add_default("metrics", "disabled"),
    }

    report
}

fn check_env_placeholders(field: &str, value: &str, report: &mut ValidationReport) {
    for var in substitution::unresolved_env_vars(value) {
        report.add_error(ValidationError::InvalidEnvVar {
            var,
            message: format!("referenced by {} but not set", field),
        });
    }
}

fn validate_fund(fund: &FundConfig, report: &mut ValidationReport) {
    if fund.name.trim().is_empty() {
        report.add_error(ValidationError::MissingFundName);
    }
    check_env_placeholders("fund.name", &fund.name, report);

    if fund.description.trim().is_empty() {
        report.add_error(ValidationError::MissingFundDescription);
    }

    if !version_pattern().is_match(&fund.version) {
        report.add_error(ValidationError::InvalidVersionFormat(fund.version.clone()));
    }
}

fn validate_database(db: &DatabaseConfig, report: &mut ValidationReport) {
    if substitution::has_unresolved_env_vars(&db.url) {
        check_env_placeholders("database.url", &db.url, report);
    } else if db.is_in_memory() {
        report.add_default("database.url", IN_MEMORY_DATABASE_URL);
        report.add_warning(
            "database.url",
            "Using the in-memory store; all data is lost on exit",
        );
    } else {
        match url::Url::parse(&db.url) {
            Ok(parsed) if matches!(parsed.scheme(), "postgres" | "postgresql") => {
                if parsed.host_str().map_or(true, str::is_empty) {
                    report.add_error(ValidationError::InvalidDatabase {
                        message: "database.url must include a host".to_string(),
                    });
                }
            }
            Ok(parsed) => report.add_error(ValidationError::InvalidDatabase {
                message: format!(
                    "Unsupported scheme '{}'. Must be one of: memory, postgres, postgresql",
                    parsed.scheme()
                ),
            }),
            Err(e) => report.add_error(ValidationError::InvalidDatabase {
                message: format!("Invalid database.url: {}", e),
            }),
        }
    }

    if db.max_connections == 0 {
        report.add_error(ValidationError::InvalidPositiveInteger {
            field: "database.max_connections".to_string(),
        });
    }
    if db.connect_timeout_secs == 0 {
        report.add_error(ValidationError::InvalidPositiveInteger {
            field: "database.connect_timeout_secs".to_string(),
        });
    }
}

fn validate_admin(admin: Option<&AdminConfig>, report: &mut ValidationReport) {
    let Some(admin) = admin else {
        report.add_warning(
            "admin",
            "No bootstrap admin configured; projects cannot be managed until one exists",
        );
        return;
    };

    if !email_pattern().is_match(&admin.email) {
        report.add_error(ValidationError::InvalidAdmin {
            message: format!("Invalid email address '{}'", admin.email),
        });
    }

    if substitution::has_unresolved_env_vars(&admin.password) {
        check_env_placeholders("admin.password", &admin.password, report);
    } else if admin.password.chars().count() < MIN_ADMIN_PASSWORD_LEN {
        report.add_error(ValidationError::InvalidAdmin {
            message: format!(
                "password must be at least {} characters",
                MIN_ADMIN_PASSWORD_LEN
            ),
        });
    }
}

fn validate_allocation(allocation: &AllocationConfig, report: &mut ValidationReport) {
    if allocation.max_commit_retries == 0 {
        report.add_warning(
            "allocation.max_commit_retries",
            "Commit conflicts will be reported to callers without retrying",
        );
    }
    if allocation.retry_backoff_ms == 0 {
        report.add_warning(
            "allocation.retry_backoff_ms",
            "Retries happen immediately with no backoff",
        );
    }
}
