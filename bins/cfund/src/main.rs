//! CharityFund CLI Binary
//!
//! Entry point for the `cfund` command: creating and validating
//! configuration files and replaying funding scenarios against the
//! configured store.

mod scenario;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use cli::{Cli, Commands, LogFormatArg};
use config::{
    generate_default_config, load_config, save_config, validate_config, DatabaseConfig,
    MasterConfig,
};
use funding::{
    AllocationSettings, FundableKind, FundingService, FundingStore, InMemoryFundingStore,
    PostgresFundingStore,
};
use observability::{init_logging, init_metrics, LogFormat};
use tracing::{debug, error, info, warn};

use crate::scenario::{Replayer, Scenario};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();

    match cli.command {
        Commands::Init { output } => {
            init_logging("cfund", log_format(cli.log_format, None))?;
            info!("Executing 'init' command");
            init_command(output)
        }
        Commands::Validate { config } => {
            init_logging("cfund", log_format(cli.log_format, None))?;
            info!("Executing 'validate' command");
            validate_command(config)
        }
        Commands::Replay {
            scenario,
            config,
            fail_fast,
            history,
        } => {
            let history = history
                .map(|kind| kind.parse::<FundableKind>())
                .transpose()
                .context("Invalid --history kind")?;
            let config = load_config(&config)?;
            init_logging("cfund", log_format(cli.log_format, Some(&config)))?;
            info!("Executing 'replay' command");
            replay_command(config, scenario, fail_fast, history).await
        }
    }
}

/// CLI flag wins over the config file; unknown names fall back to pretty
fn log_format(flag: Option<LogFormatArg>, config: Option<&MasterConfig>) -> LogFormat {
    let name = match flag {
        Some(flag) => Some(flag.as_str()),
        None => config.map(|c| c.logging.format.as_str()),
    };
    name.and_then(LogFormat::parse).unwrap_or_default()
}

fn init_command<P: AsRef<Path>>(output_path: P) -> Result<()> {
    let output_path = output_path.as_ref();
    info!(?output_path, "Initializing new configuration file");

    let config = generate_default_config();

    if let Some(parent) = output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {:?}", parent))?;
    }

    save_config(&config, output_path)?;

    println!("[ok] Configuration file created successfully!");
    println!();
    println!("Location: {:?}", output_path);
    println!();
    println!("Next steps:");
    println!("  1. Set CFUND_ADMIN_PASSWORD (or edit admin.password)");
    println!("  2. Point database.url at PostgreSQL for persistent storage");
    println!(
        "  3. Run 'cfund validate --config {:?}' to check configuration",
        output_path
    );

    Ok(())
}

fn validate_command<P: AsRef<Path>>(config_path: P) -> Result<()> {
    info!(path = ?config_path.as_ref(), "Validating configuration");

    let config = match load_config(&config_path) {
        Ok(c) => c,
        Err(e) => {
            error!(%e, "Failed to load configuration");
            anyhow::bail!(e);
        }
    };

    let report = validate_config(&config);

    println!("\n=== Configuration Validation Report ===\n");

    if !report.defaults_applied.is_empty() {
        println!("Defaults Applied ({}):", report.defaults_applied.len());
        for default in &report.defaults_applied {
            println!("  [info] {} = {}", default.field, default.value);
        }
        println!();
    }

    if !report.warnings.is_empty() {
        println!("Warnings ({}):", report.warnings.len());
        for warning in &report.warnings {
            println!("  [warn] [{}] {}", warning.field, warning.message);
        }
        println!();
    }

    if !report.errors.is_empty() {
        println!("Errors ({}):", report.errors.len());
        for err in &report.errors {
            println!("  [error] {}", err);
        }
        println!();
        anyhow::bail!("Configuration validation failed");
    }

    println!("[ok] Configuration is valid!");
    println!();
    println!("Fund: {}", config.fund.name);
    println!("Version: {}", config.fund.version);
    println!(
        "Store: {}",
        if config.database.is_in_memory() { "in-memory" } else { "postgres" }
    );
    println!(
        "Commit retries: {} (backoff {} ms)",
        config.allocation.max_commit_retries, config.allocation.retry_backoff_ms
    );

    Ok(())
}

async fn open_store(db: &DatabaseConfig) -> Result<Arc<dyn FundingStore>> {
    if db.is_in_memory() {
        info!("Using in-memory funding store");
        return Ok(Arc::new(InMemoryFundingStore::new()));
    }

    let store = PostgresFundingStore::connect(
        &db.url,
        db.max_connections,
        Duration::from_secs(db.connect_timeout_secs),
    )
    .await
    .context("Failed to connect to PostgreSQL")?;

    info!(max_connections = db.max_connections, "Using PostgreSQL funding store");
    Ok(Arc::new(store))
}

async fn replay_command<P: AsRef<Path>>(
    config: MasterConfig,
    scenario_path: P,
    fail_fast: bool,
    history: Option<FundableKind>,
) -> Result<()> {
    let scenario_path = scenario_path.as_ref();

    let report = validate_config(&config);
    for warning in &report.warnings {
        warn!(field = %warning.field, message = %warning.message, "Configuration warning");
    }
    if !report.is_valid() {
        for err in &report.errors {
            error!("{}", err);
        }
        anyhow::bail!("Cannot replay due to configuration errors");
    }

    if let Some(metrics) = config.metrics.as_ref().filter(|m| m.enabled) {
        init_metrics(metrics.port)?;
    }

    let content = std::fs::read_to_string(scenario_path)
        .with_context(|| format!("Failed to read scenario file: {:?}", scenario_path))?;
    let scenario = Scenario::from_yaml(&content)?;
    debug!(steps = scenario.steps.len(), actors = scenario.actors.len(), "Scenario parsed");

    let store = open_store(&config.database).await?;
    let settings = AllocationSettings {
        max_commit_retries: config.allocation.max_commit_retries,
        retry_backoff: Duration::from_millis(config.allocation.retry_backoff_ms),
    };
    let service = FundingService::new(store, settings);

    let replayer = Replayer::new(&service, &scenario.actors, config.admin.is_some())?;
    let result = replayer
        .run(&config.fund.name, scenario.steps, fail_fast, history)
        .await?;

    info!(
        steps = result.steps.len(),
        failed = result.failed_steps(),
        projects = result.projects.len(),
        donations = result.donations.len(),
        allocations = result.allocations.len(),
        "Replay finished"
    );
    println!("{}", serde_json::to_string_pretty(&result)?);

    Ok(())
}
