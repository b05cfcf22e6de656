use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "cfund")]
#[command(about = "CharityFund - donations matched to charitable projects")]
#[command(version = "0.1.0")]
pub struct Cli {
    /// Log output format (overrides logging.format from the config)
    #[arg(long, value_enum, global = true, env = "CFUND_LOG_FORMAT")]
    pub log_format: Option<LogFormatArg>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new configuration file with all defaults
    Init {
        /// Output path for the new configuration file
        #[arg(short, long, default_value = "charity_fund.yaml")]
        output: PathBuf,
    },

    /// Validate a configuration file
    Validate {
        /// Path to the configuration file
        #[arg(short, long, default_value = "charity_fund.yaml")]
        config: PathBuf,
    },

    /// Run a scenario of project and donation steps and print the final ledger
    Replay {
        /// Path to the scenario file
        #[arg(short, long)]
        scenario: PathBuf,

        /// Path to the configuration file
        #[arg(short, long, default_value = "charity_fund.yaml")]
        config: PathBuf,

        /// Stop at the first failing step
        #[arg(long)]
        fail_fast: bool,

        /// Include the allocation history of every project or donation
        #[arg(long, value_name = "KIND")]
        history: Option<String>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormatArg {
    /// Human-readable, colored
    Pretty,
    /// One JSON object per line
    Json,
    /// Single-line
    Compact,
}

impl LogFormatArg {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogFormatArg::Pretty => "pretty",
            LogFormatArg::Json => "json",
            LogFormatArg::Compact => "compact",
        }
    }
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
