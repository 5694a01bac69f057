use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "usage-ledger", version, about = "Usage accounting ledger for the AI bridge server")]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml", global = true)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Open the store and apply pending migrations
    Migrate,

    /// Record one completed request
    Record(RecordArgs),

    /// Show aggregated usage (default)
    Usage(UsageArgs),

    /// Model pricing management
    Pricing {
        #[command(subcommand)]
        action: PricingCommands,
    },

    /// Check aggregate tables against raw records
    Verify {
        /// Rebuild aggregates from raw records if they disagree
        #[arg(short, long)]
        repair: bool,
    },

    /// Show version information
    Version,
}

#[derive(Args, Debug, Clone)]
pub struct RecordArgs {
    #[arg(short, long)]
    pub model: String,

    #[arg(long)]
    pub prompt_tokens: i64,

    #[arg(long)]
    pub completion_tokens: i64,

    /// Request type (ask, review, analyze, ...)
    #[arg(short, long)]
    pub kind: String,

    #[arg(short, long)]
    pub session: String,

    #[arg(short, long)]
    pub user: Option<String>,

    /// Provider-reported total cost, used for unpriced models under `caller_cost`
    #[arg(long)]
    pub cost: Option<f64>,

    /// Metadata entry as key=value (repeatable)
    #[arg(long = "meta", value_parser = parse_key_value)]
    pub meta: Vec<(String, String)>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct UsageArgs {
    /// all, today, month, session or range
    #[arg(short, long, default_value = "all")]
    pub period: String,

    /// Session id, required for the session period
    #[arg(short, long)]
    pub session: Option<String>,

    /// Restrict to one model
    #[arg(short, long)]
    pub model: Option<String>,

    /// First local date of a range (YYYY-MM-DD)
    #[arg(long)]
    pub from: Option<NaiveDate>,

    /// Last local date of a range (YYYY-MM-DD), inclusive
    #[arg(long)]
    pub to: Option<NaiveDate>,

    /// Also list the most recent individual requests
    #[arg(short, long)]
    pub detailed: bool,

    /// Number of requests listed with --detailed
    #[arg(short = 'n', long, default_value = "20")]
    pub limit: u32,

    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum PricingCommands {
    /// Set per-million-token prices for a model
    Set {
        model: String,
        /// Prompt price per million tokens
        prompt: f64,
        /// Completion price per million tokens
        completion: f64,
    },

    /// List all configured prices
    List,

    /// Import prices from a TOML file
    Import { file: PathBuf },
}

impl Cli {
    /// Get the command to execute, defaulting to an all-time usage report
    pub fn get_command(&self) -> Commands {
        self.command.clone().unwrap_or(Commands::Usage(UsageArgs {
            period: "all".to_string(),
            limit: 20,
            ..UsageArgs::default()
        }))
    }
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", s))?;
    if key.trim().is_empty() {
        return Err(format!("empty key in '{}'", s));
    }
    Ok((key.trim().to_string(), value.to_string()))
}
