use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;

use usage_ledger::init_tracing;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();

    init_tracing();

    match args.get_command() {
        cli::Commands::Migrate => {
            commands::migrate::execute(&args.config).await?;
        }
        cli::Commands::Record(record) => {
            commands::record::execute(&args.config, record).await?;
        }
        cli::Commands::Usage(usage) => {
            commands::usage::execute(&args.config, usage).await?;
        }
        cli::Commands::Pricing { action } => {
            commands::pricing::execute(&args.config, action).await?;
        }
        cli::Commands::Verify { repair } => {
            commands::verify::execute(&args.config, repair).await?;
        }
        cli::Commands::Version => {
            println!("usage-ledger v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
