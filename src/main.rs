use anyhow::Result;
use clap::Parser;

use payout_ledger::cli::{execute_cli, Cli};
use payout_ledger::logging::init_logging;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    execute_cli(cli).await
}
