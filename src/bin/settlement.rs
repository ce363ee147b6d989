//! Settlement runner: closes the last finished period into GST invoices.
//! Intended to run from cron; re-running the same period is a no-op.

use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use tracing::info;

use ledgerflow::config::{init_tracing, load_config};
use ledgerflow::db;
use ledgerflow::services::settlement::{Granularity, SettlementService};

#[derive(Debug, Parser)]
#[command(name = "settlement", about = "Generate GST invoices for the last closed period")]
struct Cli {
    /// Settlement window to close.
    #[arg(long, value_enum, default_value_t = Granularity::Weekly)]
    granularity: Granularity,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config().context("failed to load configuration")?;
    init_tracing(config.log_level(), config.log_json);

    let pool = db::establish_connection_from_app_config(&config)
        .await
        .context("failed to connect to database")?;
    let pool = Arc::new(pool);
    if config.database_url.starts_with("sqlite:") {
        db::init_schema(pool.as_ref())
            .await
            .context("failed to initialize schema")?;
    }

    let service = SettlementService::new(pool);
    let run = service
        .run(cli.granularity, Utc::now())
        .await
        .context("settlement run failed")?;

    info!(
        period_start = %run.period_start,
        period_end = %run.period_end,
        invoices_created = run.invoices_created,
        pairs_skipped = run.pairs_skipped,
        "settlement complete"
    );
    println!(
        "settled {} to {}: {} invoice(s) created, {} pair(s) already settled or empty",
        run.period_start.date_naive(),
        run.period_end.date_naive(),
        run.invoices_created,
        run.pairs_skipped
    );
    Ok(())
}
