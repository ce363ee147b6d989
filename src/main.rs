//! Long-running worker process: outbox relay plus the three durable
//! consumers that maintain retailer inventory, product bills and the
//! accounting ledger.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{error, info};

use ledgerflow::config::{init_tracing, load_config};
use ledgerflow::consumers::{inventory, ledger, product_bill, DurableConsumer};
use ledgerflow::db;
use ledgerflow::events::outbox::OutboxRelay;
use ledgerflow::events::{subjects, InMemoryEventBus};
use ledgerflow::AppContext;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config().context("failed to load configuration")?;
    init_tracing(config.log_level(), config.log_json);
    info!(environment = %config.environment, "starting ledgerflow worker");

    let pool = db::establish_connection_from_app_config(&config)
        .await
        .context("failed to connect to database")?;
    let pool = Arc::new(pool);
    if config.database_url.starts_with("sqlite:") {
        db::init_schema(pool.as_ref())
            .await
            .context("failed to initialize schema")?;
    }

    // Single-process deployment: the retained log and durable cursors live
    // in this process and do not survive a restart, although every applied
    // event stays recorded in the outbox and dedup tables. Multi-process
    // deployments need a persistent broker behind `EventBus`.
    let ctx = AppContext {
        db: pool,
        bus: Arc::new(InMemoryEventBus::new()),
        config,
    };

    let relay = OutboxRelay::new(
        Arc::clone(&ctx.db),
        Arc::clone(&ctx.bus),
        Duration::from_millis(ctx.config.outbox_poll_interval_ms),
        ctx.config.outbox_batch_size,
        Duration::from_millis(ctx.config.publish_timeout_ms),
    );
    tokio::spawn(relay.run());

    spawn_consumer(
        &ctx,
        subjects::ORDERS_COMPLETED,
        inventory::DURABLE_NAME,
        Arc::new(inventory::InventoryProjector),
    )
    .await?;
    spawn_consumer(
        &ctx,
        subjects::INVENTORY_UPDATED_AFTER_ORDER,
        product_bill::DURABLE_NAME,
        Arc::new(product_bill::ProductBillProjector),
    )
    .await?;
    spawn_consumer(
        &ctx,
        subjects::PRODUCT_BILLS_ALL,
        ledger::DURABLE_NAME,
        Arc::new(ledger::LedgerProjector),
    )
    .await?;

    shutdown_signal().await;
    info!("shutdown signal received, stopping");
    Ok(())
}

async fn spawn_consumer(
    ctx: &AppContext,
    subject: &str,
    durable: &str,
    handler: Arc<dyn ledgerflow::consumers::EventHandler>,
) -> anyhow::Result<()> {
    let consumer = DurableConsumer::start(
        Arc::clone(&ctx.db),
        Arc::clone(&ctx.bus),
        subject,
        durable,
        handler,
    )
    .await
    .with_context(|| format!("failed to start consumer {}", durable))?;
    tokio::spawn(consumer.run());
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install ctrl-c handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => error!("failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
