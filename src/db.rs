use crate::config::AppConfig;
use crate::errors::ServiceError;
use sea_orm::{ConnectOptions, Database, DatabaseConnection, DbBackend};
use std::time::Duration;
use tracing::{debug, info};

/// Type alias for a database connection pool
pub type DbPool = DatabaseConnection;

/// Configuration for database connection
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub acquire_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: 10,
            min_connections: 1,
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            acquire_timeout: Duration::from_secs(8),
        }
    }
}

/// Establishes a connection pool to the database.
pub async fn establish_connection(database_url: &str) -> Result<DbPool, ServiceError> {
    let config = DbConfig {
        url: database_url.to_string(),
        ..Default::default()
    };
    establish_connection_with_config(&config).await
}

/// Establishes a connection pool from the application configuration.
pub async fn establish_connection_from_app_config(
    cfg: &AppConfig,
) -> Result<DbPool, ServiceError> {
    let config = DbConfig {
        url: cfg.database_url.clone(),
        max_connections: cfg.db_max_connections,
        min_connections: cfg.db_min_connections,
        ..Default::default()
    };
    establish_connection_with_config(&config).await
}

pub async fn establish_connection_with_config(config: &DbConfig) -> Result<DbPool, ServiceError> {
    debug!("Configuring database connection with: {:?}", config);

    let mut opt = ConnectOptions::new(config.url.clone());
    opt.max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .connect_timeout(config.connect_timeout)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .sqlx_logging(false);

    info!(
        "Connecting to database with max_connections={}",
        config.max_connections
    );

    let pool = Database::connect(opt).await?;
    Ok(pool)
}

/// Creates the schema from the entity definitions.
///
/// Intended for SQLite-backed tests and local development; Postgres DDL is
/// owned by the deployment's migration pipeline.
pub async fn init_schema(db: &DbPool) -> Result<(), ServiceError> {
    use crate::entities::{
        distributor, event_dedup, invoice, invoice_item, ledger_entry, order, order_item,
        outbox_event, product_bill, product_bill_transaction, product_variant, retailer,
        retailer_inventory,
    };
    use sea_orm::sea_query::Index;
    use sea_orm::{ConnectionTrait, Schema};

    let backend: DbBackend = db.get_database_backend();
    let schema = Schema::new(backend);

    macro_rules! create_table {
        ($entity:expr) => {
            let mut stmt = schema.create_table_from_entity($entity);
            db.execute(backend.build(stmt.if_not_exists())).await?;
        };
    }

    create_table!(retailer::Entity);
    create_table!(distributor::Entity);
    create_table!(product_variant::Entity);
    create_table!(retailer_inventory::Entity);
    create_table!(order::Entity);
    create_table!(order_item::Entity);
    create_table!(outbox_event::Entity);
    create_table!(event_dedup::Entity);
    create_table!(product_bill::Entity);
    create_table!(product_bill_transaction::Entity);
    create_table!(ledger_entry::Entity);
    create_table!(invoice::Entity);
    create_table!(invoice_item::Entity);

    // Settlement idempotence is anchored on this constraint: two racing
    // runs both pass the existence read, and the second insert must fail.
    // Production DDL carries the same index.
    let invoice_period_idx = Index::create()
        .name("uq_invoices_pair_period")
        .table(invoice::Entity)
        .col(invoice::Column::RetailerId)
        .col(invoice::Column::DistributorId)
        .col(invoice::Column::PeriodStart)
        .col(invoice::Column::PeriodEnd)
        .unique()
        .if_not_exists()
        .to_owned();
    db.execute(backend.build(&invoice_period_idx)).await?;

    Ok(())
}
