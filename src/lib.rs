//! Transactional event-propagation core for retailer/distributor trade.
//!
//! The write path is synchronous and transactional: order lifecycle changes,
//! payments and settlements commit together with their outbox rows. The read
//! side (retailer inventory, product bills, the accounting ledger) is
//! maintained asynchronously by durable idempotent consumers fed from the
//! outbox relay.

pub mod config;
pub mod consumers;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod services;

use std::sync::Arc;

use crate::config::AppConfig;
use crate::db::DbPool;
use crate::events::EventBus;

/// Shared handles the binaries wire together at startup.
#[derive(Clone)]
pub struct AppContext {
    pub db: Arc<DbPool>,
    pub bus: Arc<dyn EventBus>,
    pub config: AppConfig,
}
