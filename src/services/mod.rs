//! Caller-facing business services. Each service owns its transactions and
//! enqueues outbox events inside them; nothing here publishes to the broker
//! directly.

pub mod ledger;
pub mod orders;
pub mod product_bills;
pub mod settlement;
