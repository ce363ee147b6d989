//! sea-orm entity definitions for the order, ledger and settlement tables.

pub mod distributor;
pub mod event_dedup;
pub mod invoice;
pub mod invoice_item;
pub mod ledger_entry;
pub mod order;
pub mod order_item;
pub mod outbox_event;
pub mod product_bill;
pub mod product_bill_transaction;
pub mod product_variant;
pub mod retailer;
pub mod retailer_inventory;
