//! Inventory projector: on `orders.completed`, move stock from the
//! distributor's catalog to the retailer's inventory.

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set, TransactionTrait,
};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::db::DbPool;
use crate::entities::{order_item, outbox_event, product_variant, retailer_inventory};
use crate::errors::ServiceError;
use crate::events::{
    outbox, subjects, DeliveredItem, DeliveryRecordedPayload, EventEnvelope, OrderEventPayload,
};

use super::EventHandler;

pub const DURABLE_NAME: &str = "inventory_updater";

pub struct InventoryProjector;

#[async_trait]
impl EventHandler for InventoryProjector {
    #[instrument(skip(self, db, envelope), fields(event_id = %envelope.event_id))]
    async fn handle(&self, db: &DbPool, envelope: &EventEnvelope) -> Result<(), ServiceError> {
        let order: OrderEventPayload = envelope.payload_as()?;

        // Both sides of the move plus the follow-on event commit together:
        // stock never vanishes without appearing at the retailer.
        let txn = db.begin().await?;

        // The follow-on outbox row commits in this same transaction, so its
        // presence for this order means a previous run already moved the
        // stock; a re-run in the crash window between handler commit and
        // the dedup write must not move it again.
        if delivery_recorded(&txn, order.order_id).await? {
            info!(order_id = %order.order_id, "inventory already moved for order, skipping");
            return Ok(());
        }

        let items = order_item::Entity::find()
            .filter(order_item::Column::OrderId.eq(order.order_id))
            .all(&txn)
            .await?;

        let mut delivered = Vec::with_capacity(items.len());
        for item in &items {
            let variant = product_variant::Entity::find_by_id(item.variant_id)
                .one(&txn)
                .await?;
            let Some(variant) = variant else {
                warn!(variant_id = %item.variant_id, "variant missing, skipping item");
                continue;
            };

            // Floored at zero rather than going negative.
            let new_stock = (variant.stock - item.quantity).max(0);
            let unit_cost = variant.cost_price;
            let selling_price = variant.selling_price;
            let variant_name = variant.name.clone();

            let mut variant_row: product_variant::ActiveModel = variant.into();
            variant_row.stock = Set(new_stock);
            variant_row.update(&txn).await?;

            let existing = retailer_inventory::Entity::find()
                .filter(retailer_inventory::Column::RetailerId.eq(order.retailer_id))
                .filter(retailer_inventory::Column::VariantId.eq(item.variant_id))
                .one(&txn)
                .await?;

            match existing {
                Some(row) => {
                    let qty = row.qty + item.quantity;
                    let mut inventory_row: retailer_inventory::ActiveModel = row.into();
                    inventory_row.qty = Set(qty);
                    inventory_row.last_updated = Set(Utc::now());
                    inventory_row.update(&txn).await?;
                }
                None => {
                    retailer_inventory::ActiveModel {
                        id: Set(Uuid::new_v4()),
                        retailer_id: Set(order.retailer_id),
                        variant_id: Set(item.variant_id),
                        sku: Set(item.sku.clone()),
                        variant_name: Set(variant_name),
                        qty: Set(item.quantity),
                        selling_price: Set(selling_price),
                        cost_price: Set(unit_cost),
                        last_updated: Set(Utc::now()),
                    }
                    .insert(&txn)
                    .await?;
                }
            }

            delivered.push(DeliveredItem {
                variant_id: item.variant_id,
                sku: item.sku.clone(),
                quantity: item.quantity,
                unit_cost,
            });
        }

        // Drive the product-bill ledger engine through the outbox, with a
        // fresh event id for downstream deduplication.
        let payload = DeliveryRecordedPayload {
            order_id: order.order_id,
            retailer_id: order.retailer_id,
            distributor_id: order.distributor_id,
            items: delivered,
        };
        let follow_on = EventEnvelope::new(subjects::INVENTORY_UPDATED_AFTER_ORDER, &payload)?;
        outbox::enqueue(&txn, subjects::INVENTORY_UPDATED_AFTER_ORDER, &follow_on).await?;

        txn.commit().await?;
        info!(order_id = %order.order_id, items = items.len(), "inventory updated for completed order");
        Ok(())
    }
}

/// Whether an `inventory.updated_after_order` outbox row for this order is
/// already committed.
async fn delivery_recorded(
    db: &impl sea_orm::ConnectionTrait,
    order_id: Uuid,
) -> Result<bool, ServiceError> {
    let rows = outbox_event::Entity::find()
        .filter(outbox_event::Column::EventType.eq(subjects::INVENTORY_UPDATED_AFTER_ORDER))
        .all(db)
        .await?;
    let order_id = order_id.to_string();
    Ok(rows.iter().any(|row| {
        row.payload
            .pointer("/payload/order_id")
            .and_then(|v| v.as_str())
            == Some(order_id.as_str())
    }))
}
