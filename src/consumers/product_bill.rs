//! Product-bill ledger engine, event-driven side: fold completed deliveries
//! into the per-(retailer, distributor, variant) running balances.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set, TransactionTrait};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::db::DbPool;
use crate::entities::product_bill::{self, BillStatus};
use crate::entities::product_bill_transaction::{self, TransactionType};
use crate::errors::ServiceError;
use crate::events::{
    outbox, subjects, BillUpdatedPayload, DeliveryRecordedPayload, EventEnvelope,
};

use super::EventHandler;

pub const DURABLE_NAME: &str = "product_bill_updater";

/// Default credit terms applied when a bill is created lazily on first
/// delivery; adjusted later through bill management, not here.
const DEFAULT_CREDIT_DAYS: i32 = 30;

pub struct ProductBillProjector;

#[async_trait]
impl EventHandler for ProductBillProjector {
    #[instrument(skip(self, db, envelope), fields(event_id = %envelope.event_id))]
    async fn handle(&self, db: &DbPool, envelope: &EventEnvelope) -> Result<(), ServiceError> {
        let delivery: DeliveryRecordedPayload = envelope.payload_as()?;

        let txn = db.begin().await?;

        // Business-key idempotency for the crash window between handler
        // commit and the dedup write: the whole batch commits atomically,
        // so any delivery row for this order means the event was applied.
        let applied = product_bill_transaction::Entity::find()
            .filter(product_bill_transaction::Column::OrderId.eq(delivery.order_id))
            .filter(product_bill_transaction::Column::TxnType.eq(TransactionType::Delivery))
            .one(&txn)
            .await?;
        if applied.is_some() {
            info!(order_id = %delivery.order_id, "delivery already folded into bills, skipping");
            return Ok(());
        }

        let now = Utc::now();
        let mut total_amount = Decimal::ZERO;

        for item in &delivery.items {
            let bill = find_or_create_bill(
                &txn,
                delivery.retailer_id,
                delivery.distributor_id,
                item.variant_id,
                item.unit_cost,
            )
            .await?;

            let amount = item.unit_cost * Decimal::from(item.quantity);

            // Append to the source-of-truth log first, then refresh the
            // materialized cumulative fields.
            product_bill_transaction::ActiveModel {
                id: Set(Uuid::new_v4()),
                product_bill_id: Set(bill.id),
                txn_type: Set(TransactionType::Delivery),
                quantity: Set(item.quantity),
                unit_price: Set(item.unit_cost),
                amount: Set(amount),
                order_id: Set(Some(delivery.order_id)),
                invoice_id: Set(None),
                recorded_by: Set(None),
                occurred_at: Set(now),
            }
            .insert(&txn)
            .await?;

            let delivered = bill.total_quantity_delivered + item.quantity;
            let due = bill.total_amount_due + amount;
            let version = bill.version + 1;
            let mut bill_row: product_bill::ActiveModel = bill.into();
            bill_row.total_quantity_delivered = Set(delivered);
            bill_row.total_amount_due = Set(due);
            bill_row.current_unit_cost = Set(item.unit_cost);
            bill_row.last_transaction_date = Set(Some(now));
            bill_row.updated_at = Set(now);
            bill_row.version = Set(version);
            bill_row.update(&txn).await?;

            total_amount += amount;
        }

        let payload = BillUpdatedPayload {
            retailer_id: delivery.retailer_id,
            distributor_id: delivery.distributor_id,
            order_id: Some(delivery.order_id),
            amount: total_amount,
            reason: "order delivery recorded".to_string(),
        };
        let follow_on = EventEnvelope::new(subjects::PRODUCT_BILLS_UPDATED, &payload)?;
        outbox::enqueue(&txn, subjects::PRODUCT_BILLS_UPDATED, &follow_on).await?;

        txn.commit().await?;
        info!(order_id = %delivery.order_id, amount = %total_amount, "product bills updated for delivery");
        Ok(())
    }
}

/// Bills are created lazily on the first delivery for a
/// (retailer, distributor, variant) triple and never deleted.
async fn find_or_create_bill(
    db: &impl sea_orm::ConnectionTrait,
    retailer_id: Uuid,
    distributor_id: Uuid,
    variant_id: Uuid,
    unit_cost: Decimal,
) -> Result<product_bill::Model, ServiceError> {
    let existing = product_bill::Entity::find()
        .filter(product_bill::Column::RetailerId.eq(retailer_id))
        .filter(product_bill::Column::DistributorId.eq(distributor_id))
        .filter(product_bill::Column::VariantId.eq(variant_id))
        .one(db)
        .await?;

    if let Some(bill) = existing {
        return Ok(bill);
    }

    let now = Utc::now();
    let row = product_bill::ActiveModel {
        id: Set(Uuid::new_v4()),
        retailer_id: Set(retailer_id),
        distributor_id: Set(distributor_id),
        variant_id: Set(variant_id),
        total_quantity_delivered: Set(0),
        total_quantity_returned: Set(0),
        total_amount_due: Set(Decimal::ZERO),
        total_amount_paid: Set(Decimal::ZERO),
        current_unit_cost: Set(unit_cost),
        last_transaction_date: Set(None),
        credit_limit: Set(Decimal::ZERO),
        credit_days: Set(DEFAULT_CREDIT_DAYS),
        status: Set(BillStatus::Active),
        version: Set(1),
        created_at: Set(now),
        updated_at: Set(now),
    };
    Ok(row.insert(db).await?)
}
