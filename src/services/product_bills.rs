//! Product-bill engine, caller-facing side: payments, returns and manual
//! adjustments against the running balances the event pipeline maintains.
//!
//! Every mutation appends to the bill's transaction log and refreshes the
//! materialized cumulative fields in the same database transaction. The log
//! is the source of truth; `fold_transactions` recomputes the cumulatives
//! from it for audits.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::db::DbPool;
use crate::entities::product_bill;
use crate::entities::product_bill_transaction::{self, TransactionType};
use crate::errors::ServiceError;
use crate::events::{outbox, subjects, EventEnvelope, PaymentAppliedPayload};

/// Cumulative totals as recomputed from a bill's transaction log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BillTotals {
    pub quantity_delivered: i32,
    pub quantity_returned: i32,
    pub amount_due: Decimal,
    pub amount_paid: Decimal,
}

impl BillTotals {
    pub fn outstanding(&self) -> Decimal {
        self.amount_due - self.amount_paid
    }
}

/// Recompute cumulative totals from the append-only log.
///
/// Mapping per transaction type: deliveries raise due and delivered,
/// payments raise paid (their `amount` is stored negative), returns raise
/// returned and lower due, adjustments carry signed quantity and amount
/// deltas. Sales and price changes are informational and do not move the
/// totals.
pub fn fold_transactions(rows: &[product_bill_transaction::Model]) -> BillTotals {
    let mut totals = BillTotals::default();
    for row in rows {
        match row.txn_type {
            TransactionType::Delivery => {
                totals.quantity_delivered += row.quantity;
                totals.amount_due += row.amount;
            }
            TransactionType::Payment => {
                totals.amount_paid += -row.amount;
            }
            TransactionType::Return => {
                totals.quantity_returned += row.quantity;
                totals.amount_due += row.amount;
            }
            TransactionType::Adjustment => {
                totals.quantity_delivered += row.quantity;
                totals.amount_due += row.amount;
            }
            TransactionType::Sale | TransactionType::PriceChange => {}
        }
    }
    totals
}

/// Age an outstanding balance against the bill's credit terms. The whole
/// balance lands in exactly one bucket, keyed off the last transaction date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgingBucket {
    Current,
    Overdue,
}

pub fn aging(bill: &product_bill::Model, as_of: DateTime<Utc>) -> AgingBucket {
    let Some(last) = bill.last_transaction_date else {
        return AgingBucket::Current;
    };
    let days_since = (as_of - last).num_days();
    if days_since <= i64::from(bill.credit_days) {
        AgingBucket::Current
    } else {
        AgingBucket::Overdue
    }
}

/// Result of checking a bill's materialized fields against its log.
#[derive(Debug, Clone)]
pub struct BillAudit {
    pub bill_id: Uuid,
    pub cached: BillTotals,
    pub folded: BillTotals,
}

impl BillAudit {
    pub fn is_consistent(&self) -> bool {
        self.cached == self.folded
    }
}

#[derive(Clone)]
pub struct ProductBillService {
    db: Arc<DbPool>,
}

impl ProductBillService {
    pub fn new(db: Arc<DbPool>) -> Self {
        Self { db }
    }

    pub async fn get_bill(
        &self,
        bill_id: Uuid,
    ) -> Result<Option<product_bill::Model>, ServiceError> {
        Ok(product_bill::Entity::find_by_id(bill_id)
            .one(self.db.as_ref())
            .await?)
    }

    /// Apply a payment against a bill's outstanding balance.
    ///
    /// Rejects anything above the outstanding amount; partial payments are
    /// the normal case.
    #[instrument(skip(self), fields(bill_id = %bill_id, amount = %amount))]
    pub async fn record_payment(
        &self,
        bill_id: Uuid,
        amount: Decimal,
        recorded_by: Option<Uuid>,
    ) -> Result<product_bill::Model, ServiceError> {
        if amount <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(format!(
                "payment must be positive, got {}",
                amount
            )));
        }

        let txn = self.db.begin().await?;
        let bill = load_bill(&txn, bill_id).await?;

        let outstanding = bill.outstanding();
        if amount > outstanding {
            return Err(ServiceError::Overpayment {
                attempted: amount,
                outstanding,
            });
        }

        let now = Utc::now();
        product_bill_transaction::ActiveModel {
            id: Set(Uuid::new_v4()),
            product_bill_id: Set(bill.id),
            txn_type: Set(TransactionType::Payment),
            quantity: Set(0),
            unit_price: Set(Decimal::ZERO),
            amount: Set(-amount),
            order_id: Set(None),
            invoice_id: Set(None),
            recorded_by: Set(recorded_by),
            occurred_at: Set(now),
        }
        .insert(&txn)
        .await?;

        let paid = bill.total_amount_paid + amount;
        let updated = persist_bill_update(&txn, &bill, |row| {
            row.total_amount_paid = Set(paid);
            row.last_transaction_date = Set(Some(now));
        })
        .await?;

        self.emit_credit(&txn, &updated, amount, "payment applied")
            .await?;
        txn.commit().await?;

        info!(bill_id = %bill_id, amount = %amount, outstanding = %updated.outstanding(), "payment recorded");
        Ok(updated)
    }

    /// Record goods coming back from the retailer, valued at the bill's
    /// current unit cost. Rejected when it would return more than was
    /// delivered net, or credit more than is still owed.
    #[instrument(skip(self), fields(bill_id = %bill_id, quantity = quantity))]
    pub async fn record_return(
        &self,
        bill_id: Uuid,
        quantity: i32,
        recorded_by: Option<Uuid>,
    ) -> Result<product_bill::Model, ServiceError> {
        if quantity <= 0 {
            return Err(ServiceError::ValidationError(format!(
                "return quantity must be positive, got {}",
                quantity
            )));
        }

        let txn = self.db.begin().await?;
        let bill = load_bill(&txn, bill_id).await?;

        let available = bill.net_quantity();
        if quantity > available {
            return Err(ServiceError::OverReturn {
                requested: quantity,
                available,
            });
        }

        let credit = bill.current_unit_cost * Decimal::from(quantity);
        if credit > bill.outstanding() {
            return Err(ServiceError::ValidationError(format!(
                "return credit {} exceeds outstanding balance {}",
                credit,
                bill.outstanding()
            )));
        }

        let now = Utc::now();
        product_bill_transaction::ActiveModel {
            id: Set(Uuid::new_v4()),
            product_bill_id: Set(bill.id),
            txn_type: Set(TransactionType::Return),
            quantity: Set(quantity),
            unit_price: Set(bill.current_unit_cost),
            amount: Set(-credit),
            order_id: Set(None),
            invoice_id: Set(None),
            recorded_by: Set(recorded_by),
            occurred_at: Set(now),
        }
        .insert(&txn)
        .await?;

        let returned = bill.total_quantity_returned + quantity;
        let due = bill.total_amount_due - credit;
        let updated = persist_bill_update(&txn, &bill, |row| {
            row.total_quantity_returned = Set(returned);
            row.total_amount_due = Set(due);
            row.last_transaction_date = Set(Some(now));
        })
        .await?;

        self.emit_credit(&txn, &updated, credit, "goods returned")
            .await?;
        txn.commit().await?;

        info!(bill_id = %bill_id, quantity = quantity, credit = %credit, "return recorded");
        Ok(updated)
    }

    /// Manual correction with signed quantity and amount deltas. The result
    /// must still satisfy the bill invariants (paid never above due,
    /// returned never above delivered).
    #[instrument(skip(self), fields(bill_id = %bill_id))]
    pub async fn record_adjustment(
        &self,
        bill_id: Uuid,
        quantity_delta: i32,
        amount_delta: Decimal,
        recorded_by: Option<Uuid>,
    ) -> Result<product_bill::Model, ServiceError> {
        if quantity_delta == 0 && amount_delta.is_zero() {
            return Err(ServiceError::ValidationError(
                "adjustment must change quantity or amount".to_string(),
            ));
        }

        let txn = self.db.begin().await?;
        let bill = load_bill(&txn, bill_id).await?;

        let delivered = bill.total_quantity_delivered + quantity_delta;
        let due = bill.total_amount_due + amount_delta;
        if delivered < bill.total_quantity_returned {
            return Err(ServiceError::ValidationError(format!(
                "adjustment would leave delivered {} below returned {}",
                delivered, bill.total_quantity_returned
            )));
        }
        if due < bill.total_amount_paid {
            return Err(ServiceError::ValidationError(format!(
                "adjustment would leave amount due {} below amount paid {}",
                due, bill.total_amount_paid
            )));
        }

        let now = Utc::now();
        product_bill_transaction::ActiveModel {
            id: Set(Uuid::new_v4()),
            product_bill_id: Set(bill.id),
            txn_type: Set(TransactionType::Adjustment),
            quantity: Set(quantity_delta),
            unit_price: Set(Decimal::ZERO),
            amount: Set(amount_delta),
            order_id: Set(None),
            invoice_id: Set(None),
            recorded_by: Set(recorded_by),
            occurred_at: Set(now),
        }
        .insert(&txn)
        .await?;

        let updated = persist_bill_update(&txn, &bill, |row| {
            row.total_quantity_delivered = Set(delivered);
            row.total_amount_due = Set(due);
            row.last_transaction_date = Set(Some(now));
        })
        .await?;

        if !amount_delta.is_zero() {
            self.emit_adjustment(&txn, &updated, amount_delta).await?;
        }
        txn.commit().await?;

        info!(bill_id = %bill_id, quantity_delta = quantity_delta, amount_delta = %amount_delta, "adjustment recorded");
        Ok(updated)
    }

    /// Recompute a bill's totals from its log and compare to the
    /// materialized fields. A mismatch is reported, not repaired.
    #[instrument(skip(self), fields(bill_id = %bill_id))]
    pub async fn audit_bill(&self, bill_id: Uuid) -> Result<BillAudit, ServiceError> {
        let bill = load_bill(self.db.as_ref(), bill_id).await?;
        let rows = product_bill_transaction::Entity::find()
            .filter(product_bill_transaction::Column::ProductBillId.eq(bill_id))
            .order_by_asc(product_bill_transaction::Column::OccurredAt)
            .all(self.db.as_ref())
            .await?;

        let audit = BillAudit {
            bill_id,
            cached: BillTotals {
                quantity_delivered: bill.total_quantity_delivered,
                quantity_returned: bill.total_quantity_returned,
                amount_due: bill.total_amount_due,
                amount_paid: bill.total_amount_paid,
            },
            folded: fold_transactions(&rows),
        };
        if !audit.is_consistent() {
            warn!(
                bill_id = %bill_id,
                cached = ?audit.cached,
                folded = ?audit.folded,
                "bill cache diverged from transaction log"
            );
        }
        Ok(audit)
    }

    async fn emit_credit(
        &self,
        txn: &impl sea_orm::ConnectionTrait,
        bill: &product_bill::Model,
        amount: Decimal,
        reason: &str,
    ) -> Result<(), ServiceError> {
        let payload = PaymentAppliedPayload {
            bill_id: bill.id,
            retailer_id: bill.retailer_id,
            distributor_id: bill.distributor_id,
            amount,
            reason: reason.to_string(),
        };
        let envelope = EventEnvelope::new(subjects::PRODUCT_BILLS_PAYMENT, &payload)?;
        outbox::enqueue(txn, subjects::PRODUCT_BILLS_PAYMENT, &envelope).await
    }

    async fn emit_adjustment(
        &self,
        txn: &impl sea_orm::ConnectionTrait,
        bill: &product_bill::Model,
        amount_delta: Decimal,
    ) -> Result<(), ServiceError> {
        if amount_delta > Decimal::ZERO {
            let payload = crate::events::BillUpdatedPayload {
                retailer_id: bill.retailer_id,
                distributor_id: bill.distributor_id,
                order_id: None,
                amount: amount_delta,
                reason: "bill adjusted upward".to_string(),
            };
            let envelope = EventEnvelope::new(subjects::PRODUCT_BILLS_UPDATED, &payload)?;
            outbox::enqueue(txn, subjects::PRODUCT_BILLS_UPDATED, &envelope).await
        } else {
            self.emit_credit(txn, bill, -amount_delta, "bill adjusted downward")
                .await
        }
    }
}

async fn load_bill(
    db: &impl sea_orm::ConnectionTrait,
    bill_id: Uuid,
) -> Result<product_bill::Model, ServiceError> {
    product_bill::Entity::find_by_id(bill_id)
        .one(db)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("product bill {}", bill_id)))
}

/// Version-guarded bill update; loses the race to a concurrent writer
/// instead of clobbering its fields.
async fn persist_bill_update<C, F>(
    txn: &C,
    current: &product_bill::Model,
    apply: F,
) -> Result<product_bill::Model, ServiceError>
where
    C: sea_orm::ConnectionTrait,
    F: FnOnce(&mut product_bill::ActiveModel),
{
    let mut row = product_bill::ActiveModel {
        updated_at: Set(Utc::now()),
        version: Set(current.version + 1),
        ..Default::default()
    };
    apply(&mut row);

    let result = product_bill::Entity::update_many()
        .set(row)
        .filter(product_bill::Column::Id.eq(current.id))
        .filter(product_bill::Column::Version.eq(current.version))
        .exec(txn)
        .await?;
    if result.rows_affected == 0 {
        return Err(ServiceError::ConcurrentModification(current.id));
    }
    load_bill(txn, current.id).await
}
