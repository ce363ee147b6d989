//! Order lifecycle engine.
//!
//! Owns the order state machine. Every mutation happens inside a single
//! database transaction that also inserts the matching outbox row, so a
//! committed state change and its notification are atomic.

use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

use crate::db::DbPool;
use crate::entities::order::{self, OrderStatus};
use crate::entities::{order_item, product_variant};
use crate::errors::ServiceError;
use crate::events::{outbox, subjects, EventEnvelope, OrderEventPayload};

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateOrderRequest {
    pub retailer_id: Uuid,
    pub distributor_id: Uuid,
    #[validate(length(min = 1, message = "order must contain at least one item"))]
    pub items: Vec<OrderItemRequest>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderItemRequest {
    pub variant_id: Uuid,
    pub quantity: i32,
    pub unit: Option<String>,
}

/// Distributor's decision on a pending order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DistributorAction {
    Accept,
    Reject { reason: Option<String> },
    Modify { items: Vec<ProposedItem> },
}

/// Item quantities/prices the distributor proposes in a `Modify`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedItem {
    pub variant_id: Uuid,
    pub quantity: i32,
    /// Distributor's price for the line; the variant's current selling
    /// price when absent.
    pub unit_price: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderWithItems {
    pub order: order::Model,
    pub items: Vec<order_item::Model>,
}

fn compute_total<'a, I>(lines: I) -> Decimal
where
    I: IntoIterator<Item = (i32, &'a Decimal)>,
{
    lines
        .into_iter()
        .map(|(qty, price)| *price * Decimal::from(qty))
        .sum()
}

fn append_note(notes: &Option<String>, line: &str) -> String {
    match notes {
        Some(existing) if !existing.is_empty() => format!("{}\n{}", existing, line),
        _ => line.to_string(),
    }
}

#[derive(Clone)]
pub struct OrderService {
    db: Arc<DbPool>,
}

impl OrderService {
    pub fn new(db: Arc<DbPool>) -> Self {
        Self { db }
    }

    /// Create a pending order: validates each variant belongs to the target
    /// distributor, snapshots current selling prices, and commits order,
    /// items and the `orders.created` outbox row in one transaction.
    #[instrument(skip(self, request), fields(retailer_id = %request.retailer_id, distributor_id = %request.distributor_id))]
    pub async fn create_order(
        &self,
        request: CreateOrderRequest,
    ) -> Result<OrderWithItems, ServiceError> {
        request
            .validate()
            .map_err(|e| ServiceError::ValidationError(e.to_string()))?;
        for item in &request.items {
            if item.quantity <= 0 {
                return Err(ServiceError::ValidationError(format!(
                    "quantity must be positive for variant {}",
                    item.variant_id
                )));
            }
        }

        let txn = self.db.begin().await?;
        let now = Utc::now();

        let variant_ids: Vec<Uuid> = request.items.iter().map(|i| i.variant_id).collect();
        let variants = product_variant::Entity::find()
            .filter(product_variant::Column::Id.is_in(variant_ids))
            .all(&txn)
            .await?;

        let mut lines = Vec::with_capacity(request.items.len());
        for item in &request.items {
            let variant = variants
                .iter()
                .find(|v| v.id == item.variant_id)
                .ok_or_else(|| {
                    ServiceError::ValidationError(format!("unknown variant {}", item.variant_id))
                })?;
            if variant.distributor_id != request.distributor_id {
                return Err(ServiceError::ValidationError(format!(
                    "SKU {} is not sold by this distributor",
                    variant.sku
                )));
            }
            lines.push((item, variant));
        }

        let total = compute_total(lines.iter().map(|(i, v)| (i.quantity, &v.selling_price)));
        let order_id = Uuid::new_v4();
        let order_row = order::ActiveModel {
            id: Set(order_id),
            order_number: Set(format!("ORD-{}", now.timestamp_millis())),
            retailer_id: Set(request.retailer_id),
            distributor_id: Set(request.distributor_id),
            status: Set(OrderStatus::Pending),
            total_amount: Set(total),
            notes: Set(request.notes),
            created_at: Set(now),
            updated_at: Set(now),
            accepted_at: Set(None),
            completed_at: Set(None),
            version: Set(1),
        };
        let order_model = order_row.insert(&txn).await?;

        let mut items = Vec::with_capacity(lines.len());
        for (item, variant) in lines {
            let row = order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                variant_id: Set(variant.id),
                sku: Set(variant.sku.clone()),
                variant_name: Set(variant.name.clone()),
                quantity: Set(item.quantity),
                unit: Set(item.unit.clone().or_else(|| variant.unit.clone())),
                unit_price: Set(variant.selling_price),
                created_at: Set(now),
            };
            items.push(row.insert(&txn).await?);
        }

        self.emit(&txn, subjects::ORDERS_CREATED, &order_model)
            .await?;
        txn.commit().await?;

        info!(order_id = %order_id, total = %total, "order created");
        Ok(OrderWithItems {
            order: order_model,
            items,
        })
    }

    pub async fn get_order(&self, order_id: Uuid) -> Result<Option<OrderWithItems>, ServiceError> {
        let Some(order_model) = order::Entity::find_by_id(order_id)
            .one(self.db.as_ref())
            .await?
        else {
            return Ok(None);
        };
        let items = order_item::Entity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(self.db.as_ref())
            .await?;
        Ok(Some(OrderWithItems {
            order: order_model,
            items,
        }))
    }

    /// Distributor decision on a pending order: accept (reserve stock at
    /// current values), reject, or propose modifications.
    #[instrument(skip(self, action), fields(order_id = %order_id))]
    pub async fn distributor_process(
        &self,
        order_id: Uuid,
        action: DistributorAction,
    ) -> Result<order::Model, ServiceError> {
        match action {
            DistributorAction::Accept => self.accept(order_id).await,
            DistributorAction::Reject { reason } => self.reject(order_id, reason).await,
            DistributorAction::Modify { items } => self.modify(order_id, items).await,
        }
    }

    async fn accept(&self, order_id: Uuid) -> Result<order::Model, ServiceError> {
        let txn = self.db.begin().await?;
        let order_model = load_order(&txn, order_id).await?;
        ensure_status(&order_model, OrderStatus::Pending, "accept")?;

        let items = order_item::Entity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(&txn)
            .await?;

        // Stock and price are re-read at acceptance time; acceptance-time
        // price wins over the creation-time snapshot.
        let total = reserve_stock_and_reprice(&txn, &items).await?;

        let updated = persist_transition(&txn, &order_model, |row| {
            row.status = Set(OrderStatus::Processing);
            row.total_amount = Set(total);
            row.accepted_at = Set(Some(Utc::now()));
        })
        .await?;

        self.emit(&txn, subjects::ORDERS_ACCEPTED, &updated).await?;
        txn.commit().await?;
        info!(order_id = %order_id, "order accepted");
        Ok(updated)
    }

    async fn reject(
        &self,
        order_id: Uuid,
        reason: Option<String>,
    ) -> Result<order::Model, ServiceError> {
        let txn = self.db.begin().await?;
        let order_model = load_order(&txn, order_id).await?;
        ensure_status(&order_model, OrderStatus::Pending, "reject")?;

        let note = format!(
            "REJECTED: {}",
            reason.as_deref().unwrap_or("no reason given")
        );
        let notes = append_note(&order_model.notes, &note);
        let updated = persist_transition(&txn, &order_model, |row| {
            row.status = Set(OrderStatus::Cancelled);
            row.notes = Set(Some(notes));
        })
        .await?;

        self.emit(&txn, subjects::ORDERS_REJECTED, &updated).await?;
        txn.commit().await?;
        info!(order_id = %order_id, "order rejected");
        Ok(updated)
    }

    async fn modify(
        &self,
        order_id: Uuid,
        proposed: Vec<ProposedItem>,
    ) -> Result<order::Model, ServiceError> {
        if proposed.is_empty() {
            return Err(ServiceError::ValidationError(
                "modification must contain at least one item".to_string(),
            ));
        }
        for item in &proposed {
            if item.quantity <= 0 {
                return Err(ServiceError::ValidationError(format!(
                    "quantity must be positive for variant {}",
                    item.variant_id
                )));
            }
        }

        let txn = self.db.begin().await?;
        let order_model = load_order(&txn, order_id).await?;
        ensure_status(&order_model, OrderStatus::Pending, "modify")?;

        let variant_ids: Vec<Uuid> = proposed.iter().map(|i| i.variant_id).collect();
        let variants = product_variant::Entity::find()
            .filter(product_variant::Column::Id.is_in(variant_ids))
            .all(&txn)
            .await?;

        // The full item set is replaced atomically, never patched row by
        // row.
        order_item::Entity::delete_many()
            .filter(order_item::Column::OrderId.eq(order_id))
            .exec(&txn)
            .await?;

        let now = Utc::now();
        let mut total = Decimal::ZERO;
        for item in &proposed {
            let variant = variants
                .iter()
                .find(|v| v.id == item.variant_id)
                .ok_or_else(|| {
                    ServiceError::ValidationError(format!("unknown variant {}", item.variant_id))
                })?;
            if variant.distributor_id != order_model.distributor_id {
                return Err(ServiceError::ValidationError(format!(
                    "SKU {} is not sold by this distributor",
                    variant.sku
                )));
            }
            let unit_price = item.unit_price.unwrap_or(variant.selling_price);
            total += unit_price * Decimal::from(item.quantity);
            order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                variant_id: Set(variant.id),
                sku: Set(variant.sku.clone()),
                variant_name: Set(variant.name.clone()),
                quantity: Set(item.quantity),
                unit: Set(variant.unit.clone()),
                unit_price: Set(unit_price),
                created_at: Set(now),
            }
            .insert(&txn)
            .await?;
        }

        // Stock is not reserved until the retailer approves.
        let updated = persist_transition(&txn, &order_model, |row| {
            row.status = Set(OrderStatus::Modified);
            row.total_amount = Set(total);
        })
        .await?;

        self.emit(&txn, subjects::ORDERS_MODIFIED, &updated).await?;
        txn.commit().await?;
        info!(order_id = %order_id, total = %total, "order modified by distributor");
        Ok(updated)
    }

    /// Retailer's verdict on distributor-proposed modifications. Approval
    /// reserves stock and moves to `processing`; refusal cancels.
    #[instrument(skip(self), fields(order_id = %order_id, approved = approved))]
    pub async fn retailer_approve(
        &self,
        order_id: Uuid,
        approved: bool,
    ) -> Result<order::Model, ServiceError> {
        let txn = self.db.begin().await?;
        let order_model = load_order(&txn, order_id).await?;
        ensure_status(&order_model, OrderStatus::Modified, "approve")?;

        let updated = if approved {
            let items = order_item::Entity::find()
                .filter(order_item::Column::OrderId.eq(order_id))
                .all(&txn)
                .await?;
            reserve_stock(&txn, &items).await?;
            persist_transition(&txn, &order_model, |row| {
                row.status = Set(OrderStatus::Processing);
                row.accepted_at = Set(Some(Utc::now()));
            })
            .await?
        } else {
            persist_transition(&txn, &order_model, |row| {
                row.status = Set(OrderStatus::Cancelled);
            })
            .await?
        };

        self.emit(&txn, subjects::ORDERS_STATUS_UPDATED, &updated)
            .await?;
        txn.commit().await?;
        info!(order_id = %order_id, approved = approved, "modification decision recorded");
        Ok(updated)
    }

    /// Retailer cancellation, allowed before the distributor starts
    /// processing. Cancellation is a status, never a row removal.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn cancel_order(
        &self,
        order_id: Uuid,
        reason: Option<String>,
    ) -> Result<order::Model, ServiceError> {
        let txn = self.db.begin().await?;
        let order_model = load_order(&txn, order_id).await?;
        if !matches!(
            order_model.status,
            OrderStatus::Pending | OrderStatus::Modified
        ) {
            return Err(ServiceError::StateConflict {
                current: order_model.status.to_string(),
                attempted: "cancel".to_string(),
            });
        }

        let note = format!(
            "CANCELLED: {}",
            reason.as_deref().unwrap_or("no reason given")
        );
        let notes = append_note(&order_model.notes, &note);
        let updated = persist_transition(&txn, &order_model, |row| {
            row.status = Set(OrderStatus::Cancelled);
            row.notes = Set(Some(notes));
        })
        .await?;

        self.emit(&txn, subjects::ORDERS_STATUS_UPDATED, &updated)
            .await?;
        txn.commit().await?;
        info!(order_id = %order_id, "order cancelled");
        Ok(updated)
    }

    /// Terminal trigger for the downstream ledgers: emits
    /// `orders.completed`, which the inventory projector and product-bill
    /// engine consume.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn complete_order(&self, order_id: Uuid) -> Result<order::Model, ServiceError> {
        let txn = self.db.begin().await?;
        let order_model = load_order(&txn, order_id).await?;
        ensure_status(&order_model, OrderStatus::Processing, "complete")?;

        let updated = persist_transition(&txn, &order_model, |row| {
            row.status = Set(OrderStatus::Completed);
            row.completed_at = Set(Some(Utc::now()));
        })
        .await?;

        self.emit(&txn, subjects::ORDERS_COMPLETED, &updated).await?;
        txn.commit().await?;
        info!(order_id = %order_id, "order completed");
        Ok(updated)
    }

    async fn emit(
        &self,
        txn: &impl sea_orm::ConnectionTrait,
        subject: &str,
        order_model: &order::Model,
    ) -> Result<(), ServiceError> {
        let payload = OrderEventPayload {
            order_id: order_model.id,
            order_number: order_model.order_number.clone(),
            retailer_id: order_model.retailer_id,
            distributor_id: order_model.distributor_id,
            status: order_model.status.to_string(),
            total_amount: order_model.total_amount,
        };
        let envelope = EventEnvelope::new(subject, &payload)?;
        outbox::enqueue(txn, subject, &envelope).await
    }
}

async fn load_order(
    db: &impl sea_orm::ConnectionTrait,
    order_id: Uuid,
) -> Result<order::Model, ServiceError> {
    order::Entity::find_by_id(order_id)
        .one(db)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("order {}", order_id)))
}

fn ensure_status(
    order_model: &order::Model,
    expected: OrderStatus,
    attempted: &str,
) -> Result<(), ServiceError> {
    if order_model.status != expected {
        return Err(ServiceError::StateConflict {
            current: order_model.status.to_string(),
            attempted: attempted.to_string(),
        });
    }
    Ok(())
}

/// Version-guarded order update: the write only lands if nobody else
/// touched the row since it was read, otherwise `ConcurrentModification`
/// and the whole transaction rolls back.
async fn persist_transition<C, F>(
    txn: &C,
    current: &order::Model,
    apply: F,
) -> Result<order::Model, ServiceError>
where
    C: sea_orm::ConnectionTrait,
    F: FnOnce(&mut order::ActiveModel),
{
    let mut row = order::ActiveModel {
        updated_at: Set(Utc::now()),
        version: Set(current.version + 1),
        ..Default::default()
    };
    apply(&mut row);

    if let sea_orm::ActiveValue::Set(next) = &row.status {
        if !current.status.can_transition_to(*next) {
            return Err(ServiceError::StateConflict {
                current: current.status.to_string(),
                attempted: format!("transition to {}", next),
            });
        }
    }

    let result = order::Entity::update_many()
        .set(row)
        .filter(order::Column::Id.eq(current.id))
        .filter(order::Column::Version.eq(current.version))
        .exec(txn)
        .await?;
    if result.rows_affected == 0 {
        return Err(ServiceError::ConcurrentModification(current.id));
    }
    load_order(txn, current.id).await
}

/// Check availability and decrement distributor stock for every line.
async fn reserve_stock(
    txn: &impl sea_orm::ConnectionTrait,
    items: &[order_item::Model],
) -> Result<(), ServiceError> {
    for item in items {
        let variant = product_variant::Entity::find_by_id(item.variant_id)
            .one(txn)
            .await?
            .ok_or_else(|| {
                ServiceError::ValidationError(format!("unknown variant {}", item.variant_id))
            })?;
        if variant.stock < item.quantity {
            return Err(ServiceError::InsufficientStock {
                sku: item.sku.clone(),
                available: variant.stock,
                requested: item.quantity,
            });
        }
        let new_stock = variant.stock - item.quantity;
        let mut row: product_variant::ActiveModel = variant.into();
        row.stock = Set(new_stock);
        row.update(txn).await?;
    }
    Ok(())
}

/// Reserve stock and re-snapshot line prices at current selling prices;
/// returns the recomputed order total.
async fn reserve_stock_and_reprice(
    txn: &impl sea_orm::ConnectionTrait,
    items: &[order_item::Model],
) -> Result<Decimal, ServiceError> {
    let mut total = Decimal::ZERO;
    for item in items {
        let variant = product_variant::Entity::find_by_id(item.variant_id)
            .one(txn)
            .await?
            .ok_or_else(|| {
                ServiceError::ValidationError(format!("unknown variant {}", item.variant_id))
            })?;
        if variant.stock < item.quantity {
            return Err(ServiceError::InsufficientStock {
                sku: item.sku.clone(),
                available: variant.stock,
                requested: item.quantity,
            });
        }
        let current_price = variant.selling_price;
        let new_stock = variant.stock - item.quantity;
        let mut variant_row: product_variant::ActiveModel = variant.into();
        variant_row.stock = Set(new_stock);
        variant_row.update(txn).await?;

        if current_price != item.unit_price {
            let mut item_row: order_item::ActiveModel = item.clone().into();
            item_row.unit_price = Set(current_price);
            item_row.update(txn).await?;
        }
        total += current_price * Decimal::from(item.quantity);
    }
    Ok(total)
}
