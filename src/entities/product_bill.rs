use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "lowercase")]
pub enum BillStatus {
    #[sea_orm(string_value = "active")]
    Active,
    #[sea_orm(string_value = "inactive")]
    Inactive,
    #[sea_orm(string_value = "disputed")]
    Disputed,
}

/// Running per-(retailer, distributor, variant) statement of what has been
/// delivered, returned, owed and paid.
///
/// The cumulative fields are a materialized fold over the bill's transaction
/// log (`product_bill_transactions`); the log is the source of truth. Bills
/// are created lazily on first delivery and never deleted, only
/// status-flagged.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "product_bills")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub retailer_id: Uuid,
    pub distributor_id: Uuid,
    pub variant_id: Uuid,

    pub total_quantity_delivered: i32,
    pub total_quantity_returned: i32,
    pub total_amount_due: Decimal,
    pub total_amount_paid: Decimal,
    pub current_unit_cost: Decimal,
    pub last_transaction_date: Option<DateTime<Utc>>,

    pub credit_limit: Decimal,
    pub credit_days: i32,

    pub status: BillStatus,
    /// Optimistic concurrency guard for user-initiated writes (payments,
    /// returns, adjustments) that race outside the consumer loop.
    pub version: i32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Model {
    /// Amount still owed. Invariant: never negative.
    pub fn outstanding(&self) -> Decimal {
        self.total_amount_due - self.total_amount_paid
    }

    /// Quantity delivered net of returns. Invariant: never negative.
    pub fn net_quantity(&self) -> i32 {
        self.total_quantity_delivered - self.total_quantity_returned
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::product_bill_transaction::Entity")]
    Transactions,
}

impl Related<super::product_bill_transaction::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Transactions.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
