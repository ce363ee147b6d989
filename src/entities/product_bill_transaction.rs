use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TransactionType {
    #[sea_orm(string_value = "sale")]
    Sale,
    #[sea_orm(string_value = "delivery")]
    Delivery,
    #[sea_orm(string_value = "payment")]
    Payment,
    #[sea_orm(string_value = "return")]
    Return,
    #[sea_orm(string_value = "adjustment")]
    Adjustment,
    #[sea_orm(string_value = "price_change")]
    PriceChange,
}

/// Immutable append-only child of a product bill.
///
/// `amount` is signed from the bill's point of view: deliveries increase the
/// amount due (positive), payments and returns reduce what is owed
/// (negative), adjustments carry their own sign.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "product_bill_transactions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub product_bill_id: Uuid,
    pub txn_type: TransactionType,

    pub quantity: i32,
    pub unit_price: Decimal,
    pub amount: Decimal,

    pub order_id: Option<Uuid>,
    pub invoice_id: Option<Uuid>,
    /// User who recorded the transaction, when user-initiated.
    pub recorded_by: Option<Uuid>,

    pub occurred_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::product_bill::Entity",
        from = "Column::ProductBillId",
        to = "super::product_bill::Column::Id"
    )]
    ProductBill,
}

impl Related<super::product_bill::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ProductBill.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
