use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Retailer-side stock row, created lazily by the inventory projector on the
/// first completed delivery of a variant.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "retailer_inventory")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub retailer_id: Uuid,
    pub variant_id: Uuid,
    pub sku: String,
    pub variant_name: String,

    pub qty: i32,
    pub selling_price: Decimal,
    pub cost_price: Decimal,

    pub last_updated: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::retailer::Entity",
        from = "Column::RetailerId",
        to = "super::retailer::Column::Id"
    )]
    Retailer,
}

impl Related<super::retailer::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Retailer.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
