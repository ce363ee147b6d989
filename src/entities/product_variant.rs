use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Distributor-side catalog entry: the sellable unit with live stock and
/// pricing. Orders snapshot the price at creation time; acceptance re-reads
/// the current values.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "product_variants")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub distributor_id: Uuid,
    pub name: String,
    #[sea_orm(unique)]
    pub sku: String,
    pub unit: Option<String>,

    pub hsn_code: Option<String>,
    /// GST rate in percent, e.g. 18.00.
    pub gst_rate: Decimal,

    pub stock: i32,
    pub selling_price: Decimal,
    pub cost_price: Decimal,

    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::distributor::Entity",
        from = "Column::DistributorId",
        to = "super::distributor::Column::Id"
    )]
    Distributor,
}

impl Related<super::distributor::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Distributor.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
