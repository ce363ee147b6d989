use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "lowercase")]
pub enum LedgerEntryType {
    #[sea_orm(string_value = "debit")]
    Debit,
    #[sea_orm(string_value = "credit")]
    Credit,
}

/// Append-only debit/credit trail for a retailer/distributor pair.
///
/// `balance` is the running balance snapshot computed at insert time and
/// never recomputed later.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "ledger_entries")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub retailer_id: Uuid,
    pub distributor_id: Uuid,

    pub entry_type: LedgerEntryType,
    pub amount: Decimal,
    pub balance: Decimal,
    pub description: String,

    pub bill_id: Option<Uuid>,
    pub order_id: Option<Uuid>,
    pub invoice_id: Option<Uuid>,

    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn is_debit(&self) -> bool {
        self.entry_type == LedgerEntryType::Debit
    }

    pub fn is_credit(&self) -> bool {
        self.entry_type == LedgerEntryType::Credit
    }

    /// Signed amount (positive for debit, negative for credit).
    pub fn signed_amount(&self) -> Decimal {
        match self.entry_type {
            LedgerEntryType::Debit => self.amount,
            LedgerEntryType::Credit => -self.amount,
        }
    }
}
