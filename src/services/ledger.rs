//! Append-only accounting ledger with running-balance snapshots.

use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, FromQueryResult, QueryFilter,
    QuerySelect, Set,
};
use uuid::Uuid;

use crate::entities::ledger_entry::{self, LedgerEntryType};
use crate::errors::ServiceError;

/// One debit/credit record to append for a retailer/distributor pair.
#[derive(Debug, Clone)]
pub struct AppendEntry {
    pub retailer_id: Uuid,
    pub distributor_id: Uuid,
    pub entry_type: LedgerEntryType,
    pub amount: Decimal,
    pub description: String,
    pub bill_id: Option<Uuid>,
    pub order_id: Option<Uuid>,
    pub invoice_id: Option<Uuid>,
}

#[derive(Debug, FromQueryResult)]
struct EntryTypeTotal {
    entry_type: LedgerEntryType,
    total: Option<Decimal>,
}

pub struct LedgerService;

impl LedgerService {
    /// Append an entry, computing the running balance at insert time.
    /// Callers pass their own transaction so the entry commits atomically
    /// with whatever triggered it.
    ///
    /// The previous balance is the signed sum of the pair's entries rather
    /// than the `balance` snapshot of the latest row: two rows sharing one
    /// timestamp tick have no well-defined "latest", and a sum cannot chain
    /// off the wrong predecessor.
    pub async fn append<C: ConnectionTrait>(
        db: &C,
        entry: AppendEntry,
    ) -> Result<ledger_entry::Model, ServiceError> {
        if entry.amount <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(format!(
                "ledger amount must be positive, got {}",
                entry.amount
            )));
        }

        let totals = ledger_entry::Entity::find()
            .select_only()
            .column(ledger_entry::Column::EntryType)
            .column_as(ledger_entry::Column::Amount.sum(), "total")
            .filter(ledger_entry::Column::RetailerId.eq(entry.retailer_id))
            .filter(ledger_entry::Column::DistributorId.eq(entry.distributor_id))
            .group_by(ledger_entry::Column::EntryType)
            .into_model::<EntryTypeTotal>()
            .all(db)
            .await?;

        let mut previous_balance = Decimal::ZERO;
        for row in totals {
            let total = row.total.unwrap_or(Decimal::ZERO);
            previous_balance += match row.entry_type {
                LedgerEntryType::Debit => total,
                LedgerEntryType::Credit => -total,
            };
        }

        let signed = match entry.entry_type {
            LedgerEntryType::Debit => entry.amount,
            LedgerEntryType::Credit => -entry.amount,
        };

        let row = ledger_entry::ActiveModel {
            id: Set(Uuid::new_v4()),
            retailer_id: Set(entry.retailer_id),
            distributor_id: Set(entry.distributor_id),
            entry_type: Set(entry.entry_type),
            amount: Set(entry.amount),
            balance: Set(previous_balance + signed),
            description: Set(entry.description),
            bill_id: Set(entry.bill_id),
            order_id: Set(entry.order_id),
            invoice_id: Set(entry.invoice_id),
            created_at: Set(Utc::now()),
        };
        Ok(row.insert(db).await?)
    }
}
