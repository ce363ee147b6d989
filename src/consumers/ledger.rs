//! Accounting ledger projector: every product-bill movement leaves a
//! debit/credit trail entry with a running balance.

use async_trait::async_trait;
use sea_orm::TransactionTrait;
use tracing::{debug, instrument};

use crate::db::DbPool;
use crate::entities::ledger_entry::LedgerEntryType;
use crate::errors::ServiceError;
use crate::events::{subjects, BillUpdatedPayload, EventEnvelope, PaymentAppliedPayload};
use crate::services::ledger::{AppendEntry, LedgerService};

use super::EventHandler;

pub const DURABLE_NAME: &str = "ledger_updater";

pub struct LedgerProjector;

#[async_trait]
impl EventHandler for LedgerProjector {
    #[instrument(skip(self, db, envelope), fields(event_id = %envelope.event_id, event_type = %envelope.event_type))]
    async fn handle(&self, db: &DbPool, envelope: &EventEnvelope) -> Result<(), ServiceError> {
        match envelope.event_type.as_str() {
            subjects::PRODUCT_BILLS_UPDATED => {
                let update: BillUpdatedPayload = envelope.payload_as()?;
                if update.amount.is_zero() {
                    return Ok(());
                }
                let txn = db.begin().await?;
                LedgerService::append(
                    &txn,
                    AppendEntry {
                        retailer_id: update.retailer_id,
                        distributor_id: update.distributor_id,
                        entry_type: LedgerEntryType::Debit,
                        amount: update.amount,
                        description: update.reason.clone(),
                        bill_id: None,
                        order_id: update.order_id,
                        invoice_id: None,
                    },
                )
                .await?;
                txn.commit().await?;
                Ok(())
            }
            subjects::PRODUCT_BILLS_PAYMENT => {
                let payment: PaymentAppliedPayload = envelope.payload_as()?;
                let txn = db.begin().await?;
                LedgerService::append(
                    &txn,
                    AppendEntry {
                        retailer_id: payment.retailer_id,
                        distributor_id: payment.distributor_id,
                        entry_type: LedgerEntryType::Credit,
                        amount: payment.amount,
                        description: payment.reason.clone(),
                        bill_id: Some(payment.bill_id),
                        order_id: None,
                        invoice_id: None,
                    },
                )
                .await?;
                txn.commit().await?;
                Ok(())
            }
            other => {
                // The wildcard subscription can see subjects this projector
                // has no entry for; they are acknowledged untouched.
                debug!(event_type = other, "no ledger mapping for subject");
                Ok(())
            }
        }
    }
}
