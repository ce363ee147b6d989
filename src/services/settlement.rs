//! Periodic GST settlement: close a delivery window into tax invoices.
//!
//! For every (retailer, distributor) pair with deliveries inside the period,
//! one invoice is issued with per-variant GST lines. The split follows the
//! Indian GST rules: intra-state supplies split the tax evenly into CGST and
//! SGST, inter-state supplies charge the whole tax as IGST. Re-running a
//! period is a no-op because invoices are unique per pair and period.

use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set, TransactionTrait,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::db::DbPool;
use crate::entities::invoice::{self, InvoiceStatus};
use crate::entities::product_bill_transaction::{self, TransactionType};
use crate::entities::{distributor, invoice_item, product_bill, product_variant, retailer};
use crate::errors::ServiceError;
use crate::events::{outbox, subjects, EventEnvelope, InvoiceGeneratedPayload};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Granularity {
    Weekly,
    Monthly,
}

/// The half-open UTC window `[start, end)` a settlement run covers: the
/// last fully closed period before `now`. Monthly is the previous calendar
/// month; weekly is the previous ISO week (Monday to Monday). Deterministic
/// so repeated runs within the same period target the same window.
pub fn period_range(granularity: Granularity, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let today = now.date_naive();
    let (start, end) = match granularity {
        Granularity::Monthly => {
            let this_month = month_start(today);
            (month_start(this_month - Days::new(1)), this_month)
        }
        Granularity::Weekly => {
            let this_monday = today - Days::new(u64::from(today.weekday().num_days_from_monday()));
            (this_monday - Days::new(7), this_monday)
        }
    };
    (midnight_utc(start), midnight_utc(end))
}

fn month_start(date: NaiveDate) -> NaiveDate {
    date - Days::new(u64::from(date.day0()))
}

fn midnight_utc(date: NaiveDate) -> DateTime<Utc> {
    NaiveDateTime::new(date, NaiveTime::MIN).and_utc()
}

/// Split the tax on a taxable value per the supply type. `rate` is the GST
/// percentage (e.g. 18 means 18%). Components are rounded to paise.
pub fn split_gst(taxable: Decimal, rate: Decimal, inter_state: bool) -> GstSplit {
    let tax = taxable * rate / Decimal::from(100);
    if inter_state {
        GstSplit {
            cgst: Decimal::ZERO,
            sgst: Decimal::ZERO,
            igst: tax.round_dp(2),
        }
    } else {
        let half = (tax / Decimal::from(2)).round_dp(2);
        GstSplit {
            cgst: half,
            sgst: half,
            igst: Decimal::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GstSplit {
    pub cgst: Decimal,
    pub sgst: Decimal,
    pub igst: Decimal,
}

impl GstSplit {
    pub fn total(&self) -> Decimal {
        self.cgst + self.sgst + self.igst
    }
}

/// Outcome of one settlement run.
#[derive(Debug, Clone)]
pub struct SettlementRun {
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub invoices_created: usize,
    pub pairs_skipped: usize,
}

#[derive(Clone)]
pub struct SettlementService {
    db: Arc<DbPool>,
}

impl SettlementService {
    pub fn new(db: Arc<DbPool>) -> Self {
        Self { db }
    }

    /// Settle the last closed period before `now`. Each pair's invoice,
    /// its lines and the `invoices.generated` outbox row commit in one
    /// transaction; a pair already invoiced for this window is skipped.
    #[instrument(skip(self), fields(granularity = %granularity))]
    pub async fn run(
        &self,
        granularity: Granularity,
        now: DateTime<Utc>,
    ) -> Result<SettlementRun, ServiceError> {
        let (period_start, period_end) = period_range(granularity, now);
        info!(
            period_start = %period_start,
            period_end = %period_end,
            "starting settlement run"
        );

        let deliveries = product_bill_transaction::Entity::find()
            .filter(product_bill_transaction::Column::TxnType.eq(TransactionType::Delivery))
            .filter(product_bill_transaction::Column::OccurredAt.gte(period_start))
            .filter(product_bill_transaction::Column::OccurredAt.lt(period_end))
            .all(self.db.as_ref())
            .await?;

        let mut by_bill: HashMap<Uuid, Vec<&product_bill_transaction::Model>> = HashMap::new();
        for row in &deliveries {
            by_bill.entry(row.product_bill_id).or_default().push(row);
        }

        let bill_ids: Vec<Uuid> = by_bill.keys().copied().collect();
        let bills = product_bill::Entity::find()
            .filter(product_bill::Column::Id.is_in(bill_ids))
            .all(self.db.as_ref())
            .await?;

        let variant_ids: Vec<Uuid> = bills.iter().map(|b| b.variant_id).collect();
        let variants: HashMap<Uuid, product_variant::Model> = product_variant::Entity::find()
            .filter(product_variant::Column::Id.is_in(variant_ids))
            .all(self.db.as_ref())
            .await?
            .into_iter()
            .map(|v| (v.id, v))
            .collect();

        let mut by_pair: HashMap<(Uuid, Uuid), Vec<&product_bill::Model>> = HashMap::new();
        for bill in &bills {
            by_pair
                .entry((bill.retailer_id, bill.distributor_id))
                .or_default()
                .push(bill);
        }

        let mut created = 0usize;
        let mut skipped = 0usize;
        for ((retailer_id, distributor_id), pair_bills) in by_pair {
            let issued = self
                .settle_pair(
                    retailer_id,
                    distributor_id,
                    &pair_bills,
                    &by_bill,
                    &variants,
                    period_start,
                    period_end,
                )
                .await?;
            if issued {
                created += 1;
            } else {
                skipped += 1;
            }
        }

        info!(created = created, skipped = skipped, "settlement run finished");
        Ok(SettlementRun {
            period_start,
            period_end,
            invoices_created: created,
            pairs_skipped: skipped,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn settle_pair(
        &self,
        retailer_id: Uuid,
        distributor_id: Uuid,
        pair_bills: &[&product_bill::Model],
        by_bill: &HashMap<Uuid, Vec<&product_bill_transaction::Model>>,
        variants: &HashMap<Uuid, product_variant::Model>,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<bool, ServiceError> {
        let txn = self.db.begin().await?;

        let existing = invoice::Entity::find()
            .filter(invoice::Column::RetailerId.eq(retailer_id))
            .filter(invoice::Column::DistributorId.eq(distributor_id))
            .filter(invoice::Column::PeriodStart.eq(period_start))
            .filter(invoice::Column::PeriodEnd.eq(period_end))
            .one(&txn)
            .await?;
        if let Some(inv) = existing {
            debug!(invoice_id = %inv.id, "period already invoiced, skipping pair");
            return Ok(false);
        }

        let retailer_row = retailer::Entity::find_by_id(retailer_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("retailer {}", retailer_id)))?;
        let distributor_row = distributor::Entity::find_by_id(distributor_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("distributor {}", distributor_id)))?;
        let inter_state = is_inter_state(
            retailer_row.state.as_deref(),
            distributor_row.state.as_deref(),
        );

        let now = Utc::now();
        let invoice_id = Uuid::new_v4();
        let mut lines = Vec::new();
        let mut total_taxable = Decimal::ZERO;
        let mut total_tax = GstSplit {
            cgst: Decimal::ZERO,
            sgst: Decimal::ZERO,
            igst: Decimal::ZERO,
        };

        for bill in pair_bills {
            let Some(rows) = by_bill.get(&bill.id) else {
                continue;
            };
            let variant = variants.get(&bill.variant_id).ok_or_else(|| {
                ServiceError::NotFound(format!("variant {}", bill.variant_id))
            })?;

            let quantity: i32 = rows.iter().map(|r| r.quantity).sum();
            let taxable: Decimal = rows.iter().map(|r| r.amount).sum();
            if quantity == 0 || taxable.is_zero() {
                continue;
            }
            let unit_price = rows
                .last()
                .map(|r| r.unit_price)
                .unwrap_or(bill.current_unit_cost);

            let split = split_gst(taxable, variant.gst_rate, inter_state);
            total_taxable += taxable;
            total_tax.cgst += split.cgst;
            total_tax.sgst += split.sgst;
            total_tax.igst += split.igst;

            lines.push(invoice_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                invoice_id: Set(invoice_id),
                product_bill_id: Set(bill.id),
                variant_id: Set(bill.variant_id),
                hsn_code: Set(variant.hsn_code.clone()),
                quantity: Set(quantity),
                unit_price: Set(unit_price),
                taxable_value: Set(taxable),
                cgst: Set(split.cgst),
                sgst: Set(split.sgst),
                igst: Set(split.igst),
                amount: Set(taxable + split.total()),
            });
        }

        // A pair can group to zero billable lines (e.g. zero-value
        // deliveries); no empty invoices.
        if lines.is_empty() {
            return Ok(false);
        }

        let total_amount = total_taxable + total_tax.total();
        let invoice_row = invoice::ActiveModel {
            id: Set(invoice_id),
            invoice_number: Set(invoice_number(period_start)),
            retailer_id: Set(retailer_id),
            distributor_id: Set(distributor_id),
            period_start: Set(period_start),
            period_end: Set(period_end),
            currency: Set("INR".to_string()),
            total_taxable_value: Set(total_taxable),
            cgst: Set(total_tax.cgst),
            sgst: Set(total_tax.sgst),
            igst: Set(total_tax.igst),
            total_amount: Set(total_amount),
            status: Set(InvoiceStatus::Issued),
            created_at: Set(now),
            updated_at: Set(now),
        };
        let invoice_model = invoice_row.insert(&txn).await?;
        for line in lines {
            line.insert(&txn).await?;
        }

        let payload = InvoiceGeneratedPayload {
            invoice_id,
            retailer_id,
            distributor_id,
            period_start,
            period_end,
            total_amount,
        };
        let envelope = EventEnvelope::new(subjects::INVOICES_GENERATED, &payload)?;
        outbox::enqueue(&txn, subjects::INVOICES_GENERATED, &envelope).await?;

        txn.commit().await?;
        info!(
            invoice_id = %invoice_model.id,
            invoice_number = %invoice_model.invoice_number,
            total = %total_amount,
            "invoice issued"
        );
        Ok(true)
    }
}

/// Supply is intra-state only when both parties declare the same state;
/// a missing state on either side is treated as inter-state.
fn is_inter_state(retailer_state: Option<&str>, distributor_state: Option<&str>) -> bool {
    match (retailer_state, distributor_state) {
        (Some(r), Some(d)) => !r.eq_ignore_ascii_case(d),
        _ => true,
    }
}

fn invoice_number(period_start: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "INV-{:04}{:02}-{}",
        period_start.year(),
        period_start.month(),
        &suffix[..8]
    )
}
