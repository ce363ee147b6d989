//! Durable, idempotent consumer framework.
//!
//! Each subscription runs as an independent sequential loop: one message at
//! a time per durable name, so handlers for the same upstream stream never
//! interleave. Delivery is at-least-once; the dedup ledger turns it into
//! exactly-once application.

use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use sea_orm::{sea_query::OnConflict, DbErr, EntityTrait, Set};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::db::DbPool;
use crate::entities::event_dedup;
use crate::errors::ServiceError;
use crate::events::{DeliveredMessage, EventBus, EventEnvelope};

pub mod inventory;
pub mod ledger;
pub mod product_bill;

const RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// A business handler invoked at most once per message identifier.
///
/// Handlers must be idempotent on their own business keys as well (upserts,
/// state checks): a crash between handler success and the dedup write causes
/// one harmless re-run.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, db: &DbPool, envelope: &EventEnvelope) -> Result<(), ServiceError>;
}

/// What the framework decided to do with one delivered message.
#[derive(Debug, PartialEq, Eq)]
pub enum Disposition {
    Applied,
    Duplicate,
    Poison,
}

pub struct DurableConsumer {
    db: Arc<DbPool>,
    subject: String,
    durable: String,
    subscription: Box<dyn crate::events::Subscription>,
    handler: Arc<dyn EventHandler>,
}

impl DurableConsumer {
    pub async fn start(
        db: Arc<DbPool>,
        bus: Arc<dyn EventBus>,
        subject: &str,
        durable: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Self, ServiceError> {
        let subscription = bus.subscribe(subject, durable).await?;
        info!(subject = subject, durable = durable, "consumer ready");
        Ok(Self {
            db,
            subject: subject.to_string(),
            durable: durable.to_string(),
            subscription,
            handler,
        })
    }

    /// Run forever: blocking receive, apply, acknowledge. A handler failure
    /// leaves the message unacknowledged and backs off before the broker
    /// redelivers it.
    pub async fn run(mut self) {
        loop {
            let msg = match self.subscription.next().await {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(subject = %self.subject, "receive failed: {}", e);
                    sleep(RETRY_BACKOFF).await;
                    continue;
                }
            };
            if let Err(e) = self.apply(msg).await {
                warn!(subject = %self.subject, durable = %self.durable, "handler failed, message will redeliver: {}", e);
                sleep(RETRY_BACKOFF).await;
            }
        }
    }

    /// Process one message from the backlog. `Ok(None)` when drained.
    pub async fn process_next(&mut self) -> Result<Option<Disposition>, ServiceError> {
        match self.subscription.try_next().await? {
            Some(msg) => Ok(Some(self.apply(msg).await?)),
            None => Ok(None),
        }
    }

    /// Drain the current backlog; returns how many messages were applied
    /// (duplicates and poison messages excluded).
    pub async fn run_until_idle(&mut self) -> Result<usize, ServiceError> {
        let mut applied = 0usize;
        while let Some(disposition) = self.process_next().await? {
            if disposition == Disposition::Applied {
                applied += 1;
            }
        }
        Ok(applied)
    }

    async fn apply(&mut self, msg: DeliveredMessage) -> Result<Disposition, ServiceError> {
        // 1. Decode. A payload that cannot be parsed would redeliver
        // forever; acknowledge and drop it instead.
        let envelope = match EventEnvelope::decode(&msg.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(subject = %msg.subject, sequence = msg.sequence, "dropping poison message: {}", e);
                counter!("ledgerflow_consumer_poison_total", 1);
                self.subscription.ack(msg.sequence).await?;
                return Ok(Disposition::Poison);
            }
        };

        // 2. Identity: the envelope's event id, stable across outbox
        // republication. The broker sequence is only a fallback for foreign
        // messages without one (never the case for events this crate emits).
        let message_id = envelope.event_id.to_string();

        // 3. Dedup check before the handler runs.
        if event_dedup::Entity::find_by_id(&message_id)
            .one(self.db.as_ref())
            .await?
            .is_some()
        {
            debug!(subject = %msg.subject, message_id = %message_id, "duplicate ignored");
            counter!("ledgerflow_consumer_duplicates_total", 1);
            self.subscription.ack(msg.sequence).await?;
            return Ok(Disposition::Duplicate);
        }

        // 4. Handler, then dedup mark, then ack. A failure at any point
        // leaves the message unacknowledged for redelivery.
        self.handler.handle(self.db.as_ref(), &envelope).await?;
        mark_processed(self.db.as_ref(), &message_id).await?;
        self.subscription.ack(msg.sequence).await?;
        counter!("ledgerflow_consumer_applied_total", 1);
        Ok(Disposition::Applied)
    }
}

/// Record a message identifier as applied. Racing inserts are fine: the
/// first one wins and the conflict is ignored.
async fn mark_processed(db: &DbPool, message_id: &str) -> Result<(), ServiceError> {
    let row = event_dedup::ActiveModel {
        message_id: Set(message_id.to_string()),
        processed_at: Set(Utc::now()),
    };
    let insert = event_dedup::Entity::insert(row).on_conflict(
        OnConflict::column(event_dedup::Column::MessageId)
            .do_nothing()
            .to_owned(),
    );
    match insert.exec(db).await {
        Ok(_) => Ok(()),
        Err(DbErr::RecordNotInserted) => Ok(()),
        Err(e) => Err(e.into()),
    }
}
