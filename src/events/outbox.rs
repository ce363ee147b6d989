//! Transactional outbox: a state change and its notification commit
//! atomically, and a polling relay bridges "committed" to "published".

use chrono::Utc;
use metrics::counter;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::DbPool;
use crate::entities::outbox_event;
use crate::errors::ServiceError;
use crate::events::{EventBus, EventEnvelope};

/// Insert an outbox row through the same connection (transaction) as the
/// business mutation it describes. This is the only authoritative publish
/// path; there is no best-effort direct publish alongside it.
pub async fn enqueue(
    db: &impl ConnectionTrait,
    subject: &str,
    envelope: &EventEnvelope,
) -> Result<(), ServiceError> {
    let row = outbox_event::ActiveModel {
        id: Set(Uuid::new_v4()),
        event_type: Set(subject.to_string()),
        payload: Set(envelope.to_value()?),
        published: Set(false),
        error: Set(None),
        created_at: Set(Utc::now()),
        published_at: Set(None),
    };
    row.insert(db).await?;
    debug!(subject = subject, event_id = %envelope.event_id, "outbox event enqueued");
    Ok(())
}

/// Polls the outbox table and republishes unpublished entries to the broker.
///
/// Restart-safe because all state lives in the table. A failed publish
/// leaves its row pending for the next poll; failures are isolated per
/// entry and never block later rows.
pub struct OutboxRelay {
    db: Arc<DbPool>,
    bus: Arc<dyn EventBus>,
    poll_interval: Duration,
    batch_size: u64,
    publish_timeout: Duration,
}

impl OutboxRelay {
    pub fn new(
        db: Arc<DbPool>,
        bus: Arc<dyn EventBus>,
        poll_interval: Duration,
        batch_size: u64,
        publish_timeout: Duration,
    ) -> Self {
        Self {
            db,
            bus,
            poll_interval,
            batch_size,
            publish_timeout,
        }
    }

    /// Run forever on the poll interval.
    pub async fn run(self) {
        info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            batch_size = self.batch_size,
            "outbox relay started"
        );
        loop {
            if let Err(e) = self.drain_once().await {
                warn!("outbox relay poll failed: {}", e);
            }
            sleep(self.poll_interval).await;
        }
    }

    /// Publish one bounded batch of pending entries, oldest first. Returns
    /// the number of entries successfully published.
    pub async fn drain_once(&self) -> Result<usize, ServiceError> {
        let pending = outbox_event::Entity::find()
            .filter(outbox_event::Column::Published.eq(false))
            .order_by_asc(outbox_event::Column::CreatedAt)
            .limit(self.batch_size)
            .all(self.db.as_ref())
            .await?;

        let mut published = 0usize;
        for entry in pending {
            match self.publish_entry(&entry).await {
                Ok(()) => {
                    let mut row: outbox_event::ActiveModel = entry.into();
                    row.published = Set(true);
                    row.published_at = Set(Some(Utc::now()));
                    row.error = Set(None);
                    row.update(self.db.as_ref()).await?;
                    counter!("ledgerflow_outbox_published_total", 1);
                    published += 1;
                }
                Err(e) => {
                    // Left pending; retried on the next poll.
                    warn!(entry_id = %entry.id, subject = %entry.event_type, "outbox publish failed: {}", e);
                    counter!("ledgerflow_outbox_failed_total", 1);
                    let mut row: outbox_event::ActiveModel = entry.into();
                    row.error = Set(Some(e.to_string()));
                    row.update(self.db.as_ref()).await?;
                }
            }
        }
        Ok(published)
    }

    async fn publish_entry(&self, entry: &outbox_event::Model) -> Result<(), ServiceError> {
        let bytes = serde_json::to_vec(&entry.payload)
            .map_err(|e| ServiceError::InternalError(format!("encode outbox payload: {}", e)))?;

        // Bounded so one hung broker call cannot stall the whole loop.
        match timeout(
            self.publish_timeout,
            self.bus.publish(&entry.event_type, bytes),
        )
        .await
        {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(ServiceError::EventBusError(format!(
                "publish timed out after {}ms",
                self.publish_timeout.as_millis()
            ))),
        }
    }
}
