//! Event envelope, subject space, and the broker seam.
//!
//! The broker is an external collaborator: a persistent pub/sub log with
//! subject-based routing, durable named cursors and replay-from-sequence
//! semantics. `EventBus` is the trait the rest of the crate codes against;
//! `InMemoryEventBus` implements it for single-process deployments and tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::errors::ServiceError;

pub mod outbox;

/// Subjects published by the core. Dot-hierarchical; consumers filter with
/// `*` (one token) or a trailing `>` (rest).
pub mod subjects {
    pub const ORDERS_CREATED: &str = "orders.created";
    pub const ORDERS_MODIFIED: &str = "orders.modified";
    pub const ORDERS_ACCEPTED: &str = "orders.accepted";
    pub const ORDERS_REJECTED: &str = "orders.rejected";
    pub const ORDERS_STATUS_UPDATED: &str = "orders.status.updated";
    pub const ORDERS_COMPLETED: &str = "orders.completed";

    pub const INVENTORY_UPDATED_AFTER_ORDER: &str = "inventory.updated_after_order";

    pub const PRODUCT_BILLS_UPDATED: &str = "product_bills.updated";
    pub const PRODUCT_BILLS_PAYMENT: &str = "product_bills.payment";
    pub const PRODUCT_BILLS_ALL: &str = "product_bills.*";

    pub const INVOICES_GENERATED: &str = "invoices.generated";
}

/// Current envelope schema version.
pub const ENVELOPE_VERSION: u16 = 1;

/// Schema-versioned wire envelope for every published message.
///
/// `event_id` is assigned when the envelope is built (inside the producing
/// transaction, via the outbox) and is the identity consumers deduplicate
/// on: it survives republication of an outbox row, unlike the broker
/// sequence number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub event_type: String,
    pub version: u16,
    pub occurred_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    pub fn new<T: Serialize>(event_type: &str, payload: &T) -> Result<Self, ServiceError> {
        Ok(Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            version: ENVELOPE_VERSION,
            occurred_at: Utc::now(),
            payload: serde_json::to_value(payload)
                .map_err(|e| ServiceError::InternalError(format!("encode payload: {}", e)))?,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ServiceError> {
        serde_json::to_vec(self)
            .map_err(|e| ServiceError::InternalError(format!("encode envelope: {}", e)))
    }

    pub fn to_value(&self) -> Result<serde_json::Value, ServiceError> {
        serde_json::to_value(self)
            .map_err(|e| ServiceError::InternalError(format!("encode envelope: {}", e)))
    }

    /// Decode a delivered message. Failure means the message is poison:
    /// the consumer framework acknowledges and drops it.
    pub fn decode(bytes: &[u8]) -> Result<Self, ServiceError> {
        serde_json::from_slice(bytes)
            .map_err(|e| ServiceError::PoisonMessage(format!("undecodable envelope: {}", e)))
    }

    /// Deserialize the payload into its typed struct; shape drift fails
    /// fast instead of silently reading missing fields.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ServiceError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            ServiceError::PoisonMessage(format!(
                "payload shape mismatch for {}: {}",
                self.event_type, e
            ))
        })
    }
}

// ---------------------------------------------------------------------------
// Typed payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderEventPayload {
    pub order_id: Uuid,
    pub order_number: String,
    pub retailer_id: Uuid,
    pub distributor_id: Uuid,
    pub status: String,
    pub total_amount: rust_decimal::Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveredItem {
    pub variant_id: Uuid,
    pub sku: String,
    pub quantity: i32,
    pub unit_cost: rust_decimal::Decimal,
}

/// Emitted by the inventory projector once stock has moved; drives the
/// product-bill ledger engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecordedPayload {
    pub order_id: Uuid,
    pub retailer_id: Uuid,
    pub distributor_id: Uuid,
    pub items: Vec<DeliveredItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillUpdatedPayload {
    pub retailer_id: Uuid,
    pub distributor_id: Uuid,
    pub order_id: Option<Uuid>,
    pub amount: rust_decimal::Decimal,
    /// Human-readable cause, copied into the ledger entry description.
    pub reason: String,
}

/// Credit-side bill movement: payments, returns, downward adjustments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentAppliedPayload {
    pub bill_id: Uuid,
    pub retailer_id: Uuid,
    pub distributor_id: Uuid,
    pub amount: rust_decimal::Decimal,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceGeneratedPayload {
    pub invoice_id: Uuid,
    pub retailer_id: Uuid,
    pub distributor_id: Uuid,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub total_amount: rust_decimal::Decimal,
}

// ---------------------------------------------------------------------------
// Broker seam
// ---------------------------------------------------------------------------

/// A message handed to a subscription, tagged with its broker sequence.
#[derive(Debug, Clone)]
pub struct DeliveredMessage {
    pub sequence: u64,
    pub subject: String,
    pub payload: Vec<u8>,
}

/// Durable subscription: a named cursor into the retained log. Messages
/// redeliver until acknowledged; a restarted subscription resumes from the
/// durable position and replays all unacknowledged history.
#[async_trait]
pub trait Subscription: Send {
    /// Blocking receive of the next unacknowledged matching message.
    async fn next(&mut self) -> Result<DeliveredMessage, ServiceError>;

    /// Non-blocking variant; `None` when the backlog is drained.
    async fn try_next(&mut self) -> Result<Option<DeliveredMessage>, ServiceError>;

    /// Advance the durable cursor past `sequence`.
    async fn ack(&mut self, sequence: u64) -> Result<(), ServiceError>;
}

#[async_trait]
pub trait EventBus: Send + Sync {
    /// Append to the retained log; returns the assigned sequence.
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<u64, ServiceError>;

    /// Open (or resume) a durable subscription on a subject filter.
    async fn subscribe(
        &self,
        filter: &str,
        durable: &str,
    ) -> Result<Box<dyn Subscription>, ServiceError>;
}

/// NATS-style subject matching: `*` matches exactly one token, a trailing
/// `>` matches the remainder.
pub fn subject_matches(filter: &str, subject: &str) -> bool {
    let mut f = filter.split('.');
    let mut s = subject.split('.');
    loop {
        match (f.next(), s.next()) {
            (Some(">"), _) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(ft), Some(st)) if ft == st => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory broker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct StoredMessage {
    sequence: u64,
    subject: String,
    payload: Vec<u8>,
}

#[derive(Default)]
struct BusState {
    log: Vec<StoredMessage>,
    /// Durable name -> highest acknowledged sequence.
    durables: HashMap<String, u64>,
}

/// Retained-log broker for single-process deployments and tests. Durable
/// cursors live broker-side, so a re-subscribed durable replays everything
/// it has not acknowledged.
#[derive(Clone, Default)]
pub struct InMemoryEventBus {
    state: Arc<Mutex<BusState>>,
    notify: Arc<Notify>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<u64, ServiceError> {
        let sequence = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| ServiceError::EventBusError("bus state poisoned".into()))?;
            let sequence = state.log.len() as u64 + 1;
            state.log.push(StoredMessage {
                sequence,
                subject: subject.to_string(),
                payload,
            });
            sequence
        };
        self.notify.notify_waiters();
        Ok(sequence)
    }

    async fn subscribe(
        &self,
        filter: &str,
        durable: &str,
    ) -> Result<Box<dyn Subscription>, ServiceError> {
        {
            let mut state = self
                .state
                .lock()
                .map_err(|_| ServiceError::EventBusError("bus state poisoned".into()))?;
            state.durables.entry(durable.to_string()).or_insert(0);
        }
        Ok(Box::new(InMemorySubscription {
            state: self.state.clone(),
            notify: self.notify.clone(),
            filter: filter.to_string(),
            durable: durable.to_string(),
        }))
    }
}

struct InMemorySubscription {
    state: Arc<Mutex<BusState>>,
    notify: Arc<Notify>,
    filter: String,
    durable: String,
}

impl InMemorySubscription {
    fn peek(&self) -> Result<Option<DeliveredMessage>, ServiceError> {
        let state = self
            .state
            .lock()
            .map_err(|_| ServiceError::EventBusError("bus state poisoned".into()))?;
        let floor = state.durables.get(&self.durable).copied().unwrap_or(0);
        Ok(state
            .log
            .iter()
            .find(|m| m.sequence > floor && subject_matches(&self.filter, &m.subject))
            .map(|m| DeliveredMessage {
                sequence: m.sequence,
                subject: m.subject.clone(),
                payload: m.payload.clone(),
            }))
    }
}

#[async_trait]
impl Subscription for InMemorySubscription {
    async fn next(&mut self) -> Result<DeliveredMessage, ServiceError> {
        loop {
            let notified = self.notify.notified();
            if let Some(msg) = self.peek()? {
                return Ok(msg);
            }
            notified.await;
        }
    }

    async fn try_next(&mut self) -> Result<Option<DeliveredMessage>, ServiceError> {
        self.peek()
    }

    async fn ack(&mut self, sequence: u64) -> Result<(), ServiceError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| ServiceError::EventBusError("bus state poisoned".into()))?;
        let floor = state.durables.entry(self.durable.clone()).or_insert(0);
        if sequence > *floor {
            *floor = sequence;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("orders.completed", "orders.completed", true; "exact")]
    #[test_case("orders.*", "orders.completed", true; "single wildcard")]
    #[test_case("orders.*", "orders.status.updated", false; "wildcard is one token")]
    #[test_case("orders.>", "orders.status.updated", true; "tail wildcard")]
    #[test_case("product_bills.*", "product_bills.payment", true; "bills wildcard")]
    #[test_case("orders.completed", "orders.created", false; "different leaf")]
    #[test_case("inventory.*", "orders.completed", false; "different root")]
    fn subject_matching(filter: &str, subject: &str, expected: bool) {
        assert_eq!(subject_matches(filter, subject), expected);
    }

    #[tokio::test]
    async fn durable_replays_until_acked() {
        let bus = InMemoryEventBus::new();
        let seq = bus
            .publish(subjects::ORDERS_COMPLETED, b"one".to_vec())
            .await
            .unwrap();

        let mut sub = bus
            .subscribe(subjects::ORDERS_COMPLETED, "test_durable")
            .await
            .unwrap();

        // Same message redelivers while unacknowledged.
        let first = sub.try_next().await.unwrap().unwrap();
        let again = sub.try_next().await.unwrap().unwrap();
        assert_eq!(first.sequence, again.sequence);

        sub.ack(seq).await.unwrap();
        assert!(sub.try_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn resubscribed_durable_resumes_from_cursor() {
        let bus = InMemoryEventBus::new();
        bus.publish("orders.created", b"a".to_vec()).await.unwrap();
        let s2 = bus.publish("orders.created", b"b".to_vec()).await.unwrap();

        let mut sub = bus.subscribe("orders.*", "resume").await.unwrap();
        let first = sub.try_next().await.unwrap().unwrap();
        sub.ack(first.sequence).await.unwrap();
        drop(sub);

        // New instance with the same durable name sees only the backlog.
        let mut sub = bus.subscribe("orders.*", "resume").await.unwrap();
        let next = sub.try_next().await.unwrap().unwrap();
        assert_eq!(next.sequence, s2);
    }

    #[tokio::test]
    async fn envelope_round_trip_and_poison() {
        let payload = BillUpdatedPayload {
            retailer_id: Uuid::new_v4(),
            distributor_id: Uuid::new_v4(),
            order_id: None,
            amount: rust_decimal_macros::dec!(150.50),
            reason: "order delivery recorded".to_string(),
        };
        let envelope = EventEnvelope::new(subjects::PRODUCT_BILLS_UPDATED, &payload).unwrap();
        let decoded = EventEnvelope::decode(&envelope.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.event_id, envelope.event_id);
        let typed: BillUpdatedPayload = decoded.payload_as().unwrap();
        assert_eq!(typed.amount, payload.amount);

        let poison = EventEnvelope::decode(b"{not json");
        assert!(matches!(poison, Err(ServiceError::PoisonMessage(_))));
    }
}
