use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Transactional outbox row.
///
/// Every business mutation that must notify other ledgers inserts exactly
/// one of these in the same transaction as the mutation. The relay flips
/// `published` once the event reaches the broker.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "outbox_events")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Broker subject, e.g. `orders.completed`.
    pub event_type: String,
    pub payload: Json,
    pub published: bool,
    /// Last publish error, kept for operators; cleared on success.
    pub error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
