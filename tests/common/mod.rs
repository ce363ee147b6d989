#![allow(dead_code)]

//! Shared integration-test harness: file-backed SQLite with the schema
//! created from the entity definitions, an in-memory broker, and a relay
//! plus consumers that are stepped explicitly so tests stay deterministic.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, Set};
use uuid::Uuid;

use ledgerflow::consumers::{DurableConsumer, EventHandler};
use ledgerflow::db::{self, DbPool};
use ledgerflow::entities::product_bill::{self, BillStatus};
use ledgerflow::entities::product_bill_transaction::{self, TransactionType};
use ledgerflow::entities::{distributor, product_variant, retailer};
use ledgerflow::events::outbox::OutboxRelay;
use ledgerflow::events::{EventBus, InMemoryEventBus};

pub struct TestApp {
    pub db: Arc<DbPool>,
    pub bus: Arc<InMemoryEventBus>,
    pub relay: OutboxRelay,
    _tmp: tempfile::TempDir,
}

pub async fn setup() -> TestApp {
    let tmp = tempfile::tempdir().expect("create temp dir");
    let path = tmp.path().join("test.db");
    let url = format!("sqlite://{}?mode=rwc", path.display());

    let pool = db::establish_connection(&url).await.expect("connect");
    let pool = Arc::new(pool);
    db::init_schema(pool.as_ref()).await.expect("init schema");

    let bus = Arc::new(InMemoryEventBus::new());
    let relay = OutboxRelay::new(
        Arc::clone(&pool),
        bus.clone() as Arc<dyn EventBus>,
        Duration::from_millis(10),
        100,
        Duration::from_secs(1),
    );

    TestApp {
        db: pool,
        bus,
        relay,
        _tmp: tmp,
    }
}

impl TestApp {
    pub async fn consumer(
        &self,
        subject: &str,
        durable: &str,
        handler: Arc<dyn EventHandler>,
    ) -> DurableConsumer {
        DurableConsumer::start(
            Arc::clone(&self.db),
            self.bus.clone() as Arc<dyn EventBus>,
            subject,
            durable,
            handler,
        )
        .await
        .expect("start consumer")
    }

    /// Step relay and consumers until the whole pipeline is quiescent.
    pub async fn pump(&self, consumers: &mut [&mut DurableConsumer]) {
        loop {
            let published = self.relay.drain_once().await.expect("relay drain");
            let mut applied = 0usize;
            for consumer in consumers.iter_mut() {
                applied += consumer.run_until_idle().await.expect("consumer drain");
            }
            if published == 0 && applied == 0 {
                break;
            }
        }
    }
}

pub async fn seed_retailer(db: &DbPool, state: Option<&str>) -> retailer::Model {
    retailer::ActiveModel {
        id: Set(Uuid::new_v4()),
        business_name: Set("Sri Venkateswara Stores".to_string()),
        owner_name: Set("R. Prasad".to_string()),
        gst_number: Set(Some("29ABCDE1234F1Z5".to_string())),
        pincode: Set("560001".to_string()),
        state: Set(state.map(str::to_string)),
        address: Set(None),
        created_at: Set(Utc::now()),
    }
    .insert(db)
    .await
    .expect("seed retailer")
}

pub async fn seed_distributor(db: &DbPool, state: Option<&str>) -> distributor::Model {
    distributor::ActiveModel {
        id: Set(Uuid::new_v4()),
        company_name: Set("Karnataka Agencies".to_string()),
        owner_name: Set("M. Shetty".to_string()),
        gst_number: Set(Some("29FGHIJ5678K1Z9".to_string())),
        pincode: Set("560002".to_string()),
        state: Set(state.map(str::to_string)),
        address: Set(None),
        created_at: Set(Utc::now()),
    }
    .insert(db)
    .await
    .expect("seed distributor")
}

pub async fn seed_variant(
    db: &DbPool,
    distributor_id: Uuid,
    sku: &str,
    stock: i32,
    selling_price: Decimal,
    cost_price: Decimal,
    gst_rate: Decimal,
) -> product_variant::Model {
    product_variant::ActiveModel {
        id: Set(Uuid::new_v4()),
        distributor_id: Set(distributor_id),
        name: Set(format!("Variant {}", sku)),
        sku: Set(sku.to_string()),
        unit: Set(Some("pcs".to_string())),
        hsn_code: Set(Some("0401".to_string())),
        gst_rate: Set(gst_rate),
        stock: Set(stock),
        selling_price: Set(selling_price),
        cost_price: Set(cost_price),
        created_at: Set(Utc::now()),
    }
    .insert(db)
    .await
    .expect("seed variant")
}

pub async fn seed_bill(
    db: &DbPool,
    retailer_id: Uuid,
    distributor_id: Uuid,
    variant_id: Uuid,
    unit_cost: Decimal,
) -> product_bill::Model {
    let now = Utc::now();
    product_bill::ActiveModel {
        id: Set(Uuid::new_v4()),
        retailer_id: Set(retailer_id),
        distributor_id: Set(distributor_id),
        variant_id: Set(variant_id),
        total_quantity_delivered: Set(0),
        total_quantity_returned: Set(0),
        total_amount_due: Set(Decimal::ZERO),
        total_amount_paid: Set(Decimal::ZERO),
        current_unit_cost: Set(unit_cost),
        last_transaction_date: Set(None),
        credit_limit: Set(Decimal::ZERO),
        credit_days: Set(30),
        status: Set(BillStatus::Active),
        version: Set(1),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await
    .expect("seed bill")
}

pub async fn seed_delivery(
    db: &DbPool,
    bill: &product_bill::Model,
    quantity: i32,
    unit_price: Decimal,
    occurred_at: DateTime<Utc>,
) -> product_bill_transaction::Model {
    let amount = unit_price * Decimal::from(quantity);
    let row = product_bill_transaction::ActiveModel {
        id: Set(Uuid::new_v4()),
        product_bill_id: Set(bill.id),
        txn_type: Set(TransactionType::Delivery),
        quantity: Set(quantity),
        unit_price: Set(unit_price),
        amount: Set(amount),
        order_id: Set(None),
        invoice_id: Set(None),
        recorded_by: Set(None),
        occurred_at: Set(occurred_at),
    }
    .insert(db)
    .await
    .expect("seed delivery txn");

    let mut bill_row: product_bill::ActiveModel = bill.clone().into();
    bill_row.total_quantity_delivered = Set(bill.total_quantity_delivered + quantity);
    bill_row.total_amount_due = Set(bill.total_amount_due + amount);
    bill_row.last_transaction_date = Set(Some(occurred_at));
    bill_row.version = Set(bill.version + 1);
    bill_row.update(db).await.expect("refresh bill");
    row
}
