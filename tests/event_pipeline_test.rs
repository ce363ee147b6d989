//! End-to-end event propagation: outbox relay into the durable consumer
//! chain, exactly-once application, and poison handling.

mod common;

use chrono::Utc;
use rust_decimal_macros::dec;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set};
use std::sync::Arc;
use uuid::Uuid;

use ledgerflow::consumers::{inventory, ledger, product_bill, Disposition, EventHandler};
use ledgerflow::entities::ledger_entry::{self, LedgerEntryType};
use ledgerflow::entities::product_bill_transaction::{self, TransactionType};
use ledgerflow::entities::{event_dedup, outbox_event, product_bill as bill_entity, retailer_inventory};
use ledgerflow::events::{
    subjects, DeliveredItem, DeliveryRecordedPayload, EventBus, EventEnvelope, OrderEventPayload,
};
use ledgerflow::services::ledger::{AppendEntry, LedgerService};
use ledgerflow::services::orders::{
    CreateOrderRequest, DistributorAction, OrderItemRequest, OrderService,
};

use common::{seed_distributor, seed_retailer, seed_variant, setup};

#[tokio::test]
async fn completed_order_flows_to_inventory_bills_and_ledger() {
    let app = setup().await;
    let service = OrderService::new(Arc::clone(&app.db));

    let retailer = seed_retailer(&app.db, Some("KA")).await;
    let dist = seed_distributor(&app.db, Some("KA")).await;
    let variant = seed_variant(
        &app.db,
        dist.id,
        "ATTA-10KG",
        100,
        dec!(520),
        dec!(470),
        dec!(5),
    )
    .await;

    let created = service
        .create_order(CreateOrderRequest {
            retailer_id: retailer.id,
            distributor_id: dist.id,
            items: vec![OrderItemRequest {
                variant_id: variant.id,
                quantity: 10,
                unit: None,
            }],
            notes: None,
        })
        .await
        .unwrap();
    service
        .distributor_process(created.order.id, DistributorAction::Accept)
        .await
        .unwrap();
    service.complete_order(created.order.id).await.unwrap();

    let mut inv = app
        .consumer(
            subjects::ORDERS_COMPLETED,
            inventory::DURABLE_NAME,
            Arc::new(inventory::InventoryProjector),
        )
        .await;
    let mut bills = app
        .consumer(
            subjects::INVENTORY_UPDATED_AFTER_ORDER,
            product_bill::DURABLE_NAME,
            Arc::new(product_bill::ProductBillProjector),
        )
        .await;
    let mut ledg = app
        .consumer(
            subjects::PRODUCT_BILLS_ALL,
            ledger::DURABLE_NAME,
            Arc::new(ledger::LedgerProjector),
        )
        .await;

    app.pump(&mut [&mut inv, &mut bills, &mut ledg]).await;

    // Retailer inventory received the goods at the cost snapshot.
    let stock = retailer_inventory::Entity::find()
        .filter(retailer_inventory::Column::RetailerId.eq(retailer.id))
        .one(app.db.as_ref())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stock.qty, 10);
    assert_eq!(stock.cost_price, dec!(470));

    // A product bill was created lazily with the delivery folded in.
    let bill = bill_entity::Entity::find()
        .filter(bill_entity::Column::RetailerId.eq(retailer.id))
        .filter(bill_entity::Column::VariantId.eq(variant.id))
        .one(app.db.as_ref())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(bill.total_quantity_delivered, 10);
    assert_eq!(bill.total_amount_due, dec!(4700));
    assert_eq!(bill.outstanding(), dec!(4700));

    // The ledger carries the matching debit with a running balance.
    let entries = ledger_entry::Entity::find()
        .filter(ledger_entry::Column::RetailerId.eq(retailer.id))
        .all(app.db.as_ref())
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].entry_type, LedgerEntryType::Debit);
    assert_eq!(entries[0].amount, dec!(4700));
    assert_eq!(entries[0].balance, dec!(4700));

    // Everything the pipeline emitted is marked published.
    let pending = outbox_event::Entity::find()
        .filter(outbox_event::Column::Published.eq(false))
        .all(app.db.as_ref())
        .await
        .unwrap();
    assert!(pending.is_empty());
}

#[tokio::test]
async fn redelivered_event_applies_exactly_once() {
    let app = setup().await;
    let service = OrderService::new(Arc::clone(&app.db));

    let retailer = seed_retailer(&app.db, Some("KA")).await;
    let dist = seed_distributor(&app.db, Some("KA")).await;
    let variant = seed_variant(
        &app.db,
        dist.id,
        "SUGAR-1KG",
        50,
        dec!(48),
        dec!(42),
        dec!(5),
    )
    .await;

    let created = service
        .create_order(CreateOrderRequest {
            retailer_id: retailer.id,
            distributor_id: dist.id,
            items: vec![OrderItemRequest {
                variant_id: variant.id,
                quantity: 5,
                unit: None,
            }],
            notes: None,
        })
        .await
        .unwrap();
    service
        .distributor_process(created.order.id, DistributorAction::Accept)
        .await
        .unwrap();
    service.complete_order(created.order.id).await.unwrap();

    app.relay.drain_once().await.unwrap();

    let mut inv = app
        .consumer(
            subjects::ORDERS_COMPLETED,
            inventory::DURABLE_NAME,
            Arc::new(inventory::InventoryProjector),
        )
        .await;
    assert_eq!(inv.run_until_idle().await.unwrap(), 1);

    // Replay the same envelope, as a broker redelivery after a lost ack
    // would: same event id, new sequence.
    let completed_row = outbox_event::Entity::find()
        .filter(outbox_event::Column::EventType.eq(subjects::ORDERS_COMPLETED))
        .one(app.db.as_ref())
        .await
        .unwrap()
        .unwrap();
    let bytes = serde_json::to_vec(&completed_row.payload).unwrap();
    app.bus
        .publish(subjects::ORDERS_COMPLETED, bytes)
        .await
        .unwrap();

    let disposition = inv.process_next().await.unwrap().unwrap();
    assert_eq!(disposition, Disposition::Duplicate);

    // Inventory unchanged after the duplicate.
    let stock = retailer_inventory::Entity::find()
        .filter(retailer_inventory::Column::RetailerId.eq(retailer.id))
        .one(app.db.as_ref())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stock.qty, 5);

    // One dedup row per applied event id.
    let dedup_rows = event_dedup::Entity::find().all(app.db.as_ref()).await.unwrap();
    assert_eq!(dedup_rows.len(), 1);
}

#[tokio::test]
async fn poison_message_is_dropped_and_backlog_continues() {
    let app = setup().await;

    app.bus
        .publish(subjects::ORDERS_COMPLETED, b"not an envelope".to_vec())
        .await
        .unwrap();

    let mut inv = app
        .consumer(
            subjects::ORDERS_COMPLETED,
            inventory::DURABLE_NAME,
            Arc::new(inventory::InventoryProjector),
        )
        .await;

    let disposition = inv.process_next().await.unwrap().unwrap();
    assert_eq!(disposition, Disposition::Poison);

    // The poison message was acknowledged, not left to redeliver.
    assert!(inv.process_next().await.unwrap().is_none());
}

#[tokio::test]
async fn relay_is_idempotent_when_outbox_is_empty() {
    let app = setup().await;
    assert_eq!(app.relay.drain_once().await.unwrap(), 0);
    assert_eq!(app.relay.drain_once().await.unwrap(), 0);
}

// A crash between handler commit and the dedup write re-runs the handler
// with the same envelope; the bill engine must not fold the delivery twice.
#[tokio::test]
async fn bill_handler_rerun_does_not_double_the_delivery() {
    let app = setup().await;
    let retailer = seed_retailer(&app.db, Some("KA")).await;
    let dist = seed_distributor(&app.db, Some("KA")).await;
    let variant = seed_variant(
        &app.db,
        dist.id,
        "DAL-1KG",
        100,
        dec!(140),
        dec!(120),
        dec!(5),
    )
    .await;

    let payload = DeliveryRecordedPayload {
        order_id: Uuid::new_v4(),
        retailer_id: retailer.id,
        distributor_id: dist.id,
        items: vec![DeliveredItem {
            variant_id: variant.id,
            sku: variant.sku.clone(),
            quantity: 10,
            unit_cost: dec!(120),
        }],
    };
    let envelope = EventEnvelope::new(subjects::INVENTORY_UPDATED_AFTER_ORDER, &payload).unwrap();

    let projector = product_bill::ProductBillProjector;
    projector.handle(app.db.as_ref(), &envelope).await.unwrap();
    projector.handle(app.db.as_ref(), &envelope).await.unwrap();

    let bill = bill_entity::Entity::find()
        .filter(bill_entity::Column::VariantId.eq(variant.id))
        .one(app.db.as_ref())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(bill.total_quantity_delivered, 10);
    assert_eq!(bill.total_amount_due, dec!(1200));

    let deliveries = product_bill_transaction::Entity::find()
        .filter(product_bill_transaction::Column::TxnType.eq(TransactionType::Delivery))
        .all(app.db.as_ref())
        .await
        .unwrap();
    assert_eq!(deliveries.len(), 1);

    // The follow-on event is also emitted exactly once.
    let updates = outbox_event::Entity::find()
        .filter(outbox_event::Column::EventType.eq(subjects::PRODUCT_BILLS_UPDATED))
        .all(app.db.as_ref())
        .await
        .unwrap();
    assert_eq!(updates.len(), 1);
}

#[tokio::test]
async fn inventory_handler_rerun_does_not_move_stock_twice() {
    let app = setup().await;
    let service = OrderService::new(Arc::clone(&app.db));

    let retailer = seed_retailer(&app.db, Some("KA")).await;
    let dist = seed_distributor(&app.db, Some("KA")).await;
    let variant = seed_variant(
        &app.db,
        dist.id,
        "SALT-1KG",
        100,
        dec!(25),
        dec!(20),
        dec!(0),
    )
    .await;

    let created = service
        .create_order(CreateOrderRequest {
            retailer_id: retailer.id,
            distributor_id: dist.id,
            items: vec![OrderItemRequest {
                variant_id: variant.id,
                quantity: 10,
                unit: None,
            }],
            notes: None,
        })
        .await
        .unwrap();
    service
        .distributor_process(created.order.id, DistributorAction::Accept)
        .await
        .unwrap();
    let completed = service.complete_order(created.order.id).await.unwrap();

    let payload = OrderEventPayload {
        order_id: completed.id,
        order_number: completed.order_number.clone(),
        retailer_id: completed.retailer_id,
        distributor_id: completed.distributor_id,
        status: completed.status.to_string(),
        total_amount: completed.total_amount,
    };
    let envelope = EventEnvelope::new(subjects::ORDERS_COMPLETED, &payload).unwrap();

    let projector = inventory::InventoryProjector;
    projector.handle(app.db.as_ref(), &envelope).await.unwrap();
    let stock_after_first = ledgerflow::entities::product_variant::Entity::find_by_id(variant.id)
        .one(app.db.as_ref())
        .await
        .unwrap()
        .unwrap()
        .stock;

    projector.handle(app.db.as_ref(), &envelope).await.unwrap();

    let stock_after_second = ledgerflow::entities::product_variant::Entity::find_by_id(variant.id)
        .one(app.db.as_ref())
        .await
        .unwrap()
        .unwrap()
        .stock;
    assert_eq!(stock_after_first, stock_after_second);

    let inventory_row = retailer_inventory::Entity::find()
        .filter(retailer_inventory::Column::RetailerId.eq(retailer.id))
        .one(app.db.as_ref())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(inventory_row.qty, 10);

    let markers = outbox_event::Entity::find()
        .filter(outbox_event::Column::EventType.eq(subjects::INVENTORY_UPDATED_AFTER_ORDER))
        .all(app.db.as_ref())
        .await
        .unwrap();
    assert_eq!(markers.len(), 1);
}

// Two entries written in the same timestamp tick have no well-defined
// "latest row"; the running balance must come out right regardless.
#[tokio::test]
async fn running_balance_survives_timestamp_ties() {
    let app = setup().await;
    let retailer_id = Uuid::new_v4();
    let distributor_id = Uuid::new_v4();
    let tick = Utc::now();

    for (entry_type, amount, balance) in [
        (LedgerEntryType::Debit, dec!(1000), dec!(1000)),
        (LedgerEntryType::Credit, dec!(300), dec!(700)),
    ] {
        ledger_entry::ActiveModel {
            id: Set(Uuid::new_v4()),
            retailer_id: Set(retailer_id),
            distributor_id: Set(distributor_id),
            entry_type: Set(entry_type),
            amount: Set(amount),
            balance: Set(balance),
            description: Set("seeded".to_string()),
            bill_id: Set(None),
            order_id: Set(None),
            invoice_id: Set(None),
            created_at: Set(tick),
        }
        .insert(app.db.as_ref())
        .await
        .unwrap();
    }

    let appended = LedgerService::append(
        app.db.as_ref(),
        AppendEntry {
            retailer_id,
            distributor_id,
            entry_type: LedgerEntryType::Debit,
            amount: dec!(50),
            description: "order delivery recorded".to_string(),
            bill_id: None,
            order_id: None,
            invoice_id: None,
        },
    )
    .await
    .unwrap();
    assert_eq!(appended.balance, dec!(750));
}
