//! Order state machine behavior, driven through the service layer against
//! a real (SQLite) database.

mod common;

use assert_matches::assert_matches;
use rust_decimal_macros::dec;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use std::sync::Arc;
use uuid::Uuid;

use ledgerflow::entities::order::OrderStatus;
use ledgerflow::entities::{outbox_event, product_variant};
use ledgerflow::errors::ServiceError;
use ledgerflow::services::orders::{
    CreateOrderRequest, DistributorAction, OrderItemRequest, OrderService, ProposedItem,
};

use common::{seed_distributor, seed_retailer, seed_variant, setup, TestApp};

async fn order_request(app: &TestApp, stock: i32) -> (CreateOrderRequest, Uuid) {
    let retailer = seed_retailer(&app.db, Some("KA")).await;
    let dist = seed_distributor(&app.db, Some("KA")).await;
    let variant = seed_variant(
        &app.db,
        dist.id,
        "RICE-5KG",
        stock,
        dec!(450),
        dec!(400),
        dec!(5),
    )
    .await;
    (
        CreateOrderRequest {
            retailer_id: retailer.id,
            distributor_id: dist.id,
            items: vec![OrderItemRequest {
                variant_id: variant.id,
                quantity: 10,
                unit: None,
            }],
            notes: None,
        },
        variant.id,
    )
}

async fn outbox_count(app: &TestApp, subject: &str) -> usize {
    outbox_event::Entity::find()
        .filter(outbox_event::Column::EventType.eq(subject))
        .all(app.db.as_ref())
        .await
        .unwrap()
        .len()
}

#[tokio::test]
async fn pending_accept_complete_happy_path() {
    let app = setup().await;
    let service = OrderService::new(Arc::clone(&app.db));
    let (request, variant_id) = order_request(&app, 50).await;

    let created = service.create_order(request).await.unwrap();
    assert_eq!(created.order.status, OrderStatus::Pending);
    assert_eq!(created.order.total_amount, dec!(4500));
    assert_eq!(created.items.len(), 1);
    assert_eq!(created.items[0].unit_price, dec!(450));

    let accepted = service
        .distributor_process(created.order.id, DistributorAction::Accept)
        .await
        .unwrap();
    assert_eq!(accepted.status, OrderStatus::Processing);
    assert!(accepted.accepted_at.is_some());

    // Stock reserved at acceptance.
    let variant = product_variant::Entity::find_by_id(variant_id)
        .one(app.db.as_ref())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(variant.stock, 40);

    let completed = service.complete_order(created.order.id).await.unwrap();
    assert_eq!(completed.status, OrderStatus::Completed);
    assert!(completed.completed_at.is_some());
    assert!(completed.version > created.order.version);

    // Every transition left its outbox row.
    assert_eq!(outbox_count(&app, "orders.created").await, 1);
    assert_eq!(outbox_count(&app, "orders.accepted").await, 1);
    assert_eq!(outbox_count(&app, "orders.completed").await, 1);
}

#[tokio::test]
async fn acceptance_reprices_at_current_selling_price() {
    let app = setup().await;
    let service = OrderService::new(Arc::clone(&app.db));
    let (request, variant_id) = order_request(&app, 50).await;
    let created = service.create_order(request).await.unwrap();

    // Price changes between creation and acceptance.
    let variant = product_variant::Entity::find_by_id(variant_id)
        .one(app.db.as_ref())
        .await
        .unwrap()
        .unwrap();
    let mut row: product_variant::ActiveModel = variant.into();
    row.selling_price = sea_orm::Set(dec!(500));
    sea_orm::ActiveModelTrait::update(row, app.db.as_ref())
        .await
        .unwrap();

    let accepted = service
        .distributor_process(created.order.id, DistributorAction::Accept)
        .await
        .unwrap();
    assert_eq!(accepted.total_amount, dec!(5000));

    let reloaded = service.get_order(created.order.id).await.unwrap().unwrap();
    assert_eq!(reloaded.items[0].unit_price, dec!(500));
}

#[tokio::test]
async fn modification_requires_retailer_approval() {
    let app = setup().await;
    let service = OrderService::new(Arc::clone(&app.db));
    let (request, variant_id) = order_request(&app, 50).await;
    let created = service.create_order(request).await.unwrap();

    let modified = service
        .distributor_process(
            created.order.id,
            DistributorAction::Modify {
                items: vec![ProposedItem {
                    variant_id,
                    quantity: 6,
                    unit_price: Some(dec!(460)),
                }],
            },
        )
        .await
        .unwrap();
    assert_eq!(modified.status, OrderStatus::Modified);
    assert_eq!(modified.total_amount, dec!(2760));

    // Stock untouched until approval.
    let variant = product_variant::Entity::find_by_id(variant_id)
        .one(app.db.as_ref())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(variant.stock, 50);

    let approved = service.retailer_approve(created.order.id, true).await.unwrap();
    assert_eq!(approved.status, OrderStatus::Processing);

    let variant = product_variant::Entity::find_by_id(variant_id)
        .one(app.db.as_ref())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(variant.stock, 44);
    assert_eq!(outbox_count(&app, "orders.modified").await, 1);
    assert_eq!(outbox_count(&app, "orders.status.updated").await, 1);
}

#[tokio::test]
async fn refused_modification_cancels_the_order() {
    let app = setup().await;
    let service = OrderService::new(Arc::clone(&app.db));
    let (request, variant_id) = order_request(&app, 50).await;
    let created = service.create_order(request).await.unwrap();

    service
        .distributor_process(
            created.order.id,
            DistributorAction::Modify {
                items: vec![ProposedItem {
                    variant_id,
                    quantity: 3,
                    unit_price: None,
                }],
            },
        )
        .await
        .unwrap();

    let refused = service
        .retailer_approve(created.order.id, false)
        .await
        .unwrap();
    assert_eq!(refused.status, OrderStatus::Cancelled);
}

#[tokio::test]
async fn rejection_records_the_reason() {
    let app = setup().await;
    let service = OrderService::new(Arc::clone(&app.db));
    let (request, _) = order_request(&app, 50).await;
    let created = service.create_order(request).await.unwrap();

    let rejected = service
        .distributor_process(
            created.order.id,
            DistributorAction::Reject {
                reason: Some("out of delivery area".to_string()),
            },
        )
        .await
        .unwrap();
    assert_eq!(rejected.status, OrderStatus::Cancelled);
    assert!(rejected
        .notes
        .as_deref()
        .unwrap()
        .contains("REJECTED: out of delivery area"));
    assert_eq!(outbox_count(&app, "orders.rejected").await, 1);
}

#[tokio::test]
async fn insufficient_stock_rolls_back_acceptance() {
    let app = setup().await;
    let service = OrderService::new(Arc::clone(&app.db));
    let (request, variant_id) = order_request(&app, 4).await;
    let created = service.create_order(request).await.unwrap();

    let err = service
        .distributor_process(created.order.id, DistributorAction::Accept)
        .await
        .unwrap_err();
    assert_matches!(
        err,
        ServiceError::InsufficientStock {
            available: 4,
            requested: 10,
            ..
        }
    );

    // Order still pending, stock unchanged.
    let reloaded = service.get_order(created.order.id).await.unwrap().unwrap();
    assert_eq!(reloaded.order.status, OrderStatus::Pending);
    let variant = product_variant::Entity::find_by_id(variant_id)
        .one(app.db.as_ref())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(variant.stock, 4);
}

#[tokio::test]
async fn state_machine_refuses_skips_and_late_cancels() {
    let app = setup().await;
    let service = OrderService::new(Arc::clone(&app.db));
    let (request, _) = order_request(&app, 50).await;
    let created = service.create_order(request).await.unwrap();

    // Completion straight from pending is refused.
    let err = service.complete_order(created.order.id).await.unwrap_err();
    assert_matches!(err, ServiceError::StateConflict { .. });

    service
        .distributor_process(created.order.id, DistributorAction::Accept)
        .await
        .unwrap();

    // Once processing, the retailer can no longer cancel.
    let err = service
        .cancel_order(created.order.id, Some("changed my mind".to_string()))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::StateConflict { .. });

    service.complete_order(created.order.id).await.unwrap();

    // Terminal states accept nothing further.
    let err = service.complete_order(created.order.id).await.unwrap_err();
    assert_matches!(err, ServiceError::StateConflict { .. });
}

#[tokio::test]
async fn retailer_cancel_before_processing() {
    let app = setup().await;
    let service = OrderService::new(Arc::clone(&app.db));
    let (request, _) = order_request(&app, 50).await;
    let created = service.create_order(request).await.unwrap();

    let cancelled = service
        .cancel_order(created.order.id, Some("duplicate order".to_string()))
        .await
        .unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert!(cancelled
        .notes
        .as_deref()
        .unwrap()
        .contains("CANCELLED: duplicate order"));
}

#[tokio::test]
async fn foreign_sku_is_rejected_at_creation() {
    let app = setup().await;
    let service = OrderService::new(Arc::clone(&app.db));

    let retailer = seed_retailer(&app.db, Some("KA")).await;
    let dist_a = seed_distributor(&app.db, Some("KA")).await;
    let dist_b = seed_distributor(&app.db, Some("KA")).await;
    let foreign = seed_variant(
        &app.db,
        dist_b.id,
        "OIL-1L",
        100,
        dec!(180),
        dec!(150),
        dec!(5),
    )
    .await;

    let err = service
        .create_order(CreateOrderRequest {
            retailer_id: retailer.id,
            distributor_id: dist_a.id,
            items: vec![OrderItemRequest {
                variant_id: foreign.id,
                quantity: 2,
                unit: None,
            }],
            notes: None,
        })
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));
}

#[tokio::test]
async fn empty_order_is_rejected() {
    let app = setup().await;
    let service = OrderService::new(Arc::clone(&app.db));
    let err = service
        .create_order(CreateOrderRequest {
            retailer_id: Uuid::new_v4(),
            distributor_id: Uuid::new_v4(),
            items: vec![],
            notes: None,
        })
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));
}
