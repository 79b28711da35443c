use actix_web::http::StatusCode;
use kalatori_engine::{
    chain::{BlockRef, ObservedTransfer},
    db_types::{AssetRef, OrderId},
    test_utils::{TestHarness, MERCHANT},
    ChainError,
    HealthBoard,
};
use serde_json::Value;

use super::helpers::{post_request, Body};
use crate::data_objects::OrderResponse;

const DOT_ORDER: &str = r#"{"amount": 100, "currency": "DOT", "callback": "https://example.com/callback"}"#;

fn parse(body: &str) -> OrderResponse {
    serde_json::from_str(body).expect("Not a valid order response")
}

async fn pay(h: &TestHarness, order_id: &str, amount: u128) {
    let order = h.engine.fetch_order(&OrderId::from(order_id)).await.unwrap();
    let transfer = h.polkadot.transfer(&order.payment_account, AssetRef::Native, amount);
    let number = h.polkadot.produce_block(vec![transfer.clone()]);
    let block = BlockRef { number, hash: format!("0xblock{number}") };
    let observed = ObservedTransfer::new("polkadot", &block, transfer, true);
    h.engine.process_transfer(&order.order_id, observed).await.unwrap();
}

#[actix_web::test]
async fn create_order() {
    let _ = env_logger::try_init().ok();
    let h = TestHarness::new().await;
    let (status, body) = post_request(&h, HealthBoard::new(), "/v2/order/order_1", Body::Json(DOT_ORDER)).await;
    assert_eq!(status, StatusCode::CREATED);
    let order = parse(&body);
    assert_eq!(order.order, "order_1");
    assert_eq!(order.amount, 100.0);
    assert_eq!(order.currency.symbol, "DOT");
    assert_eq!(order.currency.chain_name, "polkadot");
    assert_eq!(order.callback, "https://example.com/callback");
    assert_eq!(order.recipient, MERCHANT);
    assert!(!order.payment_account.is_empty());
    assert_eq!(order.repaid_amount, 0.0);
    assert_eq!(order.server_info.instance_id, "calm-otter-0001");

    let json: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["payment_status"], "pending");
    assert_eq!(json["withdrawal_status"], "waiting");
    assert_eq!(json["currency"]["currency"], "DOT");
    assert_eq!(json["currency"]["kind"], "native");
    assert!(json.get("withdrawal_tx").is_none());
}

#[actix_web::test]
async fn create_order_twice() {
    let _ = env_logger::try_init().ok();
    let h = TestHarness::new().await;
    let (status, first) = post_request(&h, HealthBoard::new(), "/v2/order/order_2", Body::Json(DOT_ORDER)).await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, second) = post_request(&h, HealthBoard::new(), "/v2/order/order_2", Body::Json(DOT_ORDER)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse(&first), parse(&second));

    let different = r#"{"amount": 99, "currency": "DOT", "callback": "https://example.com/callback"}"#;
    let (status, body) = post_request(&h, HealthBoard::new(), "/v2/order/order_2", Body::Json(different)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body.contains("different parameters"));
}

#[actix_web::test]
async fn get_order() {
    let _ = env_logger::try_init().ok();
    let h = TestHarness::new().await;
    let (_, created) = post_request(&h, HealthBoard::new(), "/v2/order/order_3", Body::Json(DOT_ORDER)).await;
    let (status, body) = post_request(&h, HealthBoard::new(), "/v2/order/order_3", Body::Empty).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse(&body), parse(&created));
}

#[actix_web::test]
async fn get_unknown_order() {
    let _ = env_logger::try_init().ok();
    let h = TestHarness::new().await;
    let (status, body) = post_request(&h, HealthBoard::new(), "/v2/order/nonExistingOrder123", Body::Empty).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, r#"{"error":"Order not found"}"#);
}

#[actix_web::test]
async fn unsupported_currency() {
    let _ = env_logger::try_init().ok();
    let h = TestHarness::new().await;
    let body = r#"{"amount": 1, "currency": "BTC", "callback": ""}"#;
    let (status, body) = post_request(&h, HealthBoard::new(), "/v2/order/order_4", Body::Json(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, r#"{"error":"Unsupported currency: BTC"}"#);
    let (status, _) = post_request(&h, HealthBoard::new(), "/v2/order/order_4", Body::Empty).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[actix_web::test]
async fn malformed_body() {
    let _ = env_logger::try_init().ok();
    let h = TestHarness::new().await;
    let (status, body) = post_request(&h, HealthBoard::new(), "/v2/order/order_5", Body::Json("{\"amount\": ")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.starts_with(r#"{"error":"Could not read request body"#));
}

#[actix_web::test]
async fn paid_order_representation() {
    let _ = env_logger::try_init().ok();
    let h = TestHarness::new().await;
    let usdc = r#"{"amount": 100, "currency": "USDC", "callback": ""}"#;
    post_request(&h, HealthBoard::new(), "/v2/order/order_6", Body::Json(DOT_ORDER)).await;
    post_request(&h, HealthBoard::new(), "/v2/order/order_7", Body::Json(usdc)).await;
    pay(&h, "order_6", 500_000_000_000).await;
    let (_, body) = post_request(&h, HealthBoard::new(), "/v2/order/order_6", Body::Empty).await;
    let order = parse(&body);
    assert_eq!(order.repaid_amount, 50.0);
    assert_eq!(order.transactions.len(), 1);
    assert_eq!(order.transactions[0].amount, 50.0);
    assert_eq!(order.transactions[0].currency.as_deref(), Some("DOT"));
    let json: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["payment_status"], "pending");

    pay(&h, "order_6", 500_000_000_000).await;
    let (_, body) = post_request(&h, HealthBoard::new(), "/v2/order/order_6", Body::Empty).await;
    let order = parse(&body);
    assert_eq!(order.repaid_amount, 100.0);
    assert!(order.withdrawal_tx.is_some());
    let json: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["payment_status"], "paid");
    assert_eq!(json["withdrawal_status"], "completed");

    let (_, body) = post_request(&h, HealthBoard::new(), "/v2/order/order_7", Body::Empty).await;
    let json: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["currency"]["asset_id"], 1337);
    assert_eq!(json["currency"]["kind"], "asset");
}

#[actix_web::test]
async fn force_withdrawal_of_unknown_order() {
    let _ = env_logger::try_init().ok();
    let h = TestHarness::new().await;
    let path = "/v2/order/nonExistingOrder123/forceWithdrawal";
    let (status, body) = post_request(&h, HealthBoard::new(), path, Body::Empty).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, r#"{"error":"Order not found"}"#);
}

#[actix_web::test]
async fn force_withdrawal_of_unpaid_order() {
    let _ = env_logger::try_init().ok();
    let h = TestHarness::new().await;
    post_request(&h, HealthBoard::new(), "/v2/order/order_8", Body::Json(DOT_ORDER)).await;
    let (status, _) = post_request(&h, HealthBoard::new(), "/v2/order/order_8/forceWithdrawal", Body::Empty).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[actix_web::test]
async fn force_withdrawal_after_rejection() {
    let _ = env_logger::try_init().ok();
    let h = TestHarness::new().await;
    post_request(&h, HealthBoard::new(), "/v2/order/order_9", Body::Json(DOT_ORDER)).await;
    h.polkadot.fail_next_submissions(vec![ChainError::Rejected("fee too low".into())]);
    pay(&h, "order_9", 1_000_000_000_000).await;
    let (_, body) = post_request(&h, HealthBoard::new(), "/v2/order/order_9", Body::Empty).await;
    let json: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["withdrawal_status"], "failed");
    assert!(json["message"].as_str().unwrap().contains("fee too low"));

    let (status, body) =
        post_request(&h, HealthBoard::new(), "/v2/order/order_9/forceWithdrawal", Body::Empty).await;
    assert_eq!(status, StatusCode::OK);
    let json: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["withdrawal_status"], "completed");
    assert_eq!(h.polkadot.submissions().len(), 1);
}

#[actix_web::test]
async fn transfers_in_other_currencies_use_their_own_units() {
    let _ = env_logger::try_init().ok();
    let h = TestHarness::new().await;
    post_request(&h, HealthBoard::new(), "/v2/order/order_8", Body::Json(DOT_ORDER)).await;
    let order = h.engine.fetch_order(&OrderId::from("order_8")).await.unwrap();
    let transfers = [(&h.asset_hub, AssetRef::Asset(1337), 1_500_000), (&h.polkadot, AssetRef::Asset(4242), u128::MAX)];
    for (chain, asset, amount) in transfers {
        let transfer = chain.transfer(&order.payment_account, asset, amount);
        let number = chain.produce_block(vec![transfer.clone()]);
        let block = BlockRef { number, hash: format!("0xblock{number}") };
        let observed = ObservedTransfer::new(&chain.chain_name(), &block, transfer, true);
        h.engine.process_transfer(&order.order_id, observed).await.unwrap();
    }
    let (_, body) = post_request(&h, HealthBoard::new(), "/v2/order/order_8", Body::Empty).await;
    let order = parse(&body);
    assert_eq!(order.repaid_amount, 0.0);
    assert_eq!(order.transactions.len(), 2);

    let usdc = &order.transactions[0];
    assert_eq!(usdc.currency.as_deref(), Some("USDC"));
    assert_eq!(usdc.amount, 1.5);
    assert_eq!(usdc.raw_amount, "1500000");
    assert!(!usdc.credited);

    let unknown = &order.transactions[1];
    assert_eq!(unknown.currency, None);
    assert_eq!(unknown.raw_amount, u128::MAX.to_string());
    assert!(!unknown.credited);
}
