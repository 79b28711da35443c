use actix_web::http::StatusCode;
use kalatori_engine::{test_utils::TestHarness, HealthBoard, WatcherHealth};
use serde_json::Value;

use super::helpers::get_request;

#[actix_web::test]
async fn status() {
    let _ = env_logger::try_init().ok();
    let h = TestHarness::new().await;
    let mut board = HealthBoard::new();
    let dot = board.register("polkadot");
    dot.send_replace(WatcherHealth::Healthy { last_finalized: Some(12) });
    let (status, body) = get_request(&h, board, "/v2/status").await;
    assert_eq!(status, StatusCode::OK);
    let json: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["description"], "Test instance");
    assert_eq!(json["server_info"]["version"], "0.2.0");
    assert_eq!(json["server_info"]["debug"], true);
    let currencies = json["supported_currencies"].as_object().unwrap();
    assert_eq!(currencies.len(), 3);
    assert_eq!(json["supported_currencies"]["USDT"]["asset_id"], 1984);
    assert_eq!(json["supported_currencies"]["DOT"]["chain_name"], "polkadot");
    assert_eq!(json["chains"]["polkadot"]["status"], "healthy");
    assert_eq!(json["chains"]["polkadot"]["last_finalized"], 12);
}

#[actix_web::test]
async fn health() {
    let _ = env_logger::try_init().ok();
    let h = TestHarness::new().await;
    let mut board = HealthBoard::new();
    let dot = board.register("polkadot");
    let (status, body) = get_request(&h, board.clone(), "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "👍️\n");

    dot.send_replace(WatcherHealth::Degraded { failures: 4, last_error: "connection refused".into() });
    let (status, body) = get_request(&h, board, "/health").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let json: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["polkadot"]["status"], "degraded");
    assert_eq!(json["polkadot"]["failures"], 4);
}
