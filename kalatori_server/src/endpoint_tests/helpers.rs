use actix_web::{http::StatusCode, test, web, App};
use kalatori_engine::{
    test_utils::{FakeChain, TestHarness},
    HealthBoard,
    SqliteDatabase,
};
use log::debug;

use crate::{config::ServerOptions, data_objects::ServerInfo, server::configure_routes};

pub fn test_options() -> ServerOptions {
    ServerOptions {
        server_info: ServerInfo { version: "0.2.0".into(), instance_id: "calm-otter-0001".into(), debug: true },
        description: "Test instance".into(),
    }
}

pub enum Body<'a> {
    Empty,
    Json(&'a str),
}

/// Sends a POST request to the routes, backed by the harness's engine.
pub async fn post_request(h: &TestHarness, board: HealthBoard, path: &str, body: Body<'_>) -> (StatusCode, String) {
    let mut req = test::TestRequest::post().uri(path);
    if let Body::Json(json) = body {
        req = req.insert_header(("Content-Type", "application/json")).set_payload(json.to_string());
    }
    call(h, board, req).await
}

pub async fn get_request(h: &TestHarness, board: HealthBoard, path: &str) -> (StatusCode, String) {
    call(h, board, test::TestRequest::get().uri(path)).await
}

async fn call(h: &TestHarness, board: HealthBoard, req: test::TestRequest) -> (StatusCode, String) {
    let app = App::new()
        .app_data(web::Data::new(h.engine.clone()))
        .app_data(web::Data::new(test_options()))
        .app_data(web::Data::new(board))
        .configure(configure_routes::<SqliteDatabase, FakeChain>);
    let service = test::init_service(app).await;
    debug!("Making request");
    let res = test::call_service(&service, req.to_request()).await;
    let status = res.status();
    let body = String::from_utf8_lossy(&test::read_body(res).await).into_owned();
    (status, body)
}
