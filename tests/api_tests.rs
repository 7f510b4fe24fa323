mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

use ea_fleet_engine::api::router::create_router;

use common::{app_state, fleet, harness, Harness, MockSink};

async fn call(
    h: &Harness,
    token: Option<&str>,
    req: Request<Body>,
) -> (StatusCode, Value) {
    let app = create_router(app_state(h, token));
    let resp = app.oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn send_json(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_health_reports_degraded_without_push_channel() {
    let h = harness(fleet(), MockSink::default()).await;
    let (status, body) = call(&h, Some("tok"), get("/health")).await;

    // Public even when a token is configured.
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["push_channel"], "disconnected");
}

#[tokio::test]
async fn test_auth_required_when_token_set() {
    let h = harness(fleet(), MockSink::default()).await;

    let (status, _) = call(&h, Some("tok"), get("/api/agents")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let req = Request::builder()
        .uri("/api/agents")
        .header("authorization", "Bearer wrong")
        .body(Body::empty())
        .unwrap();
    let (status, _) = call(&h, Some("tok"), req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let req = Request::builder()
        .uri("/api/agents")
        .header("authorization", "Bearer tok")
        .body(Body::empty())
        .unwrap();
    let (status, body) = call(&h, Some("tok"), req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_agents_and_stats() {
    let h = harness(fleet(), MockSink::default()).await;

    let (status, body) = call(&h, None, get("/api/agents")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    let magics: Vec<i64> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|a| a["magic_number"].as_i64().unwrap())
        .collect();
    assert_eq!(magics.len(), 3);
    assert!(magics.contains(&2002));

    let (status, body) = call(&h, None, get("/api/stats")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["stats"]["total_agents"], 3);
    assert!(body["data"]["account"].is_null());
}

#[tokio::test]
async fn test_enqueue_then_cancel_lifecycle() {
    let h = harness(fleet(), MockSink::default()).await;

    let (status, body) = call(
        &h,
        None,
        send_json(
            "POST",
            "/api/commands",
            json!({ "command": "pause", "target": "symbol_EURUSD" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["data"]["status"], "pending");
    assert_eq!(body["data"]["targets"].as_array().unwrap().len(), 2);
    let id = body["data"]["id"].as_str().unwrap().to_string();

    let (status, body) = call(&h, None, get(&format!("/api/commands/{id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["id"], id.as_str());

    let cancel = || send_json("POST", &format!("/api/commands/{id}/cancel"), json!({}));
    let (status, body) = call(&h, None, cancel()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "cancelled");

    let (status, body) = call(&h, None, cancel()).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["success"], false);

    let (status, body) = call(&h, None, get("/api/commands")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
    assert_eq!(h.sink.calls(), 0);
}

#[tokio::test]
async fn test_unknown_command_id_is_404() {
    let h = harness(fleet(), MockSink::default()).await;
    let id = uuid::Uuid::new_v4();

    let (status, _) = call(&h, None, get(&format!("/api/commands/{id}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(
        &h,
        None,
        send_json("POST", &format!("/api/commands/{id}/cancel"), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_rejected_admission_is_422() {
    let h = harness(fleet(), MockSink::default()).await;

    let (status, body) = call(
        &h,
        None,
        send_json(
            "POST",
            "/api/commands",
            json!({ "command": "pause", "target": "symbol_USDJPY" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["error"].as_str().unwrap().contains("matches no known agent"));

    let (status, _) = call(
        &h,
        None,
        send_json(
            "POST",
            "/api/commands/execute",
            json!({ "command": "adjust_risk", "target": "all", "parameters": { "risk_percent": 0 } }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(h.queue.list().await.is_empty());
}

#[tokio::test]
async fn test_execute_status_reflects_outcome() {
    let h = harness(fleet(), MockSink::failing(&[2002])).await;
    let (status, body) = call(
        &h,
        None,
        send_json(
            "POST",
            "/api/commands/execute",
            json!({ "command": "resume", "target": "all" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::MULTI_STATUS);
    assert_eq!(body["data"]["outcome"], "partial");
    assert_eq!(body["data"]["command"]["status"], "partial_success");

    let h = harness(fleet(), MockSink::default()).await;
    let (status, body) = call(
        &h,
        None,
        send_json(
            "POST",
            "/api/commands/execute",
            json!({ "command": "resume", "target": "strategy_grid" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["outcome"], "all_succeeded");

    let h = harness(fleet(), MockSink::failing(&[1001, 2002, 3003])).await;
    let (status, _) = call(
        &h,
        None,
        send_json(
            "POST",
            "/api/commands/execute",
            json!({ "command": "resume", "target": "all" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_blackout_query() {
    let h = harness(fleet(), MockSink::default()).await;

    let (status, body) = call(&h, None, get("/api/blackout?symbols=eurusd,GBPUSD")).await;
    assert_eq!(status, StatusCode::OK);
    let decisions = body["data"].as_array().unwrap();
    assert_eq!(decisions.len(), 2);
    assert!(decisions.iter().all(|d| d["trading_allowed"] == true));
    assert!(decisions.iter().any(|d| d["symbol"] == "EURUSD"));

    let (status, _) = call(&h, None, get("/api/blackout?symbols=,")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_override_enable_and_disable() {
    let h = harness(fleet(), MockSink::default()).await;

    let (status, body) = call(
        &h,
        None,
        send_json(
            "POST",
            "/api/overrides",
            json!({ "symbol": "EURUSD", "duration_minutes": 30, "reason": "desk approval" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["result"]["symbol"], "EURUSD");
    // No backend configured in tests.
    assert_eq!(body["data"]["backend_synced"], false);

    let (_, body) = call(&h, None, get("/api/overrides")).await;
    assert_eq!(body["data"]["active"].as_array().unwrap().len(), 1);

    let (status, _) = call(&h, None, send_json("DELETE", "/api/overrides/EURUSD", json!({}))).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = call(&h, None, send_json("DELETE", "/api/overrides/EURUSD", json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, body) = call(&h, None, get("/api/overrides")).await;
    assert!(body["data"]["active"].as_array().unwrap().is_empty());
    assert_eq!(body["data"]["history"].as_array().unwrap().len(), 1);

    let (status, _) = call(
        &h,
        None,
        send_json(
            "POST",
            "/api/overrides",
            json!({ "symbol": "EURUSD", "duration_minutes": 0 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_impact_config_validation() {
    let h = harness(fleet(), MockSink::default()).await;

    let (status, body) = call(
        &h,
        None,
        send_json(
            "PUT",
            "/api/news/config",
            json!({ "impact_level": "high", "pre_minutes": 45, "post_minutes": 15 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["result"]["pre_minutes"], 45);

    let (status, _) = call(
        &h,
        None,
        send_json(
            "PUT",
            "/api/news/config",
            json!({ "impact_level": "high", "pre_minutes": 5000, "post_minutes": 15 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_metrics_endpoint_is_public() {
    let h = harness(fleet(), MockSink::default()).await;
    let app = create_router(app_state(&h, Some("tok")));
    let resp = app.oneshot(get("/metrics")).await.unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let content_type = resp.headers()["content-type"].to_str().unwrap();
    assert!(content_type.starts_with("text/plain"));
}

#[tokio::test]
async fn test_prices_keep_newest_tick() {
    use ea_fleet_engine::models::PriceTick;
    use ea_fleet_engine::state::Delta;
    use rust_decimal::Decimal;

    let h = harness(fleet(), MockSink::default()).await;
    let tick = |bid: i64, at: i64| PriceTick {
        symbol: "GBPUSD".into(),
        bid: Decimal::new(bid, 4),
        ask: Decimal::new(bid + 3, 4),
        timestamp: common::ts(at),
    };
    h.store.apply_delta(Delta::Price(tick(12710, 60))).await;
    // Delayed update from before the current quote.
    h.store.apply_delta(Delta::Price(tick(12690, 30))).await;

    let (status, body) = call(&h, None, get("/api/prices")).await;
    assert_eq!(status, StatusCode::OK);
    let prices = body["data"].as_array().unwrap();
    assert_eq!(prices.len(), 1);
    assert_eq!(prices[0]["symbol"], "GBPUSD");
    assert_eq!(prices[0]["bid"], "1.2710");
}
