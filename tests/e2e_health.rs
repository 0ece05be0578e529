//! E2E tests for health check and basic server functionality

mod common;

use common::TestServer;
use serde_json::Value;

#[tokio::test]
async fn test_health_check() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(server.url("/health"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let json: Value = response.json().await.unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(json["localActors"], 1);
}

#[tokio::test]
async fn test_cors_headers() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(server.url("/users/alice"))
        .header("Accept", common::ACTIVITY_JSON)
        .header("Origin", "https://test.example.com")
        .send()
        .await
        .unwrap();

    // CORS should allow the configured instance origin.
    assert_eq!(
        response.headers()["access-control-allow-origin"],
        "https://test.example.com"
    );
}

#[tokio::test]
async fn test_404_for_unknown_routes() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(server.url("/unknown/route"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_metrics_endpoint_serves_prometheus_text() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(server.url("/metrics"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert!(
        response.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/plain")
    );
}
