//! E2E tests for .well-known endpoints (WebFinger, NodeInfo, host-meta)

mod common;

use common::{TEST_DOMAIN, TestServer};
use serde_json::Value;

#[tokio::test]
async fn test_webfinger_resolves_local_actor() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(server.url(&format!(
            "/.well-known/webfinger?resource=acct:alice@{}",
            TEST_DOMAIN
        )))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "application/jrd+json"
    );

    let json: Value = response.json().await.unwrap();
    assert_eq!(json["subject"], format!("acct:alice@{}", TEST_DOMAIN));

    let self_link = json["links"]
        .as_array()
        .unwrap()
        .iter()
        .find(|link| link["rel"] == "self")
        .expect("self link");
    assert_eq!(self_link["type"], "application/activity+json");
    assert_eq!(self_link["href"], server.actor_uri());
    assert!(
        json["aliases"]
            .as_array()
            .unwrap()
            .contains(&Value::String(server.actor_uri()))
    );
}

#[tokio::test]
async fn test_webfinger_domain_is_case_insensitive() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(server.url("/.well-known/webfinger?resource=acct:alice@TEST.example.com"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn test_webfinger_rejects_other_domains() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(server.url("/.well-known/webfinger?resource=acct:alice@other.example"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_webfinger_unknown_user_is_404() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(server.url(&format!(
            "/.well-known/webfinger?resource=acct:nobody@{}",
            TEST_DOMAIN
        )))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_webfinger_malformed_resource_is_400() {
    let server = TestServer::new().await;

    for query in [
        "",
        "?resource=alice@test.example.com",
        "?resource=acct:alice",
        "?resource=acct:a@b@test.example.com",
        "?resource=https://test.example.com/users/alice",
    ] {
        let response = server
            .client
            .get(server.url(&format!("/.well-known/webfinger{}", query)))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 400, "query {query:?}");
    }
}

#[tokio::test]
async fn test_nodeinfo_discovery_links_both_versions() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(server.url("/.well-known/nodeinfo"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let json: Value = response.json().await.unwrap();
    let hrefs: Vec<&str> = json["links"]
        .as_array()
        .unwrap()
        .iter()
        .map(|link| link["href"].as_str().unwrap())
        .collect();
    assert_eq!(
        hrefs,
        vec![
            format!("https://{}/nodeinfo/2.0", TEST_DOMAIN),
            format!("https://{}/nodeinfo/2.1", TEST_DOMAIN),
        ]
    );
}

#[tokio::test]
async fn test_nodeinfo_documents() {
    let server = TestServer::new().await;

    for version in ["2.0", "2.1"] {
        let response = server
            .client
            .get(server.url(&format!("/nodeinfo/{}", version)))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);

        let json: Value = response.json().await.unwrap();
        assert_eq!(json["version"], version);
        assert_eq!(json["software"]["name"], "penbox");
        assert_eq!(json["protocols"], serde_json::json!(["activitypub"]));
        assert_eq!(json["openRegistrations"], false);
        assert_eq!(json["usage"]["users"]["total"], 1);
        assert_eq!(json["usage"]["localPosts"], 0);
    }

    let response = server
        .client
        .get(server.url("/nodeinfo/1.0"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_host_meta_points_at_webfinger() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(server.url("/.well-known/host-meta"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "application/xrd+xml"
    );
    let body = response.text().await.unwrap();
    assert!(body.contains(&format!(
        "https://{}/.well-known/webfinger?resource={{uri}}",
        TEST_DOMAIN
    )));
}
