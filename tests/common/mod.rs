//! Common test utilities for E2E tests

#![allow(dead_code)]

pub mod schema_validator;

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
};
use chrono::Utc;
use penbox::data::LocalActor;
use penbox::federation::KeyStore;
use penbox::federation::signature::sign_request;
use penbox::{AppState, config};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;

pub const TEST_DOMAIN: &str = "test.example.com";
pub const TEST_USERNAME: &str = "alice";
pub const ACTIVITY_JSON: &str = "application/activity+json";

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub state: AppState,
    pub _temp_dir: TempDir,
    pub client: reqwest::Client,
}

/// Configuration for a test instance backed by `db_path`
pub fn test_config(db_path: std::path::PathBuf) -> config::AppConfig {
    config::AppConfig {
        server: config::ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0, // Let OS assign port
            domain: TEST_DOMAIN.to_string(),
            protocol: "https".to_string(),
            request_timeout_seconds: 10,
        },
        database: config::DatabaseConfig { path: db_path },
        instance: config::InstanceConfig {
            title: "Test Instance".to_string(),
            description: "Test Penbox Instance".to_string(),
        },
        actor: config::ActorConfig {
            username: TEST_USERNAME.to_string(),
            display_name: "Alice".to_string(),
            summary: "Writes a diary".to_string(),
            icon_url: None,
        },
        federation: config::FederationConfig {
            key_bits: 1024,
            clock_skew_seconds: 300,
            actor_cache_ttl_seconds: 3600,
            collection_page_size: 2,
            // Mock peers listen on loopback
            allow_private_addresses: true,
            delivery: config::DeliveryConfig {
                max_concurrency: 4,
                timeout_seconds: 2,
                max_attempts: 3,
                base_backoff_ms: 10,
                max_backoff_ms: 50,
            },
        },
        logging: config::LoggingConfig {
            level: "info".to_string(),
            format: "pretty".to_string(),
        },
    }
}

impl TestServer {
    /// Create a new test server instance
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Create a test server after adjusting the default test configuration
    pub async fn with_config(adjust: impl FnOnce(&mut config::AppConfig)) -> Self {
        // Create temporary directory for test database
        let temp_dir = TempDir::new().unwrap();
        let mut config = test_config(temp_dir.path().join("test.db"));
        adjust(&mut config);

        // Initialize app state
        let state = AppState::new(config).await.unwrap();

        // Create HTTP client
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap();

        // Bind to random port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let app = penbox::build_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr: format!("http://{}", addr),
            state,
            _temp_dir: temp_dir,
            client,
        }
    }

    /// Get base URL for requests
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// Public ActivityPub id of the local actor
    pub fn actor_uri(&self) -> String {
        format!("https://{}/users/{}", TEST_DOMAIN, TEST_USERNAME)
    }

    pub async fn local_actor(&self) -> LocalActor {
        self.state
            .directory
            .get_local_actor(TEST_USERNAME)
            .await
            .unwrap()
    }

    pub async fn follower_count(&self) -> u64 {
        let alice = self.local_actor().await;
        self.state
            .followers
            .count_followers(&alice.actor.id)
            .await
            .unwrap()
    }
}

/// An activity a mock peer received
#[derive(Debug, Clone)]
pub struct Received {
    pub signature: Option<String>,
    pub body: Value,
}

#[derive(Clone)]
struct PeerState {
    actor: Value,
    inbox_status: StatusCode,
    received: Arc<Mutex<Vec<Received>>>,
    actor_hits: Arc<AtomicUsize>,
}

/// A remote ActivityPub server with one actor, `bob`
pub struct RemotePeer {
    pub base: String,
    pub actor_uri: String,
    pub key_id: String,
    keys: KeyStore,
    private_key_pem: String,
    received: Arc<Mutex<Vec<Received>>>,
    pub actor_hits: Arc<AtomicUsize>,
}

impl RemotePeer {
    pub async fn spawn() -> Self {
        Self::spawn_with_status(StatusCode::ACCEPTED).await
    }

    /// Spawn a peer whose inbox answers every POST with `inbox_status`
    pub async fn spawn_with_status(inbox_status: StatusCode) -> Self {
        let keys = KeyStore::new(1024);
        let key_pair = keys.generate_key_pair().unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let actor_uri = format!("{}/users/bob", base);
        let key_id = format!("{}#main-key", actor_uri);

        let actor = json!({
            "@context": ["https://www.w3.org/ns/activitystreams", "https://w3id.org/security/v1"],
            "id": actor_uri,
            "type": "Person",
            "preferredUsername": "bob",
            "inbox": format!("{}/inbox", actor_uri),
            "outbox": format!("{}/outbox", actor_uri),
            "publicKey": {
                "id": key_id,
                "owner": actor_uri,
                "publicKeyPem": key_pair.public_key_pem
            }
        });

        let received = Arc::new(Mutex::new(Vec::new()));
        let actor_hits = Arc::new(AtomicUsize::new(0));
        let state = PeerState {
            actor,
            inbox_status,
            received: received.clone(),
            actor_hits: actor_hits.clone(),
        };

        let app = Router::new()
            .route("/users/bob", get(serve_actor))
            .route("/users/bob/inbox", post(receive))
            .with_state(state);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base,
            actor_uri,
            key_id,
            keys,
            private_key_pem: key_pair.private_key_pem,
            received,
            actor_hits,
        }
    }

    pub fn inbox(&self) -> String {
        format!("{}/inbox", self.actor_uri)
    }

    /// POST `activity` to `url`, signed with bob's key
    pub async fn post_signed(
        &self,
        client: &reqwest::Client,
        url: &str,
        activity: &Value,
    ) -> reqwest::Response {
        let body = serde_json::to_vec(activity).unwrap();
        self.signed_request(client, url, &body, &body).send().await.unwrap()
    }

    /// Build a request signed over `signed_body` but carrying `sent_body`
    pub fn signed_request(
        &self,
        client: &reqwest::Client,
        url: &str,
        signed_body: &[u8],
        sent_body: &[u8],
    ) -> reqwest::RequestBuilder {
        self.replayed_request(client, url, url, signed_body, sent_body)
    }

    /// Build a request signed for `signed_url` but sent to `sent_url`
    pub fn replayed_request(
        &self,
        client: &reqwest::Client,
        signed_url: &str,
        sent_url: &str,
        signed_body: &[u8],
        sent_body: &[u8],
    ) -> reqwest::RequestBuilder {
        let headers = sign_request(
            &self.keys,
            "POST",
            signed_url,
            Some(signed_body),
            &self.private_key_pem,
            &self.key_id,
            Utc::now(),
        )
        .unwrap();

        headers.apply(
            client
                .post(sent_url)
                .header("Content-Type", ACTIVITY_JSON)
                .body(sent_body.to_vec()),
        )
    }

    pub fn follow(&self, id: &str, object: &str) -> Value {
        json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": format!("{}/follows/{}", self.base, id),
            "type": "Follow",
            "actor": self.actor_uri,
            "object": object
        })
    }

    pub fn undo(&self, id: &str, follow: Value) -> Value {
        json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": format!("{}/undos/{}", self.base, id),
            "type": "Undo",
            "actor": self.actor_uri,
            "object": follow
        })
    }

    pub fn received(&self) -> Vec<Received> {
        self.received.lock().unwrap().clone()
    }

    /// Wait until at least `count` activities arrived, or give up after 5s
    pub async fn wait_for(&self, count: usize) -> Vec<Received> {
        for _ in 0..250 {
            let received = self.received();
            if received.len() >= count {
                return received;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.received()
    }
}

async fn serve_actor(State(state): State<PeerState>) -> ([(&'static str, &'static str); 1], Json<Value>) {
    state.actor_hits.fetch_add(1, Ordering::SeqCst);
    ([("Content-Type", ACTIVITY_JSON)], Json(state.actor))
}

async fn receive(State(state): State<PeerState>, headers: HeaderMap, body: Bytes) -> StatusCode {
    let body = serde_json::from_slice(&body).unwrap_or(Value::Null);
    let signature = headers
        .get("signature")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state
        .received
        .lock()
        .unwrap()
        .push(Received { signature, body });
    state.inbox_status
}
