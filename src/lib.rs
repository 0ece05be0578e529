//! Penbox - the federation layer of a personal publishing platform
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - WebFinger / NodeInfo / host-meta                         │
//! │  - ActivityPub actor, inbox, outbox, collections            │
//! │  - Metrics and health                                       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Federation Layer                          │
//! │  - Actor directory and key store                            │
//! │  - HTTP Signatures                                          │
//! │  - Follower registry, inbox processing                      │
//! │  - Delivery with retry, activity log                        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - SQLite (sqlx)                                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers
//! - `federation`: ActivityPub federation handling
//! - `data`: Database layer
//! - `config`: Configuration management
//! - `error`: Error types
//! - `metrics`: Prometheus instruments

pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;

use std::sync::Arc;
use std::time::Duration;

use federation::{
    ActorDirectory, ContentFeed, DeliveryService, FollowRegistry, InboxProcessor, KeyStore,
    OutboxLog, SignatureService,
};

/// Application state shared across all handlers
///
/// Every service is constructed once here and handed to its dependents
/// explicitly.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Database connection pool
    pub db: Arc<data::Database>,

    pub directory: Arc<ActorDirectory>,
    pub signatures: Arc<SignatureService>,
    pub followers: Arc<FollowRegistry>,
    pub delivery: Arc<DeliveryService>,
    pub outbox: Arc<OutboxLog>,
    pub inbox: Arc<InboxProcessor>,

    /// Where the publishing platform announces new content
    pub content_feed: ContentFeed,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Connect to SQLite database (runs migrations)
    /// 2. Build the HTTP client and federation services
    /// 3. Create the local actor if absent
    /// 4. Seed the follower gauge
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        // 1. Connect to SQLite database
        let db = Arc::new(data::Database::connect(&config.database.path).await?);
        tracing::info!(path = %config.database.path.display(), "Database connected");

        // 2. Initialize HTTP client
        let http_client = federation::remote::build_http_client(Duration::from_secs(
            config.federation.delivery.timeout_seconds.max(1) * 2,
        ))?;

        let directory = Arc::new(ActorDirectory::new(
            db.clone(),
            http_client.clone(),
            KeyStore::new(config.federation.key_bits),
            &config,
        ));
        let signatures = Arc::new(SignatureService::new(
            directory.clone(),
            db.clone(),
            config.federation.clock_skew_seconds,
        ));
        let followers = Arc::new(FollowRegistry::new(db.clone()));
        let delivery = Arc::new(DeliveryService::new(
            http_client,
            signatures.clone(),
            followers.clone(),
            directory.clone(),
            db.clone(),
            &config.federation.delivery,
        ));
        let outbox = Arc::new(OutboxLog::new(
            db.clone(),
            delivery.clone(),
            directory.base_url(),
        ));
        let inbox = Arc::new(InboxProcessor::new(
            directory.clone(),
            followers.clone(),
            delivery.clone(),
            outbox.clone(),
        ));

        // 3. Initialize local actor
        let local = directory.create_default_actor_if_absent(&config.actor).await?;
        tracing::info!(actor = %local.uri(), key_id = %local.key_id(), "Local actor ready");

        // 4. Follower gauge
        followers.sync_metrics().await?;

        tracing::info!("Application state initialized successfully");

        Ok(Self {
            config: Arc::new(config),
            db,
            directory,
            signatures,
            followers,
            delivery,
            outbox,
            inbox,
            content_feed: ContentFeed::new(),
        })
    }

    /// Start federating content announced on the feed
    pub fn spawn_content_publisher(&self) -> tokio::task::JoinHandle<()> {
        federation::spawn_publisher(
            self.content_feed.subscribe(),
            self.directory.clone(),
            self.outbox.clone(),
        )
    }
}

/// Maximum accepted inbound body; activities are small JSON documents
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::{
        compression::CompressionLayer, limit::RequestBodyLimitLayer, timeout::TimeoutLayer,
        trace::TraceLayer,
    };

    let cors_layer = build_cors_layer(&state.config.server);
    let request_timeout = Duration::from_secs(state.config.server.request_timeout_seconds);

    Router::new()
        .merge(api::wellknown_router())
        .merge(api::activitypub_router())
        .merge(api::ops_router())
        .layer(axum::middleware::from_fn(api::track_requests))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TimeoutLayer::new(request_timeout))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer)
        .with_state(state)
}

fn build_cors_layer(server: &config::ServerConfig) -> tower_http::cors::CorsLayer {
    use axum::http::{HeaderValue, Method};
    use tower_http::cors::{Any, CorsLayer};

    // Federation documents are public; only reads are opened up.
    let methods = [Method::GET, Method::HEAD, Method::OPTIONS];

    if !server.protocol.eq_ignore_ascii_case("https") {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(methods)
            .allow_headers(Any);
    }

    let allowed_origin = server.base_url();
    match HeaderValue::from_str(&allowed_origin) {
        Ok(origin) => CorsLayer::new()
            .allow_origin([origin])
            .allow_methods(methods)
            .allow_headers(Any),
        Err(error) => {
            tracing::error!(
                %error,
                origin = %allowed_origin,
                "Failed to parse CORS origin from server base URL; denying cross-origin requests"
            );
            CorsLayer::new().allow_methods(methods).allow_headers(Any)
        }
    }
}
