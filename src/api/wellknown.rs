//! Well-known endpoints
//!
//! - /.well-known/webfinger
//! - /.well-known/nodeinfo
//! - /.well-known/host-meta
//! - /nodeinfo/:version

use axum::{
    Router,
    extract::{Path, Query, State},
    http::header,
    response::{IntoResponse, Json, Response},
    routing::get,
};
use serde::Deserialize;

use crate::AppState;
use crate::error::AppError;
use crate::federation::remote::JRD_JSON;
use crate::federation::webfinger::{
    AcctResource, NODEINFO_SCHEMA_PREFIX, build_nodeinfo, generate_webfinger_response,
    nodeinfo_links,
};

/// Create well-known router
///
/// Routes:
/// - GET /.well-known/webfinger
/// - GET /.well-known/nodeinfo
/// - GET /.well-known/host-meta
/// - GET /nodeinfo/:version
pub fn wellknown_router() -> Router<AppState> {
    Router::new()
        .route("/.well-known/webfinger", get(webfinger))
        .route("/.well-known/nodeinfo", get(nodeinfo_discovery))
        .route("/.well-known/host-meta", get(host_meta))
        .route("/nodeinfo/:version", get(nodeinfo))
}

/// WebFinger query parameters
#[derive(Debug, Deserialize)]
struct WebFingerQuery {
    resource: Option<String>,
}

/// GET /.well-known/webfinger
///
/// Responds to WebFinger queries for local accounts only.
///
/// Query: ?resource=acct:user@domain
async fn webfinger(
    State(state): State<AppState>,
    Query(query): Query<WebFingerQuery>,
) -> Result<Response, AppError> {
    let resource = query
        .resource
        .ok_or_else(|| AppError::Validation("Missing resource parameter".to_string()))?;
    let acct = AcctResource::parse(&resource)?;

    // Not a WebFinger proxy for other hosts
    if !acct.domain.eq_ignore_ascii_case(state.directory.domain()) {
        tracing::debug!(resource = %resource, "WebFinger query for another domain");
        return Err(AppError::NotFound);
    }

    let actor = state
        .directory
        .find_local_actor(&acct.username)
        .await?
        .ok_or(AppError::NotFound)?;

    let response =
        generate_webfinger_response(&actor.username, state.directory.domain(), state.directory.base_url());

    Ok(([(header::CONTENT_TYPE, JRD_JSON)], Json(response)).into_response())
}

/// GET /.well-known/nodeinfo
///
/// Returns links to nodeinfo documents.
async fn nodeinfo_discovery(State(state): State<AppState>) -> impl IntoResponse {
    Json(nodeinfo_links(state.directory.base_url()))
}

/// GET /nodeinfo/:version
///
/// Returns the NodeInfo 2.0 or 2.1 document.
async fn nodeinfo(
    State(state): State<AppState>,
    Path(version): Path<String>,
) -> Result<Response, AppError> {
    let total_users = state.db.count_local_actors().await?.max(0) as u64;
    let local_posts = state.outbox.count_local_posts().await?;

    let document = build_nodeinfo(
        &version,
        &state.config.instance.title,
        &state.config.instance.description,
        total_users,
        local_posts,
    )
    .ok_or(AppError::NotFound)?;

    let content_type = format!(
        "application/json; profile=\"{}{}#\"",
        NODEINFO_SCHEMA_PREFIX, version
    );
    Ok(([(header::CONTENT_TYPE, content_type)], Json(document)).into_response())
}

/// GET /.well-known/host-meta
///
/// Returns host-meta XML for WebFinger discovery.
async fn host_meta(State(state): State<AppState>) -> impl IntoResponse {
    let xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<XRD xmlns="http://docs.oasis-open.org/ns/xri/xrd-1.0">
  <Link rel="lrdd" type="{}" template="{}/.well-known/webfinger?resource={{uri}}"/>
</XRD>"#,
        JRD_JSON,
        state.directory.base_url()
    );

    ([(header::CONTENT_TYPE, "application/xrd+xml")], xml)
}
