//! ActivityPub endpoints
//!
//! - Actor profile
//! - Inbox (activity receiving)
//! - Outbox
//! - Followers/Following collections
//! - Objects

use axum::body::Bytes;
use axum::extract::OriginalUri;
use axum::{
    Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Json, Redirect, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::AppState;
use crate::data::Actor;
use crate::error::AppError;
use crate::federation::remote::ACTIVITY_JSON;
use crate::federation::signature::IncomingRequest;
use crate::federation::{InboundActivity, InboxOutcome, render_actor_document};

const AS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";

/// Create ActivityPub router
///
/// Routes:
/// - GET /users/:username - Actor profile
/// - POST /users/:username/inbox - Personal inbox
/// - POST /inbox - Shared inbox
/// - GET /users/:username/outbox - Outbox
/// - GET /users/:username/followers - Followers collection
/// - GET /users/:username/following - Following collection
/// - GET /objects/:id - Published objects
pub fn activitypub_router() -> Router<AppState> {
    Router::new()
        .route("/users/:username", get(actor))
        .route("/users/:username/inbox", post(inbox))
        .route("/inbox", post(shared_inbox))
        .route("/users/:username/outbox", get(outbox))
        .route("/users/:username/followers", get(followers))
        .route("/users/:username/following", get(following))
        .route("/objects/:id", get(object))
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    page: Option<u32>,
}

fn activity_json(document: Value) -> Response {
    ([(header::CONTENT_TYPE, ACTIVITY_JSON)], Json(document)).into_response()
}

/// Whether the client asked for an ActivityPub representation
fn wants_activity_json(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|accept| {
            accept.contains(ACTIVITY_JSON)
                || (accept.contains("application/ld+json") && accept.contains("activitystreams"))
        })
}

async fn local_actor_or_404(state: &AppState, username: &str) -> Result<Actor, AppError> {
    state
        .directory
        .find_local_actor(username)
        .await?
        .ok_or(AppError::NotFound)
}

/// GET /users/:username
///
/// Returns ActivityPub Actor document, or redirects browsers to the profile
/// page.
///
/// Content-Type: application/activity+json
async fn actor(
    State(state): State<AppState>,
    Path(username): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    if !wants_activity_json(&headers) {
        local_actor_or_404(&state, &username).await?;
        let profile = format!("{}/@{}", state.directory.base_url(), username);
        return Ok(Redirect::to(&profile).into_response());
    }

    let local = state.directory.get_local_actor(&username).await?;
    Ok(activity_json(render_actor_document(&local)))
}

/// POST /users/:username/inbox
///
/// Receives activities addressed to one local actor.
async fn inbox(
    State(state): State<AppState>,
    Path(username): Path<String>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    local_actor_or_404(&state, &username).await?;
    receive(&state, &uri, &headers, &body).await
}

/// POST /inbox
///
/// Shared inbox for all local actors.
async fn shared_inbox(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    receive(&state, &uri, &headers, &body).await
}

/// Parse, authenticate and process an inbound activity.
///
/// Receipt is acknowledged with 202 once the signature checks out; failures
/// while applying side effects are logged, not returned to the peer.
async fn receive(
    state: &AppState,
    uri: &axum::http::Uri,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<StatusCode, AppError> {
    if body.is_empty() {
        return Err(AppError::Validation("Empty body".to_string()));
    }
    let activity: Value = serde_json::from_slice(body)
        .map_err(|e| AppError::Validation(format!("Invalid JSON: {}", e)))?;
    let parsed = InboundActivity::parse(&activity)?;

    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());
    let request = IncomingRequest {
        method: "POST",
        path_and_query,
        headers,
        body: Some(&body[..]),
    };
    let verified = state
        .signatures
        .verify_incoming(&request, Some(parsed.actor()))
        .await?;

    let activity_type = parsed.kind().to_string();
    let actor = parsed.actor().to_string();

    match state.inbox.process(&activity, body, parsed, &verified).await {
        Ok(InboxOutcome::FollowAccepted { follower, created, .. }) => {
            tracing::debug!(follower = %follower, created, "Inbox processed Follow");
        }
        Ok(outcome) => {
            tracing::debug!(activity_type = %activity_type, ?outcome, "Inbox processed activity");
        }
        Err(e) => {
            tracing::warn!(
                activity_type = %activity_type,
                actor = %actor,
                key_id = %verified.key_id,
                error = %e,
                "Failed to process inbound activity"
            );
        }
    }

    Ok(StatusCode::ACCEPTED)
}

/// GET /users/:username/outbox
///
/// Returns OrderedCollection of locally originated activities.
async fn outbox(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<Response, AppError> {
    let actor = local_actor_or_404(&state, &username).await?;
    let outbox_url = actor
        .outbox_url
        .clone()
        .unwrap_or_else(|| format!("{}/outbox", actor.uri));

    let Some(page) = query.page else {
        let total = state.outbox.count(&actor.uri).await?;
        return Ok(activity_json(json!({
            "@context": AS_CONTEXT,
            "id": outbox_url,
            "type": "OrderedCollection",
            "totalItems": total,
            "first": format!("{}?page=1", outbox_url),
        })));
    };

    let page = state
        .outbox
        .page(&actor.uri, page, state.config.federation.collection_page_size)
        .await?;

    let mut document = json!({
        "@context": AS_CONTEXT,
        "id": format!("{}?page={}", outbox_url, page.page),
        "type": "OrderedCollectionPage",
        "partOf": outbox_url,
        "totalItems": page.total,
        "orderedItems": page.items,
    });
    if page.has_next() {
        document["next"] = json!(format!("{}?page={}", outbox_url, page.page + 1));
    }
    if page.has_prev() {
        document["prev"] = json!(format!("{}?page={}", outbox_url, page.page - 1));
    }
    Ok(activity_json(document))
}

/// GET /users/:username/followers
///
/// Returns Collection of followers.
async fn followers(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<Response, AppError> {
    let actor = local_actor_or_404(&state, &username).await?;
    let followers_url = actor
        .followers_url
        .clone()
        .unwrap_or_else(|| format!("{}/followers", actor.uri));

    let Some(page) = query.page else {
        let total = state.followers.count_followers(&actor.id).await?;
        return Ok(activity_json(json!({
            "@context": AS_CONTEXT,
            "id": followers_url,
            "type": "Collection",
            "totalItems": total,
            "first": format!("{}?page=1", followers_url),
        })));
    };

    let page = state
        .followers
        .page(&actor.id, page, state.config.federation.collection_page_size)
        .await?;
    let items: Vec<&str> = page.items.iter().map(|edge| edge.follower_uri.as_str()).collect();

    let mut document = json!({
        "@context": AS_CONTEXT,
        "id": format!("{}?page={}", followers_url, page.page),
        "type": "CollectionPage",
        "partOf": followers_url,
        "totalItems": page.total,
        "items": items,
    });
    if page.has_next() {
        document["next"] = json!(format!("{}?page={}", followers_url, page.page + 1));
    }
    if page.has_prev() {
        document["prev"] = json!(format!("{}?page={}", followers_url, page.page - 1));
    }
    Ok(activity_json(document))
}

/// GET /users/:username/following
///
/// Local actors follow nobody, so this is always empty.
async fn following(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<Response, AppError> {
    let actor = local_actor_or_404(&state, &username).await?;
    let following_url = actor
        .following_url
        .clone()
        .unwrap_or_else(|| format!("{}/following", actor.uri));

    let document = match query.page {
        None => json!({
            "@context": AS_CONTEXT,
            "id": following_url,
            "type": "Collection",
            "totalItems": 0,
            "first": format!("{}?page=1", following_url),
        }),
        Some(page) => json!({
            "@context": AS_CONTEXT,
            "id": format!("{}?page={}", following_url, page.max(1)),
            "type": "CollectionPage",
            "partOf": following_url,
            "totalItems": 0,
            "items": [],
        }),
    };
    Ok(activity_json(document))
}

/// GET /objects/:id
///
/// Returns an object published by a local actor.
async fn object(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let mut object = state.outbox.get_object(&id).await?.ok_or(AppError::NotFound)?;
    if let Some(fields) = object.as_object_mut() {
        fields
            .entry("@context")
            .or_insert_with(|| Value::String(AS_CONTEXT.to_string()));
    }
    Ok(activity_json(object))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn accept_negotiation() {
        let mut headers = HeaderMap::new();
        assert!(!wants_activity_json(&headers));

        headers.insert(header::ACCEPT, HeaderValue::from_static("text/html"));
        assert!(!wants_activity_json(&headers));

        headers.insert(header::ACCEPT, HeaderValue::from_static(ACTIVITY_JSON));
        assert!(wants_activity_json(&headers));

        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static(
                "application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"",
            ),
        );
        assert!(wants_activity_json(&headers));
    }
}
