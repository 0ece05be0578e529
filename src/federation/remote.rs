//! Outbound fetches of remote federation documents
//!
//! Every GET this server issues on behalf of a peer goes through here, so the
//! private-address guard is applied in one place.

use crate::error::AppError;
use serde_json::Value;
use std::net::IpAddr;

pub const ACTIVITY_JSON: &str = "application/activity+json";
pub const LD_JSON_ACTIVITY: &str =
    "application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";
pub const JRD_JSON: &str = "application/jrd+json";

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
                || v6.is_unspecified()
        }
    }
}

fn is_disallowed_host(host: &str) -> bool {
    let normalized = host
        .trim_end_matches('.')
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_ascii_lowercase();
    if normalized == "localhost" || normalized.ends_with(".localhost") {
        return true;
    }

    normalized
        .parse::<IpAddr>()
        .map(is_disallowed_ip)
        .unwrap_or(false)
}

async fn validate_resolved_host_ips(host: &str, port: u16) -> Result<(), AppError> {
    let normalized = host.trim_end_matches('.').to_ascii_lowercase();

    let mut resolved_any = false;
    let lookup = tokio::net::lookup_host((normalized.as_str(), port))
        .await
        .map_err(|e| AppError::UnreachableActor(format!("Failed to resolve {}: {}", host, e)))?;

    for addr in lookup {
        resolved_any = true;
        if is_disallowed_ip(addr.ip()) {
            return Err(AppError::Forbidden);
        }
    }

    if !resolved_any {
        return Err(AppError::UnreachableActor(format!(
            "No DNS records for {}",
            host
        )));
    }

    Ok(())
}

/// Parse a remote document URL and check it may be fetched.
///
/// Rejects non-HTTP(S) URLs. Unless `allow_private` is set, also rejects
/// hosts that are or resolve to loopback/private addresses.
pub async fn check_remote_url(raw: &str, allow_private: bool) -> Result<url::Url, AppError> {
    let parsed =
        url::Url::parse(raw).map_err(|e| AppError::Validation(format!("Invalid URL: {}", e)))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::Validation(format!(
                "Unsupported URL scheme: {}",
                scheme
            )));
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::Validation("Missing host in URL".to_string()))?
        .to_ascii_lowercase();

    if allow_private {
        return Ok(parsed);
    }

    if is_disallowed_host(&host) {
        return Err(AppError::Forbidden);
    }

    let port = parsed
        .port_or_known_default()
        .ok_or_else(|| AppError::Validation("Missing port in URL".to_string()))?;

    // Hosts that look public may still resolve internally.
    validate_resolved_host_ips(&host, port).await?;

    Ok(parsed)
}

/// `host[:port]` of a URL, with the port only when it is not the default.
///
/// This is the value a client sends as `Host` and the unit spoofing checks
/// compare.
pub fn authority(raw: &str) -> Option<String> {
    let parsed = url::Url::parse(raw.split('#').next().unwrap_or(raw)).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    Some(match parsed.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host,
    })
}

/// Shared client for all outbound federation traffic.
///
/// Redirects are never followed; a public host could otherwise bounce a
/// request past the private address guard.
pub fn build_http_client(timeout: std::time::Duration) -> Result<reqwest::Client, AppError> {
    reqwest::Client::builder()
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .redirect(reqwest::redirect::Policy::none())
        .timeout(timeout)
        .build()
        .map_err(|e| AppError::Internal(e.into()))
}

/// GET a JSON document from a peer.
///
/// Transport failures, non-2xx responses and unparsable bodies are all
/// reported as `UnreachableActor`; the guard's own rejections pass through.
pub async fn fetch_json(
    client: &reqwest::Client,
    raw_url: &str,
    accept: &str,
    allow_private: bool,
) -> Result<Value, AppError> {
    let url = check_remote_url(raw_url, allow_private).await?;

    let response = client
        .get(url)
        .header(reqwest::header::ACCEPT, accept)
        .send()
        .await
        .map_err(|e| {
            crate::metrics::FEDERATION_REQUESTS_TOTAL
                .with_label_values(&["outbound_fetch", "error"])
                .inc();
            AppError::UnreachableActor(format!("Failed to fetch {}: {}", raw_url, e))
        })?;

    let status = response.status();
    crate::metrics::FEDERATION_REQUESTS_TOTAL
        .with_label_values(&["outbound_fetch", status.as_str()])
        .inc();

    if !status.is_success() {
        return Err(AppError::UnreachableActor(format!(
            "Failed to fetch {}: HTTP {}",
            raw_url, status
        )));
    }

    response
        .json::<Value>()
        .await
        .map_err(|e| AppError::UnreachableActor(format!("Failed to parse {}: {}", raw_url, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn check_remote_url_rejects_localhost() {
        match check_remote_url("https://localhost/users/alice", false).await {
            Err(AppError::Forbidden) => {}
            other => panic!("expected forbidden for localhost, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn check_remote_url_rejects_private_ip() {
        match check_remote_url("http://192.168.1.10/users/alice", false).await {
            Err(AppError::Forbidden) => {}
            other => panic!("expected forbidden for private ip, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn check_remote_url_allows_loopback_when_configured() {
        let url = check_remote_url("http://127.0.0.1:3000/users/bob", true)
            .await
            .expect("loopback permitted");
        assert_eq!(url.port(), Some(3000));
    }

    #[tokio::test]
    async fn check_remote_url_rejects_other_schemes() {
        assert!(matches!(
            check_remote_url("ftp://remote.example/users/bob", true).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn validate_resolved_host_ips_rejects_loopback() {
        match validate_resolved_host_ips("127.0.0.1", 80).await {
            Err(AppError::Forbidden) => {}
            other => panic!("expected forbidden for loopback resolution, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn fetch_json_does_not_follow_redirects() {
        use axum::{Json, Router, http::StatusCode, http::header, routing::get};
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        let target_hits = Arc::new(AtomicUsize::new(0));

        let hits = target_hits.clone();
        let app = Router::new()
            .route(
                "/users/bob",
                get(|| async { (StatusCode::FOUND, [(header::LOCATION, "/internal")]) }),
            )
            .route(
                "/internal",
                get(move || {
                    let hits = hits.clone();
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        Json(serde_json::json!({ "secret": true }))
                    }
                }),
            );
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("server");
        });

        let client = build_http_client(std::time::Duration::from_secs(5)).expect("client");
        let result = fetch_json(
            &client,
            &format!("http://{}/users/bob", addr),
            ACTIVITY_JSON,
            true,
        )
        .await;

        assert!(matches!(result, Err(AppError::UnreachableActor(_))));
        assert_eq!(target_hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn authority_keeps_non_default_port() {
        assert_eq!(
            authority("http://127.0.0.1:8080/users/alice#main-key").as_deref(),
            Some("127.0.0.1:8080")
        );
        assert_eq!(
            authority("https://Remote.Example/users/bob").as_deref(),
            Some("remote.example")
        );
        assert_eq!(authority("not a url"), None);
    }
}
