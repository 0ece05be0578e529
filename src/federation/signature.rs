//! HTTP Signatures for ActivityPub
//!
//! Implements signing and verification per:
//! https://docs.joinmastodon.org/spec/security/

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use http::HeaderMap;
use sha2::{Digest, Sha256};
use std::sync::Arc;

use super::actor::ActorDirectory;
use super::keys::KeyStore;
use super::remote::authority;
use crate::data::{Database, LocalActor};
use crate::error::AppError;

/// Headers every signature must cover
const REQUIRED_SIGNED_HEADERS: [&str; 3] = ["(request-target)", "host", "date"];

/// Headers to add for signed request
#[derive(Debug, Clone)]
pub struct SignedHeaders {
    /// Host header value, with a non-default port
    pub host: String,
    /// Date header value (RFC 2616)
    pub date: String,
    /// Digest header value (if body present)
    pub digest: Option<String>,
    /// Signature header value
    pub signature: String,
}

impl SignedHeaders {
    /// Attach the signed headers to an outgoing request
    pub fn apply(self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let mut request = request
            .header(reqwest::header::HOST, self.host)
            .header(reqwest::header::DATE, self.date)
            .header("Signature", self.signature);
        if let Some(digest) = self.digest {
            request = request.header("Digest", digest);
        }
        request
    }
}

/// The parts of an inbound HTTP request a signature can cover
#[derive(Debug, Clone, Copy)]
pub struct IncomingRequest<'a> {
    pub method: &'a str,
    /// Path plus query string as received
    pub path_and_query: &'a str,
    pub headers: &'a HeaderMap,
    pub body: Option<&'a [u8]>,
}

/// A signature that verified, and who made it
#[derive(Debug, Clone)]
pub struct VerifiedSignature {
    pub key_id: String,
    /// Actor URI owning the key
    pub actor_uri: String,
}

/// Parsed Signature header
#[derive(Debug, Clone)]
pub struct ParsedSignature {
    /// Key ID (URL to public key)
    pub key_id: String,
    /// Algorithm (usually rsa-sha256)
    pub algorithm: String,
    /// Signed header names, in signing order
    pub headers: Vec<String>,
    /// Base64-encoded signature
    pub signature: String,
}

/// Builds and checks HTTP Signatures.
pub struct SignatureService {
    directory: Arc<ActorDirectory>,
    db: Arc<Database>,
    keys: KeyStore,
    clock_skew_seconds: i64,
}

impl SignatureService {
    pub fn new(
        directory: Arc<ActorDirectory>,
        db: Arc<Database>,
        clock_skew_seconds: i64,
    ) -> Self {
        let keys = *directory.key_store();
        Self {
            directory,
            db,
            keys,
            clock_skew_seconds,
        }
    }

    /// Sign an outgoing request as `actor`
    ///
    /// # Arguments
    /// * `target_url` - Full URL being requested
    /// * `method` - HTTP method (e.g., "POST")
    /// * `actor` - Local actor whose active key signs
    /// * `body` - Request body; adds a Digest when present
    ///
    /// # Example
    /// ```ignore
    /// let headers = signer.create_signed_headers(
    ///     "https://remote.server/inbox",
    ///     "POST",
    ///     &alice,
    ///     Some(&body),
    /// )?;
    /// ```
    pub fn create_signed_headers(
        &self,
        target_url: &str,
        method: &str,
        actor: &LocalActor,
        body: Option<&[u8]>,
    ) -> Result<SignedHeaders, AppError> {
        let private_key_pem = actor
            .key
            .private_key_pem
            .as_deref()
            .ok_or_else(|| AppError::Crypto(format!("{} has no private key", actor.key_id())))?;

        sign_request(
            &self.keys,
            method,
            target_url,
            body,
            private_key_pem,
            actor.key_id(),
            Utc::now(),
        )
    }

    /// Verify the signature on an inbound request.
    ///
    /// `claimed_actor` is the `actor` of the activity in the body; a keyId
    /// on another host is rejected before any key lookup.
    ///
    /// # Errors
    /// `InvalidSignature` for every failure; the cause is logged.
    pub async fn verify_incoming(
        &self,
        request: &IncomingRequest<'_>,
        claimed_actor: Option<&str>,
    ) -> Result<VerifiedSignature, AppError> {
        match self.verify_inner(request, claimed_actor).await {
            Ok(verified) => {
                crate::metrics::SIGNATURE_VERIFICATIONS_TOTAL
                    .with_label_values(&["valid"])
                    .inc();
                Ok(verified)
            }
            Err(e) => {
                crate::metrics::SIGNATURE_VERIFICATIONS_TOTAL
                    .with_label_values(&["invalid"])
                    .inc();
                tracing::warn!(
                    path = %request.path_and_query,
                    actor = claimed_actor.unwrap_or("-"),
                    key_id = %extract_signature_key_id(request.headers).unwrap_or_default(),
                    error = %e,
                    "Signature verification failed"
                );
                Err(AppError::InvalidSignature)
            }
        }
    }

    async fn verify_inner(
        &self,
        request: &IncomingRequest<'_>,
        claimed_actor: Option<&str>,
    ) -> Result<VerifiedSignature, AppError> {
        let (parsed, signing_string) =
            check_signed_request(request, self.clock_skew_seconds, Utc::now())?;

        if let Some(actor) = claimed_actor {
            if !key_id_matches_actor_host(&parsed.key_id, actor) {
                return Err(AppError::Validation(format!(
                    "keyId {} is not on the host of actor {}",
                    parsed.key_id, actor
                )));
            }
        }

        // The actor named in the body owns the key; without one, fall back to
        // the document the keyId points into.
        let owner = match claimed_actor {
            Some(actor) => strip_fragment(actor).to_string(),
            None => strip_fragment(&parsed.key_id).to_string(),
        };

        // Keys issued by this server
        if let Some(key) = self.db.get_key(&parsed.key_id).await? {
            if !key.accepts_verification_at(Utc::now()) {
                return Err(AppError::Validation(format!(
                    "Key {} is revoked or expired",
                    parsed.key_id
                )));
            }
            let holder = self.db.get_actor_by_uri(&owner).await?;
            if holder.map(|actor| actor.id) != Some(key.actor_id.clone()) {
                return Err(AppError::Validation(format!(
                    "keyId {} does not belong to actor {}",
                    parsed.key_id, owner
                )));
            }
            return self
                .check_with_key(&parsed, &signing_string, &key.public_key_pem)
                .map(|_| VerifiedSignature {
                    key_id: parsed.key_id.clone(),
                    actor_uri: owner,
                });
        }

        // Remote keys: cached actor first, one refresh if it no longer matches
        let cached = self.directory.resolve_remote_actor(&owner).await?;
        if cached.public_key_id == parsed.key_id
            && self
                .check_with_key(&parsed, &signing_string, &cached.public_key_pem)
                .is_ok()
        {
            return Ok(VerifiedSignature {
                key_id: parsed.key_id,
                actor_uri: cached.uri.clone(),
            });
        }

        tracing::debug!(key_id = %parsed.key_id, "Cached key did not verify, refreshing actor");
        let refreshed = self.directory.refresh_remote_actor(&owner).await?;
        if refreshed.public_key_id != parsed.key_id {
            return Err(AppError::Validation(format!(
                "Actor {} does not advertise key {}",
                refreshed.uri, parsed.key_id
            )));
        }
        self.check_with_key(&parsed, &signing_string, &refreshed.public_key_pem)?;

        Ok(VerifiedSignature {
            key_id: parsed.key_id,
            actor_uri: refreshed.uri.clone(),
        })
    }

    fn check_with_key(
        &self,
        parsed: &ParsedSignature,
        signing_string: &str,
        public_key_pem: &str,
    ) -> Result<(), AppError> {
        if self
            .keys
            .verify(signing_string.as_bytes(), &parsed.signature, public_key_pem)?
        {
            Ok(())
        } else {
            Err(AppError::Validation(
                "Signature does not match".to_string(),
            ))
        }
    }
}

/// Sign an HTTP request at a given instant
///
/// # Returns
/// Headers to add: Host, Date, Signature and Digest (if body present)
pub fn sign_request(
    keys: &KeyStore,
    method: &str,
    url: &str,
    body: Option<&[u8]>,
    private_key_pem: &str,
    key_id: &str,
    now: DateTime<Utc>,
) -> Result<SignedHeaders, AppError> {
    // 1. Parse URL to get host and path
    let parsed_url =
        url::Url::parse(url).map_err(|e| AppError::Validation(format!("Invalid URL: {}", e)))?;
    let host = authority(url)
        .ok_or_else(|| AppError::Validation("Missing host in URL".to_string()))?;

    let path_and_query = match parsed_url.query() {
        Some(q) => format!("{}?{}", parsed_url.path(), q),
        None => parsed_url.path().to_string(),
    };

    // 2. Date header (RFC 2616 fixdate)
    let date = now.format("%a, %d %b %Y %H:%M:%S GMT").to_string();

    // 3. Digest if body present
    let digest = body.map(generate_digest);

    // 4. Signing string
    let mut headers_list = REQUIRED_SIGNED_HEADERS.to_vec();
    if digest.is_some() {
        headers_list.push("digest");
    }

    let signing_string = headers_list
        .iter()
        .map(|name| {
            let value = match *name {
                "(request-target)" => format!("{} {}", method.to_lowercase(), path_and_query),
                "host" => host.clone(),
                "date" => date.clone(),
                _ => digest.clone().unwrap_or_default(),
            };
            format!("{}: {}", name, value)
        })
        .collect::<Vec<_>>()
        .join("\n");

    // 5. RSA-SHA256
    let signature_b64 = keys.sign(signing_string.as_bytes(), private_key_pem)?;

    let signature = format!(
        "keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"{}\",signature=\"{}\"",
        key_id,
        headers_list.join(" "),
        signature_b64
    );

    Ok(SignedHeaders {
        host,
        date,
        digest,
        signature,
    })
}

/// Check everything about a signed request that needs no key.
///
/// Validates algorithm, covered headers, the Date window and the body digest,
/// then rebuilds the signing string in the order the signer listed.
pub fn check_signed_request(
    request: &IncomingRequest<'_>,
    clock_skew_seconds: i64,
    now: DateTime<Utc>,
) -> Result<(ParsedSignature, String), AppError> {
    let headers = request.headers;

    // 1. Parse Signature header
    let signature_header = header_str(headers, "signature")?;
    let parsed = parse_signature_header(signature_header)?;

    // 2. Algorithm and required signed headers
    if parsed.algorithm != "rsa-sha256" && parsed.algorithm != "hs2019" {
        return Err(AppError::Validation(format!(
            "Unsupported signature algorithm: {}",
            parsed.algorithm
        )));
    }

    for required in REQUIRED_SIGNED_HEADERS {
        if !parsed.headers.iter().any(|h| h == required) {
            return Err(AppError::Validation(format!(
                "Signed headers must include: {}",
                required
            )));
        }
    }

    if request.body.is_some() && !parsed.headers.iter().any(|h| h == "digest") {
        return Err(AppError::Validation(
            "Signed headers must include: digest".to_string(),
        ));
    }

    // 3. Date within the skew window
    let date = DateTime::parse_from_rfc2822(header_str(headers, "date")?)
        .map_err(|_| AppError::Validation("Invalid Date format".to_string()))?;
    if (now.timestamp() - date.timestamp()).abs() > clock_skew_seconds {
        return Err(AppError::Validation(
            "Date header too old or in future".to_string(),
        ));
    }

    // 4. Digest matches body
    if let Some(body) = request.body {
        if header_str(headers, "digest")? != generate_digest(body) {
            return Err(AppError::Validation("Digest mismatch".to_string()));
        }
    }

    // 5. Signing string
    let mut signing_parts = Vec::with_capacity(parsed.headers.len());
    for header_name in &parsed.headers {
        let value = match header_name.as_str() {
            "(request-target)" => format!(
                "{} {}",
                request.method.to_lowercase(),
                request.path_and_query
            ),
            name => header_str(headers, name)?.to_string(),
        };
        signing_parts.push(format!("{}: {}", header_name, value));
    }

    Ok((parsed, signing_parts.join("\n")))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, AppError> {
    headers
        .get(name)
        .ok_or_else(|| AppError::Validation(format!("Missing {} header", name)))?
        .to_str()
        .map_err(|_| AppError::Validation(format!("Invalid {} header", name)))
}

/// Extract keyId from Signature header.
pub fn extract_signature_key_id(headers: &HeaderMap) -> Result<String, AppError> {
    let parsed = parse_signature_header(header_str(headers, "signature")?)?;
    Ok(parsed.key_id)
}

/// Whether a keyId lives on the same `host[:port]` as an actor.
pub fn key_id_matches_actor_host(key_id: &str, actor_id: &str) -> bool {
    match (authority(key_id), authority(actor_id)) {
        (Some(key_host), Some(actor_host)) => key_host == actor_host,
        _ => false,
    }
}

fn strip_fragment(uri: &str) -> &str {
    uri.split('#').next().unwrap_or(uri)
}

/// Parse Signature header value
///
/// # Format
/// ```text
/// keyId="...",algorithm="...",headers="...",signature="..."
/// ```
///
/// `headers` defaults to `date` when absent, as the draft specifies; such a
/// signature is then rejected for not covering the required headers.
pub fn parse_signature_header(header: &str) -> Result<ParsedSignature, AppError> {
    let mut key_id = None;
    let mut algorithm = None;
    let mut headers = None;
    let mut signature = None;

    for part in header.split(',') {
        let part = part.trim();
        if let Some((key, value)) = part.split_once('=') {
            let value = value.trim().trim_matches('"');

            match key.trim() {
                "keyId" => key_id = Some(value.to_string()),
                "algorithm" => algorithm = Some(value.to_string()),
                "headers" => {
                    headers = Some(
                        value
                            .split_whitespace()
                            .map(|s| s.to_ascii_lowercase())
                            .collect(),
                    )
                }
                "signature" => signature = Some(value.to_string()),
                _ => {}
            }
        }
    }

    Ok(ParsedSignature {
        key_id: key_id
            .filter(|k| !k.is_empty())
            .ok_or_else(|| AppError::Validation("Missing keyId".to_string()))?,
        algorithm: algorithm
            .ok_or_else(|| AppError::Validation("Missing algorithm".to_string()))?,
        headers: headers.unwrap_or_else(|| vec!["date".to_string()]),
        signature: signature
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AppError::Validation("Missing signature".to_string()))?,
    })
}

/// Generate SHA-256 digest for body
///
/// # Returns
/// `SHA-256=base64(hash)`
pub fn generate_digest(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    format!("SHA-256={}", BASE64.encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::actor::tests::{
        spawn_remote_actor, spawn_remote_actor_with_key_id, test_config, test_directory,
    };
    use http::HeaderValue;

    fn header_map_for(signed: &SignedHeaders) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_str(&signed.host).expect("host"));
        headers.insert("date", HeaderValue::from_str(&signed.date).expect("date"));
        if let Some(digest) = &signed.digest {
            headers.insert("digest", HeaderValue::from_str(digest).expect("digest"));
        }
        headers.insert(
            "signature",
            HeaderValue::from_str(&signed.signature).expect("signature"),
        );
        headers
    }

    fn signed_map(
        method: &str,
        url: &str,
        body: Option<&[u8]>,
        private_key_pem: &str,
    ) -> HeaderMap {
        let signed = sign_request(
            &KeyStore::new(1024),
            method,
            url,
            body,
            private_key_pem,
            "https://remote.example/users/bob#main-key",
            Utc::now(),
        )
        .expect("signed");
        header_map_for(&signed)
    }

    fn incoming<'a>(
        headers: &'a HeaderMap,
        path_and_query: &'a str,
        body: Option<&'a [u8]>,
    ) -> IncomingRequest<'a> {
        IncomingRequest {
            method: "POST",
            path_and_query,
            headers,
            body,
        }
    }

    #[test]
    fn signed_request_checks_and_verifies() {
        let keys = KeyStore::new(1024);
        let pair = keys.generate_key_pair().expect("keys");
        let body = br#"{"type":"Follow"}"#;
        let headers = signed_map(
            "POST",
            "https://remote.example/inbox?foo=bar",
            Some(body),
            &pair.private_key_pem,
        );

        let (parsed, signing_string) = check_signed_request(
            &incoming(&headers, "/inbox?foo=bar", Some(body)),
            300,
            Utc::now(),
        )
        .expect("well-formed");
        assert_eq!(
            parsed.headers,
            vec!["(request-target)", "host", "date", "digest"]
        );
        assert!(signing_string.starts_with("(request-target): post /inbox?foo=bar\nhost: remote.example\n"));
        assert!(
            keys.verify(signing_string.as_bytes(), &parsed.signature, &pair.public_key_pem)
                .expect("runs")
        );
    }

    #[test]
    fn host_keeps_non_default_port() {
        let keys = KeyStore::new(1024);
        let pair = keys.generate_key_pair().expect("keys");
        let signed = sign_request(
            &keys,
            "POST",
            "http://127.0.0.1:8080/inbox",
            None,
            &pair.private_key_pem,
            "http://127.0.0.1:8080/users/alice#main-key",
            Utc::now(),
        )
        .expect("signed");
        assert_eq!(signed.host, "127.0.0.1:8080");
        assert!(signed.digest.is_none());
        assert!(signed.signature.contains("headers=\"(request-target) host date\""));
    }

    #[test]
    fn mutated_body_or_header_fails() {
        let keys = KeyStore::new(1024);
        let pair = keys.generate_key_pair().expect("keys");
        let body = br#"{"type":"Follow"}"#;
        let headers = signed_map("POST", "https://remote.example/inbox", Some(body), &pair.private_key_pem);

        // Body mutation breaks the digest
        let tampered_body = br#"{"type":"FolloW"}"#;
        assert!(matches!(
            check_signed_request(&incoming(&headers, "/inbox", Some(tampered_body)), 300, Utc::now()),
            Err(AppError::Validation(msg)) if msg.contains("Digest mismatch")
        ));

        // Host mutation keeps the request well-formed but breaks the signature
        let mut mutated = headers.clone();
        mutated.insert("host", HeaderValue::from_static("remote.examplf"));
        let (parsed, signing_string) =
            check_signed_request(&incoming(&mutated, "/inbox", Some(body)), 300, Utc::now())
                .expect("well-formed");
        assert!(
            !keys
                .verify(signing_string.as_bytes(), &parsed.signature, &pair.public_key_pem)
                .expect("runs")
        );
    }

    #[test]
    fn date_outside_window_is_rejected() {
        let keys = KeyStore::new(1024);
        let pair = keys.generate_key_pair().expect("keys");
        let body = br#"{}"#;
        let signed = sign_request(
            &keys,
            "POST",
            "https://remote.example/inbox",
            Some(body),
            &pair.private_key_pem,
            "https://remote.example/users/bob#main-key",
            Utc::now() - chrono::Duration::seconds(301),
        )
        .expect("signed");
        let headers = header_map_for(&signed);

        assert!(matches!(
            check_signed_request(&incoming(&headers, "/inbox", Some(body)), 300, Utc::now()),
            Err(AppError::Validation(msg)) if msg.contains("too old")
        ));
        assert!(check_signed_request(&incoming(&headers, "/inbox", Some(body)), 600, Utc::now()).is_ok());
    }

    #[test]
    fn missing_date_or_digest_is_rejected() {
        let pair = KeyStore::new(1024).generate_key_pair().expect("keys");
        let body = br#"{"type":"Follow"}"#;
        let headers = signed_map("POST", "https://remote.example/inbox", Some(body), &pair.private_key_pem);

        let mut no_date = headers.clone();
        no_date.remove("date");
        assert!(matches!(
            check_signed_request(&incoming(&no_date, "/inbox", Some(body)), 300, Utc::now()),
            Err(AppError::Validation(msg)) if msg.contains("Missing date header")
        ));

        let mut no_digest = headers.clone();
        no_digest.remove("digest");
        assert!(matches!(
            check_signed_request(&incoming(&no_digest, "/inbox", Some(body)), 300, Utc::now()),
            Err(AppError::Validation(msg)) if msg.contains("Missing digest header")
        ));
    }

    #[test]
    fn date_must_be_covered() {
        let pair = KeyStore::new(1024).generate_key_pair().expect("keys");
        let body = br#"{"type":"Follow"}"#;
        let mut headers = signed_map("POST", "https://remote.example/inbox", Some(body), &pair.private_key_pem);

        let parsed = parse_signature_header(
            headers.get("signature").and_then(|v| v.to_str().ok()).expect("signature"),
        )
        .expect("parsed");
        let tampered = format!(
            "keyId=\"{}\",algorithm=\"{}\",headers=\"(request-target) host digest\",signature=\"{}\"",
            parsed.key_id, parsed.algorithm, parsed.signature
        );
        headers.insert("signature", HeaderValue::from_str(&tampered).expect("tampered"));

        assert!(matches!(
            check_signed_request(&incoming(&headers, "/inbox", Some(body)), 300, Utc::now()),
            Err(AppError::Validation(msg)) if msg.contains("Signed headers must include: date")
        ));
    }

    #[test]
    fn parse_signature_header_requires_key_id_and_signature() {
        assert!(parse_signature_header("algorithm=\"rsa-sha256\",signature=\"abc\"").is_err());
        assert!(parse_signature_header("keyId=\"k\",algorithm=\"rsa-sha256\"").is_err());

        let parsed = parse_signature_header(
            "keyId=\"https://remote.example/users/bob#main-key\",algorithm=\"rsa-sha256\",signature=\"abc=\"",
        )
        .expect("parsed");
        assert_eq!(parsed.headers, vec!["date"]);
        assert_eq!(parsed.signature, "abc=");
    }

    #[test]
    fn key_id_host_must_match_actor_host() {
        assert!(key_id_matches_actor_host(
            "https://remote.example/users/bob#main-key",
            "https://remote.example/users/bob",
        ));
        assert!(!key_id_matches_actor_host(
            "https://evil.example/users/bob#main-key",
            "https://remote.example/users/bob",
        ));
        assert!(!key_id_matches_actor_host(
            "http://127.0.0.1:9000/users/bob#main-key",
            "http://127.0.0.1:9001/users/bob",
        ));
    }

    #[tokio::test]
    async fn verify_incoming_round_trips_for_local_key() {
        let (directory, db, _temp_dir) = test_directory().await;
        let alice = directory
            .create_default_actor_if_absent(&test_config().actor)
            .await
            .expect("bootstrap");
        let service = SignatureService::new(directory.clone(), db, 300);

        let body = br#"{"type":"Follow","actor":"https://example.com/users/alice"}"#;
        let signed = service
            .create_signed_headers("https://example.com/inbox", "POST", &alice, Some(body))
            .expect("signed");
        let headers = header_map_for(&signed);

        let verified = service
            .verify_incoming(&incoming(&headers, "/inbox", Some(body)), Some(alice.uri()))
            .await
            .expect("verified");
        assert_eq!(verified.actor_uri, alice.uri());

        // Replayed against another path
        assert!(matches!(
            service
                .verify_incoming(&incoming(&headers, "/users/alice/inbox", Some(body)), Some(alice.uri()))
                .await,
            Err(AppError::InvalidSignature)
        ));

        // Claimed by an actor on another host
        assert!(matches!(
            service
                .verify_incoming(
                    &incoming(&headers, "/inbox", Some(body)),
                    Some("https://evil.example/users/alice")
                )
                .await,
            Err(AppError::InvalidSignature)
        ));
    }

    #[tokio::test]
    async fn verify_incoming_fetches_remote_key() {
        let (directory, db, _temp_dir) = test_directory().await;
        let service = SignatureService::new(directory, db, 300);

        let keys = KeyStore::new(1024);
        let bob_keys = keys.generate_key_pair().expect("keys");
        let (bob_uri, hits) = spawn_remote_actor(bob_keys.public_key_pem.clone()).await;

        let body = br#"{"type":"Follow"}"#;
        let signed = sign_request(
            &keys,
            "POST",
            "https://example.com/users/alice/inbox",
            Some(body),
            &bob_keys.private_key_pem,
            &format!("{}#main-key", bob_uri),
            Utc::now(),
        )
        .expect("signed");
        let headers = header_map_for(&signed);

        let verified = service
            .verify_incoming(&incoming(&headers, "/users/alice/inbox", Some(body)), Some(&bob_uri))
            .await
            .expect("verified");
        assert_eq!(verified.actor_uri, bob_uri);
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);

        // Signed with a key the actor does not advertise: one refresh, then reject
        let mallory_keys = keys.generate_key_pair().expect("keys");
        let forged = sign_request(
            &keys,
            "POST",
            "https://example.com/users/alice/inbox",
            Some(body),
            &mallory_keys.private_key_pem,
            &format!("{}#main-key", bob_uri),
            Utc::now(),
        )
        .expect("signed");
        let forged_headers = header_map_for(&forged);
        assert!(matches!(
            service
                .verify_incoming(&incoming(&forged_headers, "/users/alice/inbox", Some(body)), Some(&bob_uri))
                .await,
            Err(AppError::InvalidSignature)
        ));
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn verify_incoming_accepts_path_style_key_id() {
        let (directory, db, _temp_dir) = test_directory().await;
        let service = SignatureService::new(directory, db, 300);

        let keys = KeyStore::new(1024);
        let bob_keys = keys.generate_key_pair().expect("keys");
        let (bob_uri, hits) =
            spawn_remote_actor_with_key_id(bob_keys.public_key_pem.clone(), "/main-key").await;
        let body = br#"{"type":"Follow"}"#;
        let sign_with = |key_id: String| {
            let signed = sign_request(
                &keys,
                "POST",
                "https://example.com/users/alice/inbox",
                Some(body),
                &bob_keys.private_key_pem,
                &key_id,
                Utc::now(),
            )
            .expect("signed");
            header_map_for(&signed)
        };

        let headers = sign_with(format!("{}/main-key", bob_uri));
        let verified = service
            .verify_incoming(&incoming(&headers, "/users/alice/inbox", Some(body)), Some(&bob_uri))
            .await
            .expect("verified");
        assert_eq!(verified.actor_uri, bob_uri);
        assert_eq!(verified.key_id, format!("{}/main-key", bob_uri));
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);

        // Same key material, but a keyId the actor does not advertise
        let headers = sign_with(format!("{}#main-key", bob_uri));
        assert!(
            service
                .verify_incoming(&incoming(&headers, "/users/alice/inbox", Some(body)), Some(&bob_uri))
                .await
                .is_err()
        );
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn revoked_local_key_no_longer_verifies() {
        let (directory, db, _temp_dir) = test_directory().await;
        let alice = directory
            .create_default_actor_if_absent(&test_config().actor)
            .await
            .expect("bootstrap");
        let service = SignatureService::new(directory.clone(), db, 300);

        let body = br#"{}"#;
        let headers = header_map_for(
            &service
                .create_signed_headers("https://example.com/inbox", "POST", &alice, Some(body))
                .expect("signed"),
        );

        directory.rotate_key("alice").await.expect("rotate");
        assert!(
            service
                .verify_incoming(&incoming(&headers, "/inbox", Some(body)), Some(alice.uri()))
                .await
                .is_ok(),
            "rotated-out key still verifies"
        );

        directory.revoke_key(alice.key_id()).await.expect("revoke");
        assert!(matches!(
            service
                .verify_incoming(&incoming(&headers, "/inbox", Some(body)), Some(alice.uri()))
                .await,
            Err(AppError::InvalidSignature)
        ));
    }
}
