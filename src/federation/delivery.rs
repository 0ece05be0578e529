//! Activity delivery
//!
//! Signs and POSTs activities to remote inboxes. Each destination is retried
//! on its own with exponential backoff, and a fan-out never fails as a whole
//! because one peer did.

use chrono::Utc;
use rand::Rng;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

use super::actor::ActorDirectory;
use super::follow::FollowRegistry;
use super::remote::{self, ACTIVITY_JSON};
use super::signature::SignatureService;
use crate::config::DeliveryConfig;
use crate::data::{Database, DeliveryFailure, EntityId, LocalActor};
use crate::error::AppError;

/// Bounded retry schedule for one destination
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Per-attempt timeout
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_backoff: Duration::from_millis(config.base_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            timeout: Duration::from_secs(config.timeout_seconds),
        }
    }

    /// Delay after the given failed attempt (1-based), before jitter
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Why a single attempt failed
#[derive(Debug, Clone)]
struct AttemptFailure {
    message: String,
    status_code: Option<u16>,
    retryable: bool,
}

/// Whether a response status is worth another attempt.
///
/// 429 and 5xx are transient; other 4xx mean the peer rejected the activity.
pub fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Result of delivering to one inbox
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    /// Target inbox URI
    pub inbox_uri: String,
    /// Whether delivery succeeded
    pub success: bool,
    /// Error message if failed
    pub error: Option<String>,
    /// HTTP status code of the last attempt, if a response came back
    pub status_code: Option<u16>,
    pub attempts: u32,
}

/// Aggregated outcome of a fan-out
#[derive(Debug, Clone, Default)]
pub struct DeliveryReport {
    pub activity_id: String,
    pub results: Vec<DeliveryResult>,
}

impl DeliveryReport {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }
}

/// An activity that was sent, with where it went
#[derive(Debug, Clone)]
pub struct SentActivity {
    pub activity: Value,
    pub result: DeliveryResult,
}

/// Activity delivery service
#[derive(Clone)]
pub struct DeliveryService {
    http_client: reqwest::Client,
    signer: Arc<SignatureService>,
    registry: Arc<FollowRegistry>,
    directory: Arc<ActorDirectory>,
    db: Arc<Database>,
    policy: RetryPolicy,
    max_concurrency: usize,
}

impl DeliveryService {
    pub fn new(
        http_client: reqwest::Client,
        signer: Arc<SignatureService>,
        registry: Arc<FollowRegistry>,
        directory: Arc<ActorDirectory>,
        db: Arc<Database>,
        config: &DeliveryConfig,
    ) -> Self {
        Self {
            http_client,
            signer,
            registry,
            directory,
            db,
            policy: RetryPolicy::from_config(config),
            max_concurrency: config.max_concurrency.max(1),
        }
    }

    /// Deliver an activity to a single inbox, retrying transient failures.
    ///
    /// A delivery that exhausts its attempts is written to the failure ledger.
    ///
    /// # Returns
    /// HTTP status of the accepted attempt
    ///
    /// # Errors
    /// `Delivery` once the inbox rejected the activity or attempts ran out
    pub async fn deliver_to_inbox(
        &self,
        inbox_uri: &str,
        activity: &Value,
        actor: &LocalActor,
    ) -> Result<u16, AppError> {
        let body = serde_json::to_vec(activity)
            .map_err(|e| AppError::Validation(format!("Failed to serialize activity: {}", e)))?;

        let result = self
            .deliver_body(inbox_uri, Arc::new(body), activity, actor)
            .await;

        match (result.success, result.status_code) {
            (true, Some(status)) => Ok(status),
            (true, None) => Ok(200),
            (false, _) => Err(AppError::Delivery(result.error.unwrap_or_else(|| {
                format!("Delivery to {} failed", inbox_uri)
            }))),
        }
    }

    /// Deliver to every follower inbox of `actor`, concurrently.
    ///
    /// The inbox list is read once up front; followers added while the batch
    /// runs are not included.
    ///
    /// # Errors
    /// Only if the follower list cannot be read. Per-inbox failures are
    /// reported in the returned report.
    pub async fn deliver_to_followers(
        &self,
        activity: &Value,
        actor: &LocalActor,
    ) -> Result<DeliveryReport, AppError> {
        let inboxes = self.registry.list_follower_inboxes(&actor.actor.id).await?;
        Ok(self.deliver_to_inboxes(activity, actor, inboxes).await)
    }

    /// Fan an activity out to a fixed list of inboxes
    pub async fn deliver_to_inboxes(
        &self,
        activity: &Value,
        actor: &LocalActor,
        inbox_uris: Vec<String>,
    ) -> DeliveryReport {
        let activity_id = activity_id_of(activity);
        let targets = unique_inbox_targets(inbox_uris);

        let body = match serde_json::to_vec(activity) {
            Ok(body) => Arc::new(body),
            Err(e) => {
                tracing::error!(activity_id = %activity_id, error = %e, "Failed to serialize activity");
                return DeliveryReport {
                    activity_id,
                    results: targets
                        .into_iter()
                        .map(|inbox_uri| failed_result(inbox_uri, e.to_string(), 0))
                        .collect(),
                };
            }
        };

        tracing::info!(
            activity_id = %activity_id,
            activity_type = activity_type_of(activity),
            inboxes = targets.len(),
            "Starting delivery batch"
        );

        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let activity = Arc::new(activity.clone());
        let actor = Arc::new(actor.clone());

        let tasks: Vec<_> = targets
            .into_iter()
            .map(|inbox_uri| {
                let semaphore = semaphore.clone();
                let service = self.clone();
                let body = body.clone();
                let activity = activity.clone();
                let actor = actor.clone();

                let task = tokio::spawn({
                    let inbox_uri = inbox_uri.clone();
                    async move {
                        let Ok(_permit) = semaphore.acquire_owned().await else {
                            return failed_result(inbox_uri, "Delivery pool closed".to_string(), 0);
                        };
                        service
                            .deliver_body(&inbox_uri, body, &activity, &actor)
                            .await
                    }
                });
                (inbox_uri, task)
            })
            .collect();

        let mut results = Vec::with_capacity(tasks.len());
        for (inbox_uri, task) in tasks {
            match task.await {
                Ok(result) => results.push(result),
                Err(e) => {
                    tracing::error!(inbox = %inbox_uri, error = %e, "Delivery task failed");
                    results.push(failed_result(inbox_uri, e.to_string(), 0));
                }
            }
        }

        let report = DeliveryReport {
            activity_id,
            results,
        };
        tracing::info!(
            activity_id = %report.activity_id,
            succeeded = report.succeeded(),
            failed = report.failed(),
            "Delivery batch complete"
        );
        report
    }

    /// Accept a Follow on behalf of its target.
    ///
    /// Resolves the follower's inbox, fetching the actor if needed, and
    /// delivers an Accept wrapping the original Follow.
    pub async fn send_accept_follow(
        &self,
        follow_activity: &Value,
        target: &LocalActor,
    ) -> Result<SentActivity, AppError> {
        let follower_uri = follow_activity
            .get("actor")
            .and_then(|actor| actor.as_str().or_else(|| actor.get("id")?.as_str()))
            .ok_or_else(|| AppError::Validation("Follow without actor".to_string()))?;

        let follower = self.directory.resolve_remote_actor(follower_uri).await?;

        let accept_id = format!("{}#accepts/follows/{}", target.uri(), EntityId::new().0);
        let activity = builder::accept(&accept_id, target.uri(), follow_activity.clone());

        let body = serde_json::to_vec(&activity)
            .map_err(|e| AppError::Validation(format!("Failed to serialize activity: {}", e)))?;
        let result = self
            .deliver_body(&follower.inbox_url, Arc::new(body), &activity, target)
            .await;

        if result.success {
            tracing::info!(
                follower = %follower.uri,
                inbox = %follower.inbox_url,
                "Sent Accept for Follow"
            );
        }

        Ok(SentActivity { activity, result })
    }

    /// Bounded retry loop for one destination
    async fn deliver_body(
        &self,
        inbox_uri: &str,
        body: Arc<Vec<u8>>,
        activity: &Value,
        actor: &LocalActor,
    ) -> DeliveryResult {
        let activity_type = activity_type_of(activity);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let started = Instant::now();
            let outcome = self.attempt_once(inbox_uri, &body, actor).await;
            let elapsed = started.elapsed().as_secs_f64();

            match outcome {
                Ok(status) => {
                    crate::metrics::DELIVERY_ATTEMPTS_TOTAL
                        .with_label_values(&["success"])
                        .inc();
                    crate::metrics::DELIVERY_DURATION_SECONDS
                        .with_label_values(&["success"])
                        .observe(elapsed);
                    crate::metrics::ACTIVITIES_SENT
                        .with_label_values(&[activity_type])
                        .inc();
                    tracing::debug!(inbox = %inbox_uri, activity_type, attempt, status, "Delivered");

                    return DeliveryResult {
                        inbox_uri: inbox_uri.to_string(),
                        success: true,
                        error: None,
                        status_code: Some(status),
                        attempts: attempt,
                    };
                }
                Err(failure) => {
                    let label = if failure.retryable { "retryable" } else { "permanent" };
                    crate::metrics::DELIVERY_ATTEMPTS_TOTAL
                        .with_label_values(&[label])
                        .inc();
                    crate::metrics::DELIVERY_DURATION_SECONDS
                        .with_label_values(&[label])
                        .observe(elapsed);

                    if failure.retryable && attempt < self.policy.max_attempts {
                        let delay = with_jitter(self.policy.backoff_after(attempt));
                        tracing::warn!(
                            inbox = %inbox_uri,
                            activity_type,
                            attempt,
                            status = ?failure.status_code,
                            error = %failure.message,
                            retry_in_ms = delay.as_millis() as u64,
                            "Delivery attempt failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    tracing::error!(
                        inbox = %inbox_uri,
                        activity_type,
                        actor = %actor.uri(),
                        attempts = attempt,
                        status = ?failure.status_code,
                        error = %failure.message,
                        "Delivery dropped"
                    );
                    self.record_failure(inbox_uri, activity, attempt, &failure.message)
                        .await;

                    return DeliveryResult {
                        inbox_uri: inbox_uri.to_string(),
                        success: false,
                        error: Some(failure.message),
                        status_code: failure.status_code,
                        attempts: attempt,
                    };
                }
            }
        }
    }

    async fn attempt_once(
        &self,
        inbox_uri: &str,
        body: &Arc<Vec<u8>>,
        actor: &LocalActor,
    ) -> Result<u16, AttemptFailure> {
        // Inbox URLs come from peer documents, so they get the same address
        // guard as any other remote fetch.
        remote::check_remote_url(inbox_uri, self.directory.allow_private_addresses())
            .await
            .map_err(|e| AttemptFailure {
                message: format!("Refusing to deliver to {}: {}", inbox_uri, e),
                status_code: None,
                retryable: false,
            })?;

        // Signed per attempt so the Date stays inside the peer's window.
        let signed = self
            .signer
            .create_signed_headers(inbox_uri, "POST", actor, Some(body.as_slice()))
            .map_err(|e| AttemptFailure {
                message: e.to_string(),
                status_code: None,
                retryable: false,
            })?;

        let request = signed.apply(
            self.http_client
                .post(inbox_uri)
                .header(reqwest::header::CONTENT_TYPE, ACTIVITY_JSON)
                .header(reqwest::header::ACCEPT, ACTIVITY_JSON)
                .body(body.as_ref().clone()),
        );

        let response = match tokio::time::timeout(self.policy.timeout, request.send()).await {
            Err(_) => {
                crate::metrics::FEDERATION_REQUESTS_TOTAL
                    .with_label_values(&["outbound_delivery", "timeout"])
                    .inc();
                return Err(AttemptFailure {
                    message: format!("Timed out after {:?}", self.policy.timeout),
                    status_code: None,
                    retryable: true,
                });
            }
            Ok(Err(e)) => {
                crate::metrics::FEDERATION_REQUESTS_TOTAL
                    .with_label_values(&["outbound_delivery", "error"])
                    .inc();
                // Malformed URLs and the like will not get better
                return Err(AttemptFailure {
                    message: format!("Failed to deliver to {}: {}", inbox_uri, e),
                    status_code: None,
                    retryable: !e.is_builder(),
                });
            }
            Ok(Ok(response)) => response,
        };

        let status = response.status();
        crate::metrics::FEDERATION_REQUESTS_TOTAL
            .with_label_values(&["outbound_delivery", status.as_str()])
            .inc();

        if status.is_success() {
            return Ok(status.as_u16());
        }

        Err(AttemptFailure {
            message: format!("Inbox {} rejected activity: HTTP {}", inbox_uri, status),
            status_code: Some(status.as_u16()),
            retryable: is_retryable_status(status),
        })
    }

    async fn record_failure(&self, inbox_uri: &str, activity: &Value, attempts: u32, error: &str) {
        let failure = DeliveryFailure {
            id: EntityId::new().0,
            inbox_url: inbox_uri.to_string(),
            activity_id: activity_id_of(activity),
            attempts: i64::from(attempts),
            last_error: error.to_string(),
            failed_at: Utc::now(),
        };
        if let Err(e) = self.db.insert_delivery_failure(&failure).await {
            tracing::error!(inbox = %inbox_uri, error = %e, "Failed to record delivery failure");
        }
    }
}

fn with_jitter(base: Duration) -> Duration {
    let ceiling = (base.as_millis() as u64 / 5).min(1_000);
    let jitter_ms = rand::thread_rng().gen_range(0..=ceiling);
    base + Duration::from_millis(jitter_ms)
}

fn failed_result(inbox_uri: String, error: String, attempts: u32) -> DeliveryResult {
    DeliveryResult {
        inbox_uri,
        success: false,
        error: Some(error),
        status_code: None,
        attempts,
    }
}

fn activity_id_of(activity: &Value) -> String {
    activity
        .get("id")
        .and_then(|id| id.as_str())
        .unwrap_or_default()
        .to_string()
}

fn activity_type_of(activity: &Value) -> &str {
    activity
        .get("type")
        .and_then(|t| t.as_str())
        .unwrap_or("Unknown")
}

/// Deduplicate identical inbox URIs while keeping distinct personal inboxes.
///
/// This preserves recipients on the same domain that use different inbox paths.
fn unique_inbox_targets(inbox_uris: Vec<String>) -> Vec<String> {
    use std::collections::HashSet;

    let mut seen = HashSet::new();
    inbox_uris
        .into_iter()
        .filter(|inbox_uri| seen.insert(inbox_uri.clone()))
        .collect()
}

/// Build ActivityPub activity JSON
pub mod builder {
    use serde_json::Value;

    pub const PUBLIC_AUDIENCE: &str = "https://www.w3.org/ns/activitystreams#Public";

    /// Build an Accept activity
    ///
    /// # Arguments
    /// * `id` - Activity ID (unique URI)
    /// * `actor` - Actor URI (accepter)
    /// * `object` - Original activity being accepted (usually a Follow)
    pub fn accept(id: &str, actor: &str, object: Value) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Accept",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build a Create activity
    ///
    /// # Arguments
    /// * `id` - Activity ID (unique URI)
    /// * `actor` - Actor URI (creator)
    /// * `object` - Object being created (usually a Note)
    /// * `published` - Same timestamp as the object (RFC3339)
    pub fn create(id: &str, actor: &str, object: Value, published: &str) -> Value {
        let to = object.get("to").cloned().unwrap_or_else(|| Value::Array(vec![]));
        let cc = object.get("cc").cloned().unwrap_or_else(|| Value::Array(vec![]));
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Create",
            "id": id,
            "actor": actor,
            "object": object,
            "to": to,
            "cc": cc,
            "published": published
        })
    }

    /// Build a public Note addressed to the author's followers
    ///
    /// # Arguments
    /// * `id` - Note ID (unique URI)
    /// * `attributed_to` - Actor URI (author)
    /// * `followers` - Author's followers collection
    /// * `content` - HTML content
    /// * `published` - Publication timestamp (RFC3339)
    pub fn note(
        id: &str,
        attributed_to: &str,
        followers: &str,
        content: &str,
        summary: Option<&str>,
        url: Option<&str>,
        published: &str,
    ) -> Value {
        let mut note = serde_json::json!({
            "type": "Note",
            "id": id,
            "attributedTo": attributed_to,
            "content": content,
            "published": published,
            "to": [PUBLIC_AUDIENCE],
            "cc": [followers],
            "sensitive": false
        });
        if let Some(summary) = summary {
            note["summary"] = Value::String(summary.to_string());
        }
        if let Some(url) = url {
            note["url"] = Value::String(url.to_string());
        }
        note
    }
}
