//! Inbound activity processing
//!
//! Signature checks happen at the HTTP edge; this module interprets the
//! verified activity and applies its side effects.

use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;

use super::actor::ActorDirectory;
use super::delivery::{DeliveryService, SentActivity};
use super::follow::{FollowRegistry, NewFollower};
use super::outbox::OutboxLog;
use super::signature::VerifiedSignature;
use crate::data::ActivityDirection;
use crate::error::AppError;

/// Activity types this server acts on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundActivity {
    Follow {
        id: String,
        actor: String,
        /// Followed actor, as referenced by the peer
        object: String,
    },
    UndoFollow {
        id: Option<String>,
        actor: String,
        /// Id of the Follow being undone
        follow_id: Option<String>,
        /// Followed actor, when the Follow was embedded
        object: Option<String>,
    },
    Unsupported {
        id: Option<String>,
        actor: String,
        kind: String,
    },
}

impl InboundActivity {
    /// Classify an activity document.
    ///
    /// # Errors
    /// `Validation` if it is not an object with a string `type` and an
    /// `actor`, or if a Follow/Undo lacks the fields it needs
    pub fn parse(activity: &Value) -> Result<Self, AppError> {
        let kind = activity
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| AppError::Validation("Activity has no type".to_string()))?;
        let actor = reference(activity.get("actor"))
            .ok_or_else(|| AppError::Validation("Activity has no actor".to_string()))?;
        let id = activity.get("id").and_then(|id| id.as_str()).map(str::to_string);

        match kind {
            "Follow" => Ok(Self::Follow {
                id: id.ok_or_else(|| AppError::Validation("Follow has no id".to_string()))?,
                actor,
                object: reference(activity.get("object"))
                    .ok_or_else(|| AppError::Validation("Follow has no object".to_string()))?,
            }),
            "Undo" => {
                let object = activity
                    .get("object")
                    .ok_or_else(|| AppError::Validation("Undo has no object".to_string()))?;

                match object {
                    Value::String(follow_id) => Ok(Self::UndoFollow {
                        id,
                        actor,
                        follow_id: Some(follow_id.clone()),
                        object: None,
                    }),
                    Value::Object(_)
                        if object.get("type").and_then(|t| t.as_str()) == Some("Follow") =>
                    {
                        let inner_actor = reference(object.get("actor"));
                        if inner_actor.is_some_and(|inner| inner != actor) {
                            return Err(AppError::Validation(
                                "Undo of a Follow made by another actor".to_string(),
                            ));
                        }
                        let follow_id =
                            object.get("id").and_then(|id| id.as_str()).map(str::to_string);
                        let target = reference(object.get("object"));
                        if follow_id.is_none() && target.is_none() {
                            return Err(AppError::Validation(
                                "Undo(Follow) identifies no Follow".to_string(),
                            ));
                        }
                        Ok(Self::UndoFollow {
                            id,
                            actor,
                            follow_id,
                            object: target,
                        })
                    }
                    _ => Ok(Self::Unsupported {
                        id,
                        actor,
                        kind: "Undo".to_string(),
                    }),
                }
            }
            other => Ok(Self::Unsupported {
                id,
                actor,
                kind: other.to_string(),
            }),
        }
    }

    pub fn actor(&self) -> &str {
        match self {
            Self::Follow { actor, .. }
            | Self::UndoFollow { actor, .. }
            | Self::Unsupported { actor, .. } => actor,
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Follow { id, .. } => Some(id),
            Self::UndoFollow { id, .. } | Self::Unsupported { id, .. } => id.as_deref(),
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            Self::Follow { .. } => "Follow",
            Self::UndoFollow { .. } => "Undo",
            Self::Unsupported { kind, .. } => kind,
        }
    }
}

/// What processing an activity did
#[derive(Debug)]
pub enum InboxOutcome {
    /// Edge recorded; the Accept is being delivered in the background
    FollowAccepted {
        follower: String,
        created: bool,
        accept: JoinHandle<Option<SentActivity>>,
    },
    Unfollowed {
        follower: String,
        removed: bool,
    },
    Ignored {
        activity_type: String,
    },
    /// Activity id seen before; side effects skipped
    Duplicate,
}

pub struct InboxProcessor {
    directory: Arc<ActorDirectory>,
    registry: Arc<FollowRegistry>,
    delivery: Arc<DeliveryService>,
    log: Arc<OutboxLog>,
}

impl InboxProcessor {
    pub fn new(
        directory: Arc<ActorDirectory>,
        registry: Arc<FollowRegistry>,
        delivery: Arc<DeliveryService>,
        log: Arc<OutboxLog>,
    ) -> Self {
        Self {
            directory,
            registry,
            delivery,
            log,
        }
    }

    /// Apply a verified activity.
    ///
    /// The activity is logged only once its side effects succeeded, so a
    /// peer's retry after a failure is processed again.
    ///
    /// # Arguments
    /// * `activity` - Activity document
    /// * `body` - Request body it was parsed from, logged unchanged
    /// * `parsed` - Its classification
    /// * `verified` - Signature that authenticated the request
    pub async fn process(
        &self,
        activity: &Value,
        body: &[u8],
        parsed: InboundActivity,
        verified: &VerifiedSignature,
    ) -> Result<InboxOutcome, AppError> {
        if parsed.actor() != verified.actor_uri {
            return Err(AppError::InvalidSignature);
        }

        crate::metrics::ACTIVITIES_RECEIVED
            .with_label_values(&[parsed.kind()])
            .inc();

        let seen = match parsed.id() {
            Some(id) => self.log.contains(ActivityDirection::Inbox, id).await?,
            None => false,
        };
        if seen {
            tracing::info!(
                activity_id = parsed.id(),
                activity_type = parsed.kind(),
                actor = parsed.actor(),
                "Duplicate activity ignored"
            );
            return Ok(InboxOutcome::Duplicate);
        }

        let outcome = match &parsed {
            InboundActivity::Follow { id, actor, object } => {
                self.handle_follow(activity, id, actor, object).await?
            }
            InboundActivity::UndoFollow {
                actor,
                follow_id,
                object,
                ..
            } => {
                self.handle_undo_follow(actor, follow_id.as_deref(), object.as_deref())
                    .await?
            }
            InboundActivity::Unsupported { kind, actor, .. } => {
                tracing::debug!(activity_type = %kind, actor = %actor, "Unsupported activity ignored");
                InboxOutcome::Ignored {
                    activity_type: kind.clone(),
                }
            }
        };

        if parsed.id().is_some() {
            if let Err(e) = self.log.append_received(activity, body).await {
                tracing::warn!(activity_type = parsed.kind(), error = %e, "Failed to log inbound activity");
            }
        }

        Ok(outcome)
    }

    async fn handle_follow(
        &self,
        activity: &Value,
        follow_id: &str,
        follower_uri: &str,
        object: &str,
    ) -> Result<InboxOutcome, AppError> {
        let username = self.directory.local_username_for(object).ok_or_else(|| {
            tracing::warn!(object, actor = follower_uri, "Follow for an unknown local actor");
            AppError::NotFound
        })?;
        let target = self.directory.get_local_actor(&username).await?;
        let follower = self.directory.resolve_remote_actor(follower_uri).await?;

        let created = self
            .registry
            .add_follower(NewFollower {
                target_actor_id: target.actor.id.clone(),
                follower_uri: follower.uri.clone(),
                follower_username: follower.username.clone(),
                follower_domain: follower.domain.clone(),
                follower_inbox_url: follower.inbox_url.clone(),
                follower_shared_inbox_url: follower.shared_inbox_url.clone(),
                source_activity_id: follow_id.to_string(),
            })
            .await?;

        tracing::info!(
            actor = follower_uri,
            target = %target.uri(),
            created,
            "Follow accepted"
        );

        // A duplicate Follow is still answered, so the peer can settle its state.
        let delivery = self.delivery.clone();
        let log = self.log.clone();
        let follow = activity.clone();
        let accept = tokio::spawn(async move {
            match delivery.send_accept_follow(&follow, &target).await {
                Ok(sent) => {
                    if let Err(e) = log.append(&sent.activity, ActivityDirection::Outbox).await {
                        tracing::warn!(error = %e, "Failed to log Accept");
                    }
                    Some(sent)
                }
                Err(e) => {
                    tracing::error!(
                        activity_type = "Accept",
                        target = %target.uri(),
                        error = %e,
                        "Failed to send Accept"
                    );
                    None
                }
            }
        });

        Ok(InboxOutcome::FollowAccepted {
            follower: follower.uri.clone(),
            created,
            accept,
        })
    }

    async fn handle_undo_follow(
        &self,
        follower_uri: &str,
        follow_id: Option<&str>,
        object: Option<&str>,
    ) -> Result<InboxOutcome, AppError> {
        let mut removed = false;

        if let Some(username) = object.and_then(|o| self.directory.local_username_for(o)) {
            if let Some(target) = self.directory.find_local_actor(&username).await? {
                removed = self.registry.remove_follower(&target.id, follower_uri).await?;
            }
        }

        if let (false, Some(follow_id)) = (removed, follow_id) {
            removed = self.registry.remove_by_activity(follower_uri, follow_id).await?;
        }

        tracing::info!(actor = follower_uri, removed, "Undo(Follow) processed");
        Ok(InboxOutcome::Unfollowed {
            follower: follower_uri.to_string(),
            removed,
        })
    }
}

/// A URI given either as a string or as an object with an `id`
fn reference(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(uri) if !uri.is_empty() => Some(uri.clone()),
        Value::Object(_) => value?.get("id")?.as_str().map(str::to_string),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_follow_with_embedded_actor() {
        let parsed = InboundActivity::parse(&json!({
            "id": "https://remote.example/follows/1",
            "type": "Follow",
            "actor": { "id": "https://remote.example/users/bob" },
            "object": "https://example.com/users/alice"
        }))
        .unwrap();

        assert_eq!(
            parsed,
            InboundActivity::Follow {
                id: "https://remote.example/follows/1".to_string(),
                actor: "https://remote.example/users/bob".to_string(),
                object: "https://example.com/users/alice".to_string(),
            }
        );
    }

    #[test]
    fn parse_undo_by_reference_and_embedded() {
        let by_reference = InboundActivity::parse(&json!({
            "type": "Undo",
            "actor": "https://remote.example/users/bob",
            "object": "https://remote.example/follows/1"
        }))
        .unwrap();
        assert!(matches!(
            by_reference,
            InboundActivity::UndoFollow { follow_id: Some(_), object: None, .. }
        ));

        let embedded = InboundActivity::parse(&json!({
            "id": "https://remote.example/undos/1",
            "type": "Undo",
            "actor": "https://remote.example/users/bob",
            "object": {
                "id": "https://remote.example/follows/1",
                "type": "Follow",
                "actor": "https://remote.example/users/bob",
                "object": "https://example.com/users/alice"
            }
        }))
        .unwrap();
        assert_eq!(
            embedded,
            InboundActivity::UndoFollow {
                id: Some("https://remote.example/undos/1".to_string()),
                actor: "https://remote.example/users/bob".to_string(),
                follow_id: Some("https://remote.example/follows/1".to_string()),
                object: Some("https://example.com/users/alice".to_string()),
            }
        );
    }

    #[test]
    fn undo_of_other_types_is_unsupported() {
        let parsed = InboundActivity::parse(&json!({
            "type": "Undo",
            "actor": "https://remote.example/users/bob",
            "object": { "type": "Like", "id": "https://remote.example/likes/1" }
        }))
        .unwrap();
        assert_eq!(parsed.kind(), "Undo");
        assert!(matches!(parsed, InboundActivity::Unsupported { .. }));
    }

    #[test]
    fn unknown_types_are_unsupported_not_errors() {
        let parsed = InboundActivity::parse(&json!({
            "type": "Like",
            "actor": "https://remote.example/users/bob",
            "object": "https://example.com/objects/1"
        }))
        .unwrap();
        assert_eq!(parsed.kind(), "Like");
    }

    #[test]
    fn malformed_activities_are_rejected() {
        for activity in [
            json!([]),
            json!({}),
            json!({ "type": "Follow" }),
            json!({ "type": 3, "actor": "https://remote.example/users/bob" }),
            json!({ "type": "Follow", "actor": "https://remote.example/users/bob", "object": "x" }),
            json!({ "type": "Undo", "actor": "https://remote.example/users/bob" }),
            json!({
                "type": "Undo",
                "actor": "https://remote.example/users/bob",
                "object": { "type": "Follow", "actor": "https://remote.example/users/eve", "id": "f" }
            }),
        ] {
            assert!(
                matches!(InboundActivity::parse(&activity), Err(AppError::Validation(_))),
                "{activity} should be rejected"
            );
        }
    }
}
