//! Data models
//!
//! Rust structs representing database entities.
//! All models use ULID for IDs and chrono for timestamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// ID Types
// =============================================================================

/// Entity ID wrapper (ULID format, 26 characters)
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Actors
// =============================================================================

/// A federated identity, local or remote.
///
/// Remote rows are a read-mostly cache of the peer's actor document and are
/// refreshed when `fetched_at` is older than the configured TTL.
/// Private key material never lives here; see [`KeyRecord`].
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Actor {
    pub id: String,
    /// Canonical ActivityPub id
    pub uri: String,
    pub username: String,
    pub domain: String,
    pub display_name: Option<String>,
    pub summary: Option<String>,
    pub inbox_url: String,
    pub outbox_url: Option<String>,
    pub followers_url: Option<String>,
    pub following_url: Option<String>,
    pub shared_inbox_url: Option<String>,
    /// keyId advertised in the actor document
    pub public_key_id: String,
    pub public_key_pem: String,
    pub icon_url: Option<String>,
    pub is_local: bool,
    pub fetched_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Signature algorithm recorded on every key
pub const KEY_ALGORITHM: &str = "rsa-sha256";

/// A versioned key pair bound to an actor.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct KeyRecord {
    /// URI, e.g. `https://example.com/users/alice#main-key`
    pub key_id: String,
    pub actor_id: String,
    pub public_key_pem: String,
    /// Present for local keys only
    #[serde(skip_serializing)]
    pub private_key_pem: Option<String>,
    pub algorithm: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked: bool,
    pub is_active: bool,
}

impl KeyRecord {
    /// Whether the key may still verify signatures at `now`.
    ///
    /// Inactive (rotated-out) keys still verify; revoked or expired keys do not.
    pub fn accepts_verification_at(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && self.expires_at.is_none_or(|expires_at| expires_at > now)
    }

    /// Whether the key may be used for new signatures at `now`.
    pub fn can_sign_at(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.private_key_pem.is_some() && self.accepts_verification_at(now)
    }
}

/// A local actor together with the key it currently signs with.
#[derive(Debug, Clone)]
pub struct LocalActor {
    pub actor: Actor,
    pub key: KeyRecord,
}

impl LocalActor {
    pub fn uri(&self) -> &str {
        &self.actor.uri
    }

    pub fn key_id(&self) -> &str {
        &self.key.key_id
    }
}

// =============================================================================
// Follow relationships
// =============================================================================

/// A remote actor following a local actor.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FollowEdge {
    pub id: String,
    pub target_actor_id: String,
    pub follower_uri: String,
    pub follower_username: String,
    pub follower_domain: String,
    pub follower_inbox_url: String,
    pub follower_shared_inbox_url: Option<String>,
    /// Original Follow activity id, matched by Undo
    pub source_activity_id: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Activity log
// =============================================================================

/// Which side of the server an activity passed through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityDirection {
    Inbox,
    Outbox,
}

impl ActivityDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbox => "inbox",
            Self::Outbox => "outbox",
        }
    }
}

/// Immutable record of a protocol message.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ActivityRecord {
    pub id: String,
    pub activity_id: String,
    /// "inbox" or "outbox"
    pub direction: String,
    pub activity_type: String,
    pub actor_uri: String,
    pub object_ref: Option<String>,
    pub published_at: DateTime<Utc>,
    /// Exact JSON sent or received
    pub raw_payload: String,
}

impl ActivityRecord {
    /// Build a record from an activity document.
    ///
    /// Returns `None` when the document lacks `id`, `type` or `actor`.
    pub fn from_activity(
        activity: &serde_json::Value,
        direction: ActivityDirection,
        raw_payload: String,
    ) -> Option<Self> {
        let activity_id = activity.get("id")?.as_str()?.to_string();
        let activity_type = activity.get("type")?.as_str()?.to_string();
        let actor_uri = match activity.get("actor")? {
            serde_json::Value::String(uri) => uri.clone(),
            other => other.get("id")?.as_str()?.to_string(),
        };
        let object_ref = activity.get("object").and_then(|object| {
            object
                .as_str()
                .or_else(|| object.get("id").and_then(|id| id.as_str()))
                .map(str::to_string)
        });
        let published_at = activity
            .get("published")
            .and_then(|p| p.as_str())
            .and_then(|p| DateTime::parse_from_rfc3339(p).ok())
            .map(|p| p.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Some(Self {
            id: EntityId::new().0,
            activity_id,
            direction: direction.as_str().to_string(),
            activity_type,
            actor_uri,
            object_ref,
            published_at,
            raw_payload,
        })
    }

    pub fn payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_str(&self.raw_payload)
    }
}

/// A delivery that was dropped after exhausting its retries
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliveryFailure {
    pub id: String,
    pub inbox_url: String,
    pub activity_id: String,
    pub attempts: i64,
    pub last_error: String,
    pub failed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn key(revoked: bool, is_active: bool, expires_at: Option<DateTime<Utc>>) -> KeyRecord {
        KeyRecord {
            key_id: "https://example.com/users/alice#main-key".to_string(),
            actor_id: EntityId::new().0,
            public_key_pem: "pem".to_string(),
            private_key_pem: Some("private".to_string()),
            algorithm: KEY_ALGORITHM.to_string(),
            created_at: Utc::now(),
            expires_at,
            revoked,
            is_active,
        }
    }

    #[test]
    fn rotated_out_key_still_verifies_but_cannot_sign() {
        let record = key(false, false, None);
        assert!(record.accepts_verification_at(Utc::now()));
        assert!(!record.can_sign_at(Utc::now()));
    }

    #[test]
    fn expired_and_revoked_keys_never_verify() {
        let now = Utc::now();
        assert!(!key(true, true, None).accepts_verification_at(now));
        assert!(!key(false, true, Some(now - Duration::seconds(1))).accepts_verification_at(now));
        assert!(key(false, true, Some(now + Duration::hours(1))).accepts_verification_at(now));
    }

    #[test]
    fn activity_record_reads_embedded_object_id() {
        let activity = json!({
            "id": "https://example.com/activities/1",
            "type": "Create",
            "actor": "https://example.com/users/alice",
            "published": "2026-01-01T00:00:00Z",
            "object": { "id": "https://example.com/objects/1", "type": "Note" }
        });
        let record =
            ActivityRecord::from_activity(&activity, ActivityDirection::Outbox, activity.to_string())
                .expect("record");
        assert_eq!(record.object_ref.as_deref(), Some("https://example.com/objects/1"));
        assert_eq!(record.direction, "outbox");
        assert_eq!(record.published_at.to_rfc3339(), "2026-01-01T00:00:00+00:00");
    }

    #[test]
    fn activity_record_requires_id() {
        let activity = json!({ "type": "Follow", "actor": "https://remote.example/users/bob" });
        assert!(
            ActivityRecord::from_activity(&activity, ActivityDirection::Inbox, String::new())
                .is_none()
        );
    }
}
