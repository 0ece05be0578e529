//! Actor directory
//!
//! Local actors are read from the database only. Remote actors are fetched on
//! demand, persisted as a cache, and resolved through a single-flight in-memory
//! layer so concurrent lookups of one URI share a single fetch.

use chrono::Utc;
use moka::future::Cache;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

use super::keys::KeyStore;
use super::remote::{self, ACTIVITY_JSON};
use super::webfinger::{AcctResource, resolve_webfinger};
use crate::config::{ActorConfig, AppConfig};
use crate::data::{Actor, Database, EntityId, KEY_ALGORITHM, KeyRecord, LocalActor, stale_before};
use crate::error::AppError;

const REMOTE_ACTOR_CACHE_CAPACITY: u64 = 10_000;

/// Resolves usernames and URIs to actor records.
pub struct ActorDirectory {
    db: Arc<Database>,
    http_client: reqwest::Client,
    keys: KeyStore,
    remote_actors: Cache<String, Arc<Actor>>,
    base_url: String,
    domain: String,
    protocol: String,
    cache_ttl: Duration,
    allow_private_addresses: bool,
}

impl ActorDirectory {
    pub fn new(
        db: Arc<Database>,
        http_client: reqwest::Client,
        keys: KeyStore,
        config: &AppConfig,
    ) -> Self {
        let cache_ttl = config.federation.actor_cache_ttl();
        let remote_actors = Cache::builder()
            .max_capacity(REMOTE_ACTOR_CACHE_CAPACITY)
            .time_to_live(cache_ttl)
            .build();

        Self {
            db,
            http_client,
            keys,
            remote_actors,
            base_url: config.server.base_url(),
            domain: config.server.domain.to_ascii_lowercase(),
            protocol: config.server.protocol.to_ascii_lowercase(),
            cache_ttl,
            allow_private_addresses: config.federation.allow_private_addresses,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Whether remote URLs may point at loopback/private hosts
    pub fn allow_private_addresses(&self) -> bool {
        self.allow_private_addresses
    }

    pub fn key_store(&self) -> &KeyStore {
        &self.keys
    }

    /// ActivityPub id of a local username
    pub fn local_actor_uri(&self, username: &str) -> String {
        format!("{}/users/{}", self.base_url, username)
    }

    // =========================================================================
    // Local actors
    // =========================================================================

    /// Look up a local actor and the key it signs with.
    ///
    /// # Errors
    /// `NotFound` if no such local actor exists
    pub async fn get_local_actor(&self, username: &str) -> Result<LocalActor, AppError> {
        let actor = self
            .db
            .get_local_actor(username)
            .await?
            .ok_or(AppError::NotFound)?;

        let key = self
            .db
            .get_active_key(&actor.id)
            .await?
            .filter(|key| key.can_sign_at(Utc::now()))
            .ok_or_else(|| {
                AppError::Crypto(format!("No usable signing key for {}", actor.uri))
            })?;

        Ok(LocalActor { actor, key })
    }

    /// Look up a local actor row without its key
    pub async fn find_local_actor(&self, username: &str) -> Result<Option<Actor>, AppError> {
        self.db.get_local_actor(username).await
    }

    /// Create the local author if it does not exist yet.
    ///
    /// Key generation happens before the insert; when two callers race, the
    /// unique `(username, domain)` constraint keeps the first row and the
    /// loser's key pair is discarded. Display fields of an existing actor are
    /// synced from `profile`.
    pub async fn create_default_actor_if_absent(
        &self,
        profile: &ActorConfig,
    ) -> Result<LocalActor, AppError> {
        if let Some(existing) = self.db.get_local_actor(&profile.username).await? {
            let changed = self
                .db
                .update_local_profile(
                    &existing.id,
                    &profile.display_name,
                    &profile.summary,
                    profile.icon_url.as_deref(),
                )
                .await?;
            if changed {
                tracing::info!(username = %profile.username, "Local actor profile updated");
            }
            return self.get_local_actor(&profile.username).await;
        }

        let key_store = self.keys;
        let pair = tokio::task::spawn_blocking(move || key_store.generate_key_pair())
            .await
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Key generation task failed: {}", e)))??;

        let now = Utc::now();
        let uri = self.local_actor_uri(&profile.username);
        let key_id = format!("{}#main-key", uri);

        let actor = Actor {
            id: EntityId::new().0,
            uri: uri.clone(),
            username: profile.username.clone(),
            domain: self.domain.clone(),
            display_name: Some(profile.display_name.clone()),
            summary: Some(profile.summary.clone()),
            inbox_url: format!("{}/inbox", uri),
            outbox_url: Some(format!("{}/outbox", uri)),
            followers_url: Some(format!("{}/followers", uri)),
            following_url: Some(format!("{}/following", uri)),
            shared_inbox_url: Some(format!("{}/inbox", self.base_url)),
            public_key_id: key_id.clone(),
            public_key_pem: pair.public_key_pem.clone(),
            icon_url: profile.icon_url.clone(),
            is_local: true,
            fetched_at: now,
            created_at: now,
            updated_at: now,
        };
        let key = KeyRecord {
            key_id,
            actor_id: actor.id.clone(),
            public_key_pem: pair.public_key_pem,
            private_key_pem: Some(pair.private_key_pem),
            algorithm: KEY_ALGORITHM.to_string(),
            created_at: now,
            expires_at: None,
            revoked: false,
            is_active: true,
        };

        if self.db.insert_local_actor_if_absent(&actor, &key).await? {
            tracing::info!(username = %profile.username, uri = %uri, "Local actor created");
        } else {
            tracing::debug!(username = %profile.username, "Local actor created concurrently");
        }

        self.get_local_actor(&profile.username).await
    }

    /// Issue a new signing key for a local actor.
    ///
    /// The previous key is deactivated but kept, so signatures made with it
    /// still verify until it is revoked or expires.
    pub async fn rotate_key(&self, username: &str) -> Result<KeyRecord, AppError> {
        let current = self.get_local_actor(username).await?;

        let key_store = self.keys;
        let pair = tokio::task::spawn_blocking(move || key_store.generate_key_pair())
            .await
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Key generation task failed: {}", e)))??;

        let key = KeyRecord {
            key_id: format!(
                "{}#key-{}",
                current.actor.uri,
                ulid::Ulid::new().to_string().to_ascii_lowercase()
            ),
            actor_id: current.actor.id.clone(),
            public_key_pem: pair.public_key_pem,
            private_key_pem: Some(pair.private_key_pem),
            algorithm: KEY_ALGORITHM.to_string(),
            created_at: Utc::now(),
            expires_at: None,
            revoked: false,
            is_active: true,
        };
        self.db.rotate_key(&key).await?;

        tracing::info!(
            username,
            old_key_id = %current.key.key_id,
            new_key_id = %key.key_id,
            "Actor key rotated"
        );
        Ok(key)
    }

    /// Revoke a key so it no longer verifies anything.
    ///
    /// The active key cannot be revoked directly; rotate first.
    pub async fn revoke_key(&self, key_id: &str) -> Result<(), AppError> {
        let key = self.db.get_key(key_id).await?.ok_or(AppError::NotFound)?;
        if key.is_active && !key.revoked {
            return Err(AppError::Validation(
                "Cannot revoke the active key; rotate it first".to_string(),
            ));
        }

        self.db.revoke_key(key_id).await?;
        tracing::warn!(key_id, "Actor key revoked");
        Ok(())
    }

    /// Map a Follow target (actor URI, profile URL or acct address) to a
    /// local username.
    ///
    /// Only URLs on this server's scheme, host and port qualify.
    pub fn local_username_for(&self, object: &str) -> Option<String> {
        let object = object.trim();

        if let Some(acct) = object
            .get(..5)
            .filter(|prefix| prefix.eq_ignore_ascii_case("acct:"))
            .map(|_| &object[5..])
        {
            let (username, domain) = acct.split_once('@')?;
            return domain
                .eq_ignore_ascii_case(&self.domain)
                .then(|| username.to_string());
        }

        let parsed = url::Url::parse(object).ok()?;
        if parsed.scheme() != self.protocol {
            return None;
        }
        if remote::authority(object)? != remote::authority(&self.base_url)? {
            return None;
        }

        let path = parsed.path().trim_end_matches('/');
        let username = path
            .strip_prefix("/users/")
            .or_else(|| path.strip_prefix("/@"))?;
        (!username.is_empty() && !username.contains('/')).then(|| username.to_string())
    }

    // =========================================================================
    // Remote actors
    // =========================================================================

    /// Resolve any actor URI to an actor record.
    ///
    /// Local URIs are answered from the database. Remote URIs come from the
    /// persisted cache while fresh, otherwise from the network.
    ///
    /// # Errors
    /// `UnreachableActor` if the fetch fails, `Validation` if the document is
    /// unusable, `Forbidden` if the host is a private address.
    pub async fn resolve_remote_actor(&self, uri: &str) -> Result<Arc<Actor>, AppError> {
        let uri = strip_fragment(uri);

        if let Some(username) = self.local_username_for(uri) {
            let actor = self
                .db
                .get_local_actor(&username)
                .await?
                .ok_or(AppError::NotFound)?;
            return Ok(Arc::new(actor));
        }

        self.remote_actors
            .try_get_with(uri.to_string(), self.load_remote_actor(uri))
            .await
            .map_err(AppError::from_shared)
    }

    /// Force a refetch of a remote actor, bypassing both cache layers.
    ///
    /// Used when a signature fails against a cached key, since the peer may
    /// have rotated it.
    pub async fn refresh_remote_actor(&self, uri: &str) -> Result<Arc<Actor>, AppError> {
        let uri = strip_fragment(uri);
        self.remote_actors.invalidate(uri).await;

        self.remote_actors
            .try_get_with(uri.to_string(), self.fetch_remote_actor(uri))
            .await
            .map_err(AppError::from_shared)
    }

    /// Resolve `user@domain` through WebFinger, then as an actor URI.
    pub async fn resolve_by_handle(
        &self,
        username: &str,
        domain: &str,
    ) -> Result<Arc<Actor>, AppError> {
        if domain.eq_ignore_ascii_case(&self.domain) {
            let actor = self
                .db
                .get_local_actor(username)
                .await?
                .ok_or(AppError::NotFound)?;
            return Ok(Arc::new(actor));
        }

        let acct = AcctResource::parse(&format!("acct:{}@{}", username, domain))?;
        let actor_uri = resolve_webfinger(
            &acct,
            &self.http_client,
            &self.protocol,
            self.allow_private_addresses,
        )
        .await?;

        tracing::debug!(handle = %format!("{}@{}", username, domain), actor_uri = %actor_uri, "WebFinger resolved");
        self.resolve_remote_actor(&actor_uri).await
    }

    async fn load_remote_actor(&self, uri: &str) -> Result<Arc<Actor>, AppError> {
        if let Some(stored) = self.db.get_actor_by_uri(uri).await? {
            if !stored.is_local && stored.fetched_at >= stale_before(self.cache_ttl) {
                return Ok(Arc::new(stored));
            }
        }

        self.fetch_remote_actor(uri).await
    }

    async fn fetch_remote_actor(&self, uri: &str) -> Result<Arc<Actor>, AppError> {
        let document =
            remote::fetch_json(&self.http_client, uri, ACTIVITY_JSON, self.allow_private_addresses)
                .await
                .inspect_err(|e| {
                    tracing::warn!(actor = %uri, error = %e, "Remote actor fetch failed");
                })?;

        let actor = parse_actor_document(&document, uri)?;
        let stored = self.db.upsert_remote_actor(&actor).await?;

        tracing::debug!(actor = %uri, key_id = %stored.public_key_id, "Remote actor cached");
        Ok(Arc::new(stored))
    }
}

fn strip_fragment(uri: &str) -> &str {
    uri.split('#').next().unwrap_or(uri)
}

fn string_field<'a>(value: &'a Value, field: &str) -> Option<&'a str> {
    value
        .get(field)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
}

/// Build an actor row from a fetched actor document.
///
/// The document must carry the requested `id` and an inbox, and its
/// `publicKey` must belong to the actor.
pub fn parse_actor_document(document: &Value, requested_uri: &str) -> Result<Actor, AppError> {
    let id = string_field(document, "id")
        .ok_or_else(|| AppError::Validation("Actor document missing id".to_string()))?;
    if id != requested_uri {
        return Err(AppError::Validation(format!(
            "Actor document id {} does not match {}",
            id, requested_uri
        )));
    }

    let public_key = document
        .get("publicKey")
        .ok_or_else(|| AppError::Validation("Actor document missing publicKey".to_string()))?;
    let public_key_pem = string_field(public_key, "publicKeyPem").ok_or_else(|| {
        AppError::Validation("Actor document missing publicKey.publicKeyPem".to_string())
    })?;
    if let Some(owner) = string_field(public_key, "owner") {
        if owner != id {
            return Err(AppError::Validation(
                "publicKey.owner does not match actor id".to_string(),
            ));
        }
    }
    let public_key_id = string_field(public_key, "id")
        .map(str::to_string)
        .unwrap_or_else(|| format!("{}#main-key", id));

    let inbox_url = string_field(document, "inbox")
        .ok_or_else(|| AppError::Validation("Actor document missing inbox".to_string()))?;

    let domain = remote::authority(id)
        .ok_or_else(|| AppError::Validation("Actor id has no host".to_string()))?;
    let username = string_field(document, "preferredUsername")
        .map(str::to_string)
        .or_else(|| {
            url::Url::parse(id)
                .ok()
                .and_then(|u| u.path_segments()?.next_back().map(str::to_string))
        })
        .filter(|name| !name.is_empty())
        .ok_or_else(|| AppError::Validation("Actor document missing username".to_string()))?;

    let shared_inbox_url = document
        .get("endpoints")
        .and_then(|endpoints| string_field(endpoints, "sharedInbox"))
        .map(str::to_string);
    let icon_url = document.get("icon").and_then(|icon| match icon {
        Value::String(url) => Some(url.clone()),
        other => string_field(other, "url").map(str::to_string),
    });

    let now = Utc::now();
    Ok(Actor {
        id: EntityId::new().0,
        uri: id.to_string(),
        username,
        domain,
        display_name: string_field(document, "name").map(str::to_string),
        summary: string_field(document, "summary").map(str::to_string),
        inbox_url: inbox_url.to_string(),
        outbox_url: string_field(document, "outbox").map(str::to_string),
        followers_url: string_field(document, "followers").map(str::to_string),
        following_url: string_field(document, "following").map(str::to_string),
        shared_inbox_url,
        public_key_id,
        public_key_pem: public_key_pem.to_string(),
        icon_url,
        is_local: false,
        fetched_at: now,
        created_at: now,
        updated_at: now,
    })
}

/// Render the ActivityPub document of a local actor
pub fn render_actor_document(local: &LocalActor) -> Value {
    let actor = &local.actor;
    let mut document = json!({
        "@context": [
            "https://www.w3.org/ns/activitystreams",
            "https://w3id.org/security/v1"
        ],
        "id": actor.uri,
        "type": "Person",
        "preferredUsername": actor.username,
        "name": actor.display_name.clone().unwrap_or_else(|| actor.username.clone()),
        "summary": actor.summary.clone().unwrap_or_default(),
        "inbox": actor.inbox_url,
        "outbox": actor.outbox_url,
        "followers": actor.followers_url,
        "following": actor.following_url,
        "manuallyApprovesFollowers": false,
        "discoverable": true,
        "published": actor.created_at.to_rfc3339(),
        "publicKey": {
            "id": local.key.key_id,
            "owner": actor.uri,
            "publicKeyPem": local.key.public_key_pem
        }
    });

    if let Some(shared_inbox) = &actor.shared_inbox_url {
        document["endpoints"] = json!({ "sharedInbox": shared_inbox });
    }
    if let Some(icon_url) = &actor.icon_url {
        document["icon"] = json!({ "type": "Image", "url": icon_url });
    }

    document
}
