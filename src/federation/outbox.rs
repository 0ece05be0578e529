//! Activity log
//!
//! Append-only record of every activity this server sent or accepted. The
//! outbox side backs the public outbox collection and object lookups; the
//! inbox side is only used to recognise replays.

use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;

use super::delivery::{DeliveryReport, DeliveryService, builder};
use crate::data::{ActivityDirection, ActivityRecord, Database, EntityId, LocalActor};
use crate::error::AppError;

/// A piece of content announced by the publishing platform
#[derive(Debug, Clone, Default)]
pub struct NewContent {
    /// HTML body
    pub content: String,
    /// Title, rendered as the Note summary
    pub title: Option<String>,
    /// Human-facing URL of the post
    pub url: Option<String>,
}

/// One page of outbox activities, newest first
#[derive(Debug, Clone)]
pub struct OutboxPage {
    pub items: Vec<Value>,
    pub total: u64,
    /// 1-based
    pub page: u32,
    pub limit: u32,
}

impl OutboxPage {
    pub fn has_next(&self) -> bool {
        u64::from(self.page) * u64::from(self.limit) < self.total
    }

    pub fn has_prev(&self) -> bool {
        self.page > 1
    }
}

pub struct OutboxLog {
    db: Arc<Database>,
    delivery: Arc<DeliveryService>,
    base_url: String,
}

impl OutboxLog {
    pub fn new(db: Arc<Database>, delivery: Arc<DeliveryService>, base_url: &str) -> Self {
        Self {
            db,
            delivery,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Append an activity built by this server, serialized as it is sent.
    ///
    /// # Returns
    /// `false` if an activity with the same id was already logged in that
    /// direction
    ///
    /// # Errors
    /// `Validation` if the activity lacks `id`, `type` or `actor`
    pub async fn append(
        &self,
        activity: &Value,
        direction: ActivityDirection,
    ) -> Result<bool, AppError> {
        let raw = serde_json::to_string(activity)
            .map_err(|e| AppError::Validation(format!("Unserializable activity: {}", e)))?;
        self.insert(activity, direction, raw).await
    }

    /// Append an inbound activity, keeping the body byte for byte.
    pub async fn append_received(&self, activity: &Value, body: &[u8]) -> Result<bool, AppError> {
        let raw = std::str::from_utf8(body)
            .map_err(|e| AppError::Validation(format!("Body is not UTF-8: {}", e)))?;
        self.insert(activity, ActivityDirection::Inbox, raw.to_string())
            .await
    }

    async fn insert(
        &self,
        activity: &Value,
        direction: ActivityDirection,
        raw: String,
    ) -> Result<bool, AppError> {
        let record = ActivityRecord::from_activity(activity, direction, raw).ok_or_else(|| {
            AppError::Validation("Activity needs id, type and actor".to_string())
        })?;

        let appended = self.db.insert_activity(&record).await?;
        if appended {
            tracing::debug!(
                activity_id = %record.activity_id,
                activity_type = %record.activity_type,
                direction = direction.as_str(),
                "Activity logged"
            );
        }
        Ok(appended)
    }

    pub async fn contains(
        &self,
        direction: ActivityDirection,
        activity_id: &str,
    ) -> Result<bool, AppError> {
        Ok(self.db.get_activity(direction, activity_id).await?.is_some())
    }

    /// Number of `Create` activities sent by `actor_uri`
    pub async fn count(&self, actor_uri: &str) -> Result<u64, AppError> {
        let count = self
            .db
            .count_activities(ActivityDirection::Outbox, Some(actor_uri), "Create")
            .await?;
        Ok(count.max(0) as u64)
    }

    /// Number of `Create` activities sent by any local actor
    pub async fn count_local_posts(&self) -> Result<u64, AppError> {
        let count = self
            .db
            .count_activities(ActivityDirection::Outbox, None, "Create")
            .await?;
        Ok(count.max(0) as u64)
    }

    /// Fetch one page of an actor's outbox; `page` is 1-based.
    ///
    /// Only `Create` activities are listed.
    pub async fn page(
        &self,
        actor_uri: &str,
        page: u32,
        limit: u32,
    ) -> Result<OutboxPage, AppError> {
        let page = page.max(1);
        let limit = limit.clamp(1, 100);
        let offset = i64::from(page - 1) * i64::from(limit);

        let records = self
            .db
            .get_activities_page(
                ActivityDirection::Outbox,
                actor_uri,
                "Create",
                i64::from(limit),
                offset,
            )
            .await?;

        let mut items = Vec::with_capacity(records.len());
        for record in records {
            match record.payload() {
                Ok(payload) => items.push(payload),
                Err(e) => {
                    tracing::error!(activity_id = %record.activity_id, error = %e, "Corrupt activity payload");
                }
            }
        }

        Ok(OutboxPage {
            items,
            total: self.count(actor_uri).await?,
            page,
            limit,
        })
    }

    /// The object carried by an outbox `Create`, by object id
    pub async fn get_object(&self, object_id: &str) -> Result<Option<Value>, AppError> {
        let object_uri = format!("{}/objects/{}", self.base_url, object_id);
        let Some(record) = self.db.find_create_for_object(&object_uri).await? else {
            return Ok(None);
        };

        let payload = record
            .payload()
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Corrupt activity payload: {}", e)))?;
        Ok(payload.get("object").cloned())
    }

    /// Announce new content to every follower of `actor`.
    ///
    /// The `Create` is logged before this returns; delivery runs in the
    /// background against the follower list as it stands when it starts.
    pub async fn publish_note(
        &self,
        actor: &LocalActor,
        content: NewContent,
    ) -> Result<(Value, JoinHandle<Result<DeliveryReport, AppError>>), AppError> {
        let published = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let note_id = format!("{}/objects/{}", self.base_url, EntityId::new().0.to_lowercase());
        let create_id = format!("{}/activities/{}", self.base_url, EntityId::new().0.to_lowercase());
        let followers = actor
            .actor
            .followers_url
            .clone()
            .unwrap_or_else(|| format!("{}/followers", actor.uri()));

        let note = builder::note(
            &note_id,
            actor.uri(),
            &followers,
            &content.content,
            content.title.as_deref(),
            content.url.as_deref(),
            &published,
        );
        let create = builder::create(&create_id, actor.uri(), note, &published);

        self.append(&create, ActivityDirection::Outbox).await?;
        tracing::info!(activity_id = %create_id, object = %note_id, "Published Create");

        let delivery = self.delivery.clone();
        let actor = actor.clone();
        let activity = create.clone();
        let handle =
            tokio::spawn(async move { delivery.deliver_to_followers(&activity, &actor).await });

        Ok((create, handle))
    }
}
