//! Follower registry
//!
//! Sole writer of follower edges. Every mutation is a single statement keyed
//! on the `(target_actor_id, follower_uri)` constraint, so concurrent
//! Follow/Undo for one pair cannot leave duplicates behind.

use chrono::Utc;
use std::sync::Arc;

use crate::data::{Database, EntityId, FollowEdge};
use crate::error::AppError;

/// Fields of a follower edge to create
#[derive(Debug, Clone)]
pub struct NewFollower {
    pub target_actor_id: String,
    pub follower_uri: String,
    pub follower_username: String,
    pub follower_domain: String,
    pub follower_inbox_url: String,
    pub follower_shared_inbox_url: Option<String>,
    pub source_activity_id: String,
}

/// One page of followers, oldest first
#[derive(Debug, Clone)]
pub struct FollowerPage {
    pub items: Vec<FollowEdge>,
    pub total: u64,
    /// 1-based
    pub page: u32,
    pub limit: u32,
}

impl FollowerPage {
    pub fn has_next(&self) -> bool {
        u64::from(self.page) * u64::from(self.limit) < self.total
    }

    pub fn has_prev(&self) -> bool {
        self.page > 1
    }
}

pub struct FollowRegistry {
    db: Arc<Database>,
}

impl FollowRegistry {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Record a follower. Idempotent on `(target, follower)`.
    ///
    /// # Returns
    /// `true` if a new edge was created, `false` if it already existed
    pub async fn add_follower(&self, follower: NewFollower) -> Result<bool, AppError> {
        let edge = FollowEdge {
            id: EntityId::new().0,
            target_actor_id: follower.target_actor_id,
            follower_uri: follower.follower_uri,
            follower_username: follower.follower_username,
            follower_domain: follower.follower_domain,
            follower_inbox_url: follower.follower_inbox_url,
            follower_shared_inbox_url: follower.follower_shared_inbox_url,
            source_activity_id: follower.source_activity_id,
            created_at: Utc::now(),
        };

        let created = self.db.insert_follower(&edge).await?;
        if created {
            crate::metrics::FOLLOWERS_TOTAL.inc();
            tracing::info!(
                target_actor = %edge.target_actor_id,
                follower = %edge.follower_uri,
                "Follower added"
            );
        } else {
            tracing::debug!(follower = %edge.follower_uri, "Follower already present");
        }
        Ok(created)
    }

    /// Remove a follower. Absent edges are a no-op, since Undo may be replayed.
    ///
    /// # Returns
    /// `true` if an edge was removed
    pub async fn remove_follower(
        &self,
        target_actor_id: &str,
        follower_uri: &str,
    ) -> Result<bool, AppError> {
        let removed = self.db.delete_follower(target_actor_id, follower_uri).await?;
        self.note_removal(removed, follower_uri);
        Ok(removed)
    }

    /// Remove the edge created by a specific Follow activity
    pub async fn remove_by_activity(
        &self,
        follower_uri: &str,
        source_activity_id: &str,
    ) -> Result<bool, AppError> {
        let removed = self
            .db
            .delete_follower_by_activity(follower_uri, source_activity_id)
            .await?;
        self.note_removal(removed, follower_uri);
        Ok(removed)
    }

    fn note_removal(&self, removed: bool, follower_uri: &str) {
        if removed {
            crate::metrics::FOLLOWERS_TOTAL.dec();
            tracing::info!(follower = %follower_uri, "Follower removed");
        } else {
            tracing::debug!(follower = %follower_uri, "No follower edge to remove");
        }
    }

    /// Delivery inboxes of a local actor's followers.
    ///
    /// Followers sharing an inbox appear once.
    pub async fn list_follower_inboxes(
        &self,
        target_actor_id: &str,
    ) -> Result<Vec<String>, AppError> {
        self.db.get_follower_inboxes(target_actor_id).await
    }

    pub async fn count_followers(&self, target_actor_id: &str) -> Result<u64, AppError> {
        Ok(self.db.count_followers(target_actor_id).await?.max(0) as u64)
    }

    /// Fetch one page of followers; `page` is 1-based.
    pub async fn page(
        &self,
        target_actor_id: &str,
        page: u32,
        limit: u32,
    ) -> Result<FollowerPage, AppError> {
        let page = page.max(1);
        let limit = limit.clamp(1, 100);
        let offset = i64::from(page - 1) * i64::from(limit);

        let items = self
            .db
            .get_followers_page(target_actor_id, i64::from(limit), offset)
            .await?;
        let total = self.count_followers(target_actor_id).await?;

        Ok(FollowerPage {
            items,
            total,
            page,
            limit,
        })
    }

    /// Seed the follower gauge from storage at startup
    pub async fn sync_metrics(&self) -> Result<(), AppError> {
        let total = self.db.count_all_followers().await?;
        crate::metrics::FOLLOWERS_TOTAL.set(total);
        Ok(())
    }
}
