//! SQLite database operations
//!
//! All database access goes through this module.
//! Uniqueness is enforced by table constraints; writers rely on
//! `ON CONFLICT` rather than read-then-write checks.

use chrono::{DateTime, Utc};
use sqlx::{Pool, Sqlite, SqlitePool};
use std::path::Path;

use super::models::*;
use crate::error::AppError;

/// Database connection pool wrapper.
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Connect to SQLite database
    ///
    /// Creates the database file if it doesn't exist.
    /// Runs pending migrations automatically.
    ///
    /// # Errors
    /// Returns error if connection or migration fails
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        let connection_string = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&connection_string).await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                AppError::Internal(anyhow::anyhow!("Migration failed: {}", e))
            })?;

        tracing::info!("Database connected and migrated successfully");

        Ok(Self { pool })
    }

    /// Close the pool, waiting for in-flight queries.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    // =========================================================================
    // Actors
    // =========================================================================

    /// Get a local actor by username
    pub async fn get_local_actor(&self, username: &str) -> Result<Option<Actor>, AppError> {
        let actor = sqlx::query_as::<_, Actor>(
            "SELECT * FROM actors WHERE is_local = 1 AND username = ? LIMIT 1",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;

        Ok(actor)
    }

    /// Get any actor by its ActivityPub id
    pub async fn get_actor_by_uri(&self, uri: &str) -> Result<Option<Actor>, AppError> {
        let actor = sqlx::query_as::<_, Actor>("SELECT * FROM actors WHERE uri = ?")
            .bind(uri)
            .fetch_optional(&self.pool)
            .await?;

        Ok(actor)
    }

    /// Count local actors
    pub async fn count_local_actors(&self) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM actors WHERE is_local = 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Insert a local actor and its first key, unless the username is taken.
    ///
    /// The `(username, domain)` constraint decides the race between concurrent
    /// bootstraps; the key is only written by the winner.
    ///
    /// # Returns
    /// `true` if inserted, `false` if the actor already existed.
    pub async fn insert_local_actor_if_absent(
        &self,
        actor: &Actor,
        key: &KeyRecord,
    ) -> Result<bool, AppError> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO actors (
                id, uri, username, domain, display_name, summary, inbox_url, outbox_url,
                followers_url, following_url, shared_inbox_url, public_key_id, public_key_pem,
                icon_url, is_local, fetched_at, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&actor.id)
        .bind(&actor.uri)
        .bind(&actor.username)
        .bind(&actor.domain)
        .bind(&actor.display_name)
        .bind(&actor.summary)
        .bind(&actor.inbox_url)
        .bind(&actor.outbox_url)
        .bind(&actor.followers_url)
        .bind(&actor.following_url)
        .bind(&actor.shared_inbox_url)
        .bind(&actor.public_key_id)
        .bind(&actor.public_key_pem)
        .bind(&actor.icon_url)
        .bind(actor.fetched_at)
        .bind(actor.created_at)
        .bind(actor.updated_at)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        if inserted {
            insert_key(&mut tx, key).await?;
        }

        tx.commit().await?;
        Ok(inserted)
    }

    /// Update display fields of a local actor.
    pub async fn update_local_profile(
        &self,
        actor_id: &str,
        display_name: &str,
        summary: &str,
        icon_url: Option<&str>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE actors
            SET display_name = ?, summary = ?, icon_url = ?, updated_at = ?
            WHERE id = ? AND is_local = 1
              AND (display_name IS NOT ? OR summary IS NOT ? OR icon_url IS NOT ?)
            "#,
        )
        .bind(display_name)
        .bind(summary)
        .bind(icon_url)
        .bind(Utc::now())
        .bind(actor_id)
        .bind(display_name)
        .bind(summary)
        .bind(icon_url)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Insert or refresh a cached remote actor, keyed on its URI.
    ///
    /// The internal id and `created_at` of an existing row are kept.
    pub async fn upsert_remote_actor(&self, actor: &Actor) -> Result<Actor, AppError> {
        let stored = sqlx::query_as::<_, Actor>(
            r#"
            INSERT INTO actors (
                id, uri, username, domain, display_name, summary, inbox_url, outbox_url,
                followers_url, following_url, shared_inbox_url, public_key_id, public_key_pem,
                icon_url, is_local, fetched_at, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?)
            ON CONFLICT(uri) DO UPDATE SET
                username = excluded.username,
                domain = excluded.domain,
                display_name = excluded.display_name,
                summary = excluded.summary,
                inbox_url = excluded.inbox_url,
                outbox_url = excluded.outbox_url,
                followers_url = excluded.followers_url,
                following_url = excluded.following_url,
                shared_inbox_url = excluded.shared_inbox_url,
                public_key_id = excluded.public_key_id,
                public_key_pem = excluded.public_key_pem,
                icon_url = excluded.icon_url,
                fetched_at = excluded.fetched_at,
                updated_at = excluded.updated_at
            WHERE actors.is_local = 0
            RETURNING *
            "#,
        )
        .bind(&actor.id)
        .bind(&actor.uri)
        .bind(&actor.username)
        .bind(&actor.domain)
        .bind(&actor.display_name)
        .bind(&actor.summary)
        .bind(&actor.inbox_url)
        .bind(&actor.outbox_url)
        .bind(&actor.followers_url)
        .bind(&actor.following_url)
        .bind(&actor.shared_inbox_url)
        .bind(&actor.public_key_id)
        .bind(&actor.public_key_pem)
        .bind(&actor.icon_url)
        .bind(actor.fetched_at)
        .bind(actor.created_at)
        .bind(actor.updated_at)
        .fetch_optional(&self.pool)
        .await?;

        stored.ok_or_else(|| {
            AppError::Validation(format!(
                "Remote actor {} collides with a local actor",
                actor.uri
            ))
        })
    }

    // =========================================================================
    // Keys
    // =========================================================================

    /// Get a key record by keyId
    pub async fn get_key(&self, key_id: &str) -> Result<Option<KeyRecord>, AppError> {
        let key = sqlx::query_as::<_, KeyRecord>("SELECT * FROM actor_keys WHERE key_id = ?")
            .bind(key_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(key)
    }

    /// Get the key an actor currently signs with
    pub async fn get_active_key(&self, actor_id: &str) -> Result<Option<KeyRecord>, AppError> {
        let key = sqlx::query_as::<_, KeyRecord>(
            r#"
            SELECT * FROM actor_keys
            WHERE actor_id = ? AND is_active = 1 AND revoked = 0
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(actor_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(key)
    }

    /// Replace the active key of an actor.
    ///
    /// Previous keys are deactivated, never deleted, and the actor row is
    /// pointed at the new public key in the same transaction.
    pub async fn rotate_key(&self, key: &KeyRecord) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE actor_keys SET is_active = 0 WHERE actor_id = ? AND is_active = 1")
            .bind(&key.actor_id)
            .execute(&mut *tx)
            .await?;

        insert_key(&mut tx, key).await?;

        sqlx::query(
            "UPDATE actors SET public_key_id = ?, public_key_pem = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&key.key_id)
        .bind(&key.public_key_pem)
        .bind(Utc::now())
        .bind(&key.actor_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Mark a key as revoked
    pub async fn revoke_key(&self, key_id: &str) -> Result<bool, AppError> {
        let result = sqlx::query("UPDATE actor_keys SET revoked = 1 WHERE key_id = ?")
            .bind(key_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Followers
    // =========================================================================

    /// Insert a follower edge unless one already exists for the pair.
    ///
    /// # Returns
    /// `true` if a new edge was created
    pub async fn insert_follower(&self, edge: &FollowEdge) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO follows (
                id, target_actor_id, follower_uri, follower_username, follower_domain,
                follower_inbox_url, follower_shared_inbox_url, source_activity_id, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(target_actor_id, follower_uri) DO NOTHING
            "#,
        )
        .bind(&edge.id)
        .bind(&edge.target_actor_id)
        .bind(&edge.follower_uri)
        .bind(&edge.follower_username)
        .bind(&edge.follower_domain)
        .bind(&edge.follower_inbox_url)
        .bind(&edge.follower_shared_inbox_url)
        .bind(&edge.source_activity_id)
        .bind(edge.created_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Delete the edge for a `(target, follower)` pair
    pub async fn delete_follower(
        &self,
        target_actor_id: &str,
        follower_uri: &str,
    ) -> Result<bool, AppError> {
        let result =
            sqlx::query("DELETE FROM follows WHERE target_actor_id = ? AND follower_uri = ?")
                .bind(target_actor_id)
                .bind(follower_uri)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete the edge created by a given Follow activity
    pub async fn delete_follower_by_activity(
        &self,
        follower_uri: &str,
        source_activity_id: &str,
    ) -> Result<bool, AppError> {
        let result =
            sqlx::query("DELETE FROM follows WHERE follower_uri = ? AND source_activity_id = ?")
                .bind(follower_uri)
                .bind(source_activity_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Distinct delivery inboxes of a local actor's followers.
    ///
    /// A shared inbox stands in for every follower that advertises it.
    pub async fn get_follower_inboxes(
        &self,
        target_actor_id: &str,
    ) -> Result<Vec<String>, AppError> {
        let inboxes = sqlx::query_scalar::<_, String>(
            r#"
            SELECT COALESCE(follower_shared_inbox_url, follower_inbox_url) AS inbox
            FROM follows
            WHERE target_actor_id = ?
            GROUP BY inbox
            ORDER BY MIN(created_at) ASC
            "#,
        )
        .bind(target_actor_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(inboxes)
    }

    /// Count followers of a local actor
    pub async fn count_followers(&self, target_actor_id: &str) -> Result<i64, AppError> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM follows WHERE target_actor_id = ?")
                .bind(target_actor_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// Count every follower edge
    pub async fn count_all_followers(&self) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM follows")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Page through followers, oldest first
    pub async fn get_followers_page(
        &self,
        target_actor_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<FollowEdge>, AppError> {
        let edges = sqlx::query_as::<_, FollowEdge>(
            r#"
            SELECT * FROM follows
            WHERE target_actor_id = ?
            ORDER BY created_at ASC, id ASC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(target_actor_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(edges)
    }

    // =========================================================================
    // Activities
    // =========================================================================

    /// Append an activity unless its id was already logged in that direction.
    ///
    /// # Returns
    /// `true` if the record was appended
    pub async fn insert_activity(&self, record: &ActivityRecord) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO activities (
                id, activity_id, direction, activity_type, actor_uri, object_ref,
                published_at, raw_payload
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(direction, activity_id) DO NOTHING
            "#,
        )
        .bind(&record.id)
        .bind(&record.activity_id)
        .bind(&record.direction)
        .bind(&record.activity_type)
        .bind(&record.actor_uri)
        .bind(&record.object_ref)
        .bind(record.published_at)
        .bind(&record.raw_payload)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Get an activity by id and direction
    pub async fn get_activity(
        &self,
        direction: ActivityDirection,
        activity_id: &str,
    ) -> Result<Option<ActivityRecord>, AppError> {
        let record = sqlx::query_as::<_, ActivityRecord>(
            "SELECT * FROM activities WHERE direction = ? AND activity_id = ?",
        )
        .bind(direction.as_str())
        .bind(activity_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    /// Count activities of one type by one actor
    pub async fn count_activities(
        &self,
        direction: ActivityDirection,
        actor_uri: Option<&str>,
        activity_type: &str,
    ) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM activities
            WHERE direction = ? AND activity_type = ? AND (? IS NULL OR actor_uri = ?)
            "#,
        )
        .bind(direction.as_str())
        .bind(activity_type)
        .bind(actor_uri)
        .bind(actor_uri)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Page through activities of one type by one actor, newest first
    pub async fn get_activities_page(
        &self,
        direction: ActivityDirection,
        actor_uri: &str,
        activity_type: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ActivityRecord>, AppError> {
        let records = sqlx::query_as::<_, ActivityRecord>(
            r#"
            SELECT * FROM activities
            WHERE direction = ? AND actor_uri = ? AND activity_type = ?
            ORDER BY published_at DESC, id DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(direction.as_str())
        .bind(actor_uri)
        .bind(activity_type)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    /// Find the outbox Create that carried a given object
    pub async fn find_create_for_object(
        &self,
        object_uri: &str,
    ) -> Result<Option<ActivityRecord>, AppError> {
        let record = sqlx::query_as::<_, ActivityRecord>(
            r#"
            SELECT * FROM activities
            WHERE direction = 'outbox' AND activity_type = 'Create' AND object_ref = ?
            ORDER BY published_at DESC
            LIMIT 1
            "#,
        )
        .bind(object_uri)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    // =========================================================================
    // Delivery failures
    // =========================================================================

    /// Record a dropped delivery
    pub async fn insert_delivery_failure(&self, failure: &DeliveryFailure) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO delivery_failures (id, inbox_url, activity_id, attempts, last_error, failed_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&failure.id)
        .bind(&failure.inbox_url)
        .bind(&failure.activity_id)
        .bind(failure.attempts)
        .bind(&failure.last_error)
        .bind(failure.failed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent dropped deliveries
    pub async fn get_delivery_failures(
        &self,
        limit: i64,
    ) -> Result<Vec<DeliveryFailure>, AppError> {
        let failures = sqlx::query_as::<_, DeliveryFailure>(
            "SELECT * FROM delivery_failures ORDER BY failed_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(failures)
    }
}

async fn insert_key(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    key: &KeyRecord,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        INSERT INTO actor_keys (
            key_id, actor_id, public_key_pem, private_key_pem, algorithm,
            created_at, expires_at, revoked, is_active
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&key.key_id)
    .bind(&key.actor_id)
    .bind(&key.public_key_pem)
    .bind(&key.private_key_pem)
    .bind(&key.algorithm)
    .bind(key.created_at)
    .bind(key.expires_at)
    .bind(key.revoked)
    .bind(key.is_active)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Timestamp `ttl` ago, used for freshness checks on cached rows.
pub fn stale_before(ttl: std::time::Duration) -> DateTime<Utc> {
    Utc::now() - chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(1))
}
