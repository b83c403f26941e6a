use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use tracing::warn;

use shared::domain::{MessageId, PeerId};

/// Per-device persistence for state that outlives a session but never
/// belongs in the shared conversation history: the hidden-message overlay
/// and the cached last-seen timestamps for peers.
///
/// The message timeline itself is deliberately not cached here; it is
/// rebuilt from the durable source on every session.
#[derive(Clone)]
pub struct DeviceStore {
    pool: Pool<Sqlite>,
}

impl DeviceStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        let store = Self { pool };
        store.ensure_tables().await?;
        Ok(store)
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    async fn ensure_tables(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS hidden_messages (
                owner      TEXT NOT NULL,
                message_id TEXT NOT NULL,
                hidden_at  TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (owner, message_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure hidden_messages table exists")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS peer_activity (
                owner        TEXT NOT NULL,
                peer         TEXT NOT NULL,
                last_seen_at TEXT NOT NULL,
                PRIMARY KEY (owner, peer)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure peer_activity table exists")?;

        Ok(())
    }

    /// Loads the full hidden-id overlay for one owning identity.
    pub async fn hidden_ids(&self, owner: &PeerId) -> Result<HashSet<MessageId>> {
        let rows = sqlx::query("SELECT message_id FROM hidden_messages WHERE owner = ?1")
            .bind(owner.as_str())
            .fetch_all(&self.pool)
            .await
            .context("failed to load hidden message ids")?;

        let mut ids = HashSet::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("message_id")?;
            ids.insert(MessageId(id));
        }
        Ok(ids)
    }

    /// Appends ids to the overlay. Re-hiding an already hidden id is a
    /// no-op.
    pub async fn record_hidden(&self, owner: &PeerId, ids: &[MessageId]) -> Result<()> {
        for id in ids {
            sqlx::query("INSERT OR IGNORE INTO hidden_messages (owner, message_id) VALUES (?1, ?2)")
                .bind(owner.as_str())
                .bind(id.as_str())
                .execute(&self.pool)
                .await
                .with_context(|| format!("failed to record hidden message {id}"))?;
        }
        Ok(())
    }

    pub async fn last_seen(&self, owner: &PeerId, peer: &PeerId) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            "SELECT last_seen_at FROM peer_activity WHERE owner = ?1 AND peer = ?2",
        )
        .bind(owner.as_str())
        .bind(peer.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("failed to load cached peer activity")?;

        let Some(row) = row else {
            return Ok(None);
        };
        let raw: String = row.try_get("last_seen_at")?;
        match DateTime::parse_from_rfc3339(&raw) {
            Ok(parsed) => Ok(Some(parsed.with_timezone(&Utc))),
            Err(err) => {
                warn!(owner = %owner, peer = %peer, error = %err, "discarding unparsable cached last-seen timestamp");
                Ok(None)
            }
        }
    }

    /// Upserts the cached last-seen timestamp, keeping the newest value.
    /// RFC 3339 in UTC compares lexicographically in timestamp order, so
    /// the max can live in SQL.
    pub async fn record_last_seen(
        &self,
        owner: &PeerId,
        peer: &PeerId,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO peer_activity (owner, peer, last_seen_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(owner, peer)
            DO UPDATE SET last_seen_at = MAX(last_seen_at, excluded.last_seen_at)
            "#,
        )
        .bind(owner.as_str())
        .bind(peer.as_str())
        .bind(at.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("failed to record peer activity")?;
        Ok(())
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
