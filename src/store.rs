//! Durable record of meetings the bridge believes are in progress.
//!
//! The store is the only place meeting state lives. Several bridge processes may
//! share it, so nothing here caches rows in memory.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::task::JoinHandle;

use crate::ids::{MessageId, UserId};
use crate::roomname::RoomName;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("stored meeting {room_name} is corrupt: {reason}")]
    Corrupt { room_name: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InProgressMeeting {
    pub room_name: RoomName,
    pub message_id: MessageId,
    /// Set once presence data has shown someone in the room. Never unset.
    pub confirmed: bool,
    /// Past this instant the record is treated as gone, whatever else happens.
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    pub started_by: Option<UserId>,
}

impl InProgressMeeting {
    pub fn tentative(room_name: RoomName, message_id: MessageId, started_by: UserId, ttl: Duration) -> Self {
        Self {
            room_name,
            message_id,
            confirmed: false,
            expires_at: Some(OffsetDateTime::now_utc() + ttl),
            started_by: Some(started_by),
        }
    }
}

#[async_trait]
pub trait MeetingStore: Send + Sync + 'static {
    /// Creates or replaces the record for `meeting.room_name`. Returns whether the
    /// write was acknowledged.
    async fn upsert(&self, meeting: &InProgressMeeting) -> Result<bool, StoreError>;

    /// Writes `meeting` only if no live record exists for its room. Returns
    /// false when another writer got there first.
    async fn claim(&self, meeting: &InProgressMeeting) -> Result<bool, StoreError>;

    async fn get(&self, room_name: &RoomName) -> Result<Option<InProgressMeeting>, StoreError>;

    /// Every live record, read in one statement.
    async fn get_all(&self) -> Result<Vec<InProgressMeeting>, StoreError>;

    /// Marks a live record confirmed. Returns false when there is no such record.
    async fn confirm(&self, room_name: &RoomName) -> Result<bool, StoreError>;

    /// Removes the record. Deleting a missing record is not an error.
    async fn delete(&self, room_name: &RoomName) -> Result<bool, StoreError>;

    /// Physically removes expired records, returning how many went.
    async fn purge_expired(&self) -> Result<u64, StoreError>;
}

type MeetingRow = (String, String, bool, Option<i64>, Option<String>);

const COLUMNS: &str = "room_name,message_id,confirmed,expires_at,started_by";
const LIVE: &str = "(expires_at IS NULL OR expires_at > ?)";

#[derive(Debug, Clone)]
pub struct SqliteMeetingStore {
    db_pool: SqlitePool,
}

impl SqliteMeetingStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let db_pool = SqlitePoolOptions::new()
            .max_connections(16)
            .connect_with(options)
            .await?;

        let store = Self { db_pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS in_progress (
                room_name TEXT PRIMARY KEY NOT NULL,
                message_id TEXT NOT NULL,
                confirmed INTEGER NOT NULL DEFAULT 0,
                expires_at INTEGER,
                started_by TEXT
            )",
        )
        .execute(&self.db_pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS in_progress_expires_at ON in_progress (expires_at)")
            .execute(&self.db_pool)
            .await?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn in_memory() -> Self {
        let db_pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = Self { db_pool };
        store.migrate().await.unwrap();
        store
    }
}

fn now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

fn from_row((room_name, message_id, confirmed, expires_at, started_by): MeetingRow) -> Result<InProgressMeeting, StoreError> {
    let corrupt = |reason: String| StoreError::Corrupt { room_name: room_name.clone(), reason };

    let message_id = message_id.parse::<MessageId>().map_err(|e| corrupt(format!("{e}")))?;
    let expires_at = expires_at
        .map(OffsetDateTime::from_unix_timestamp)
        .transpose()
        .map_err(|e| corrupt(format!("{e}")))?;
    let started_by = started_by
        .map(|user| user.parse::<UserId>())
        .transpose()
        .map_err(|e| corrupt(format!("{e}")))?;

    Ok(InProgressMeeting {
        room_name: RoomName::from(room_name),
        message_id,
        confirmed,
        expires_at,
        started_by,
    })
}

#[async_trait]
impl MeetingStore for SqliteMeetingStore {
    async fn upsert(&self, meeting: &InProgressMeeting) -> Result<bool, StoreError> {
        // an expired row may still be physically present; its flag must not leak
        // into the meeting replacing it
        let result = sqlx::query(
            "INSERT INTO in_progress (room_name,message_id,confirmed,expires_at,started_by) VALUES (?,?,?,?,?)
            ON CONFLICT(room_name) DO UPDATE SET
                message_id=excluded.message_id,
                confirmed=CASE
                    WHEN in_progress.expires_at IS NOT NULL AND in_progress.expires_at <= ? THEN excluded.confirmed
                    ELSE MAX(in_progress.confirmed, excluded.confirmed)
                END,
                expires_at=excluded.expires_at,
                started_by=excluded.started_by",
        )
        .bind(meeting.room_name.as_str())
        .bind(meeting.message_id.to_string())
        .bind(meeting.confirmed)
        .bind(meeting.expires_at.map(OffsetDateTime::unix_timestamp))
        .bind(meeting.started_by.map(|user| user.to_string()))
        .bind(now())
        .execute(&self.db_pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn claim(&self, meeting: &InProgressMeeting) -> Result<bool, StoreError> {
        // an expired row counts as free and is replaced whole
        let result = sqlx::query(
            "INSERT INTO in_progress (room_name,message_id,confirmed,expires_at,started_by) VALUES (?,?,?,?,?)
            ON CONFLICT(room_name) DO UPDATE SET
                message_id=excluded.message_id,
                confirmed=excluded.confirmed,
                expires_at=excluded.expires_at,
                started_by=excluded.started_by
            WHERE in_progress.expires_at IS NOT NULL AND in_progress.expires_at <= ?",
        )
        .bind(meeting.room_name.as_str())
        .bind(meeting.message_id.to_string())
        .bind(meeting.confirmed)
        .bind(meeting.expires_at.map(OffsetDateTime::unix_timestamp))
        .bind(meeting.started_by.map(|user| user.to_string()))
        .bind(now())
        .execute(&self.db_pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, room_name: &RoomName) -> Result<Option<InProgressMeeting>, StoreError> {
        let row: Option<MeetingRow> =
            sqlx::query_as(&format!("SELECT {COLUMNS} FROM in_progress WHERE room_name=? AND {LIVE}"))
                .bind(room_name.as_str())
                .bind(now())
                .fetch_optional(&self.db_pool)
                .await?;

        row.map(from_row).transpose()
    }

    async fn get_all(&self) -> Result<Vec<InProgressMeeting>, StoreError> {
        let rows: Vec<MeetingRow> =
            sqlx::query_as(&format!("SELECT {COLUMNS} FROM in_progress WHERE {LIVE} ORDER BY room_name"))
                .bind(now())
                .fetch_all(&self.db_pool)
                .await?;

        let mut meetings = Vec::with_capacity(rows.len());
        for row in rows {
            match from_row(row) {
                Ok(meeting) => meetings.push(meeting),
                Err(err) => tracing::error!(error = %err, "skipping unreadable in-progress record"),
            }
        }
        Ok(meetings)
    }

    async fn confirm(&self, room_name: &RoomName) -> Result<bool, StoreError> {
        let result = sqlx::query(&format!("UPDATE in_progress SET confirmed=1 WHERE room_name=? AND {LIVE}"))
            .bind(room_name.as_str())
            .bind(now())
            .execute(&self.db_pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, room_name: &RoomName) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM in_progress WHERE room_name=?")
            .bind(room_name.as_str())
            .execute(&self.db_pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM in_progress WHERE expires_at IS NOT NULL AND expires_at <= ?")
            .bind(now())
            .execute(&self.db_pool)
            .await?;

        Ok(result.rows_affected())
    }
}

/// Periodically drops expired records so abandoned meetings do not pile up.
pub fn spawn_janitor(store: Arc<dyn MeetingStore>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            match store.purge_expired().await {
                Ok(0) => {}
                Ok(purged) => tracing::info!(purged, "purged expired in-progress meetings"),
                Err(err) => tracing::warn!(error = %err, "failed to purge expired in-progress meetings"),
            }
        }
    })
}
