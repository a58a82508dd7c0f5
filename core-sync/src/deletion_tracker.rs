//! # Deletion Trackers
//!
//! One row per in-flight object deletion, keyed by file group:
//!
//! ```text
//! notStarted → deleting → (removed)
//!                 │
//!                 └──→ waitingForDeferredDeletion → (removed)
//! ```

use crate::directory::{from_millis, to_millis};
use crate::ids::{parse_optional, DeferredUploadId, FileGroupId, TrackerId};
use crate::{Result, SyncError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqliteConnection};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeletionStatus {
    NotStarted,
    Deleting,
    WaitingForDeferredDeletion,
}

impl DeletionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeletionStatus::NotStarted => "notStarted",
            DeletionStatus::Deleting => "deleting",
            DeletionStatus::WaitingForDeferredDeletion => "waitingForDeferredDeletion",
        }
    }
}

impl FromStr for DeletionStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "notStarted" => Ok(DeletionStatus::NotStarted),
            "deleting" => Ok(DeletionStatus::Deleting),
            "waitingForDeferredDeletion" => Ok(DeletionStatus::WaitingForDeferredDeletion),
            _ => Err(SyncError::InvalidStatus(format!("deletion status {}", s))),
        }
    }
}

/// Granularity of a deletion. Whole objects are the only kind supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeletionType {
    FileGroup,
}

impl DeletionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeletionType::FileGroup => "fileGroup",
        }
    }
}

impl FromStr for DeletionType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fileGroup" => Ok(DeletionType::FileGroup),
            _ => Err(SyncError::InvalidStatus(format!("deletion type {}", s))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionTracker {
    pub id: TrackerId,
    pub file_group_id: FileGroupId,
    pub deletion_type: DeletionType,
    pub status: DeletionStatus,
    pub deferred_upload_id: Option<DeferredUploadId>,
    pub expiry: Option<i64>,
    pub push_notification_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl DeletionTracker {
    pub fn new(
        file_group_id: FileGroupId,
        push_notification_message: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TrackerId::new(),
            file_group_id,
            deletion_type: DeletionType::FileGroup,
            status: DeletionStatus::NotStarted,
            deferred_upload_id: None,
            expiry: None,
            push_notification_message,
            created_at,
        }
    }

    pub fn is_expired(&self, now_millis: i64) -> bool {
        self.status == DeletionStatus::Deleting && self.expiry.map_or(true, |e| e <= now_millis)
    }
}

#[derive(Debug, FromRow)]
struct DeletionTrackerRow {
    id: String,
    file_group_id: String,
    deletion_type: String,
    status: String,
    deferred_upload_id: Option<String>,
    expiry: Option<i64>,
    push_notification_message: Option<String>,
    created_at: i64,
}

impl TryFrom<DeletionTrackerRow> for DeletionTracker {
    type Error = SyncError;

    fn try_from(row: DeletionTrackerRow) -> Result<Self> {
        Ok(Self {
            id: TrackerId::from_string(&row.id)?,
            file_group_id: FileGroupId::from_string(&row.file_group_id)?,
            deletion_type: row.deletion_type.parse()?,
            status: row.status.parse()?,
            deferred_upload_id: parse_optional(
                row.deferred_upload_id,
                DeferredUploadId::from_string,
            )?,
            expiry: row.expiry,
            push_notification_message: row.push_notification_message,
            created_at: from_millis(row.created_at)?,
        })
    }
}

const SELECT: &str = "SELECT id, file_group_id, deletion_type, status, deferred_upload_id, \
     expiry, push_notification_message, created_at FROM deletion_trackers";

pub(crate) async fn insert(conn: &mut SqliteConnection, tracker: &DeletionTracker) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO deletion_trackers (
            id, file_group_id, deletion_type, status, deferred_upload_id, expiry,
            push_notification_message, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(tracker.id.as_str())
    .bind(tracker.file_group_id.as_str())
    .bind(tracker.deletion_type.as_str())
    .bind(tracker.status.as_str())
    .bind(tracker.deferred_upload_id.map(|id| id.as_str()))
    .bind(tracker.expiry)
    .bind(&tracker.push_notification_message)
    .bind(to_millis(tracker.created_at))
    .execute(&mut *conn)
    .await?;

    Ok(())
}

pub(crate) async fn find(
    conn: &mut SqliteConnection,
    id: TrackerId,
) -> Result<Option<DeletionTracker>> {
    let sql = format!("{} WHERE id = ?", SELECT);
    let row = sqlx::query_as::<_, DeletionTrackerRow>(&sql)
        .bind(id.as_str())
        .fetch_optional(&mut *conn)
        .await?;

    row.map(DeletionTracker::try_from).transpose()
}

pub(crate) async fn find_for_group(
    conn: &mut SqliteConnection,
    file_group_id: FileGroupId,
) -> Result<Option<DeletionTracker>> {
    let sql = format!("{} WHERE file_group_id = ?", SELECT);
    let row = sqlx::query_as::<_, DeletionTrackerRow>(&sql)
        .bind(file_group_id.as_str())
        .fetch_optional(&mut *conn)
        .await?;

    row.map(DeletionTracker::try_from).transpose()
}

/// All deletion trackers, oldest first.
pub(crate) async fn all(conn: &mut SqliteConnection) -> Result<Vec<DeletionTracker>> {
    let sql = format!("{} ORDER BY created_at, rowid", SELECT);
    sqlx::query_as::<_, DeletionTrackerRow>(&sql)
        .fetch_all(&mut *conn)
        .await?
        .into_iter()
        .map(DeletionTracker::try_from)
        .collect()
}

pub(crate) async fn set_status(
    conn: &mut SqliteConnection,
    id: TrackerId,
    status: DeletionStatus,
    expiry: Option<i64>,
) -> Result<()> {
    sqlx::query("UPDATE deletion_trackers SET status = ?, expiry = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(expiry)
        .bind(id.as_str())
        .execute(&mut *conn)
        .await?;

    Ok(())
}

pub(crate) async fn set_waiting_for_deferred(
    conn: &mut SqliteConnection,
    id: TrackerId,
    deferred_upload_id: DeferredUploadId,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE deletion_trackers SET
            status = 'waitingForDeferredDeletion',
            expiry = NULL,
            deferred_upload_id = ?
        WHERE id = ?
        "#,
    )
    .bind(deferred_upload_id.as_str())
    .bind(id.as_str())
    .execute(&mut *conn)
    .await?;

    Ok(())
}

pub(crate) async fn delete(conn: &mut SqliteConnection, id: TrackerId) -> Result<()> {
    sqlx::query("DELETE FROM deletion_trackers WHERE id = ?")
        .bind(id.as_str())
        .execute(&mut *conn)
        .await?;

    Ok(())
}

pub(crate) async fn count_all(conn: &mut SqliteConnection) -> Result<i64> {
    let count = sqlx::query_scalar("SELECT COUNT(*) FROM deletion_trackers")
        .fetch_one(&mut *conn)
        .await?;

    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_test_pool;

    #[test]
    fn test_status_parse() {
        assert_eq!(
            "waitingForDeferredDeletion".parse::<DeletionStatus>().unwrap(),
            DeletionStatus::WaitingForDeferredDeletion
        );
        assert!(matches!(
            "gone".parse::<DeletionStatus>(),
            Err(SyncError::InvalidStatus(_))
        ));
    }

    #[test]
    fn test_expiry_only_applies_while_deleting() {
        let mut tracker = DeletionTracker::new(FileGroupId::new(), None, Utc::now());
        tracker.expiry = Some(10);
        assert!(!tracker.is_expired(20));
        tracker.status = DeletionStatus::Deleting;
        assert!(tracker.is_expired(20));
        assert!(!tracker.is_expired(5));
    }

    #[tokio::test]
    async fn test_one_tracker_per_group() {
        let pool = create_test_pool().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let group = FileGroupId::new();

        let created_at = from_millis(1_000).unwrap();
        let tracker = DeletionTracker::new(group, Some("bye".to_string()), created_at);
        insert(&mut conn, &tracker).await.unwrap();
        assert!(insert(&mut conn, &DeletionTracker::new(group, None, Utc::now()))
            .await
            .is_err());

        let deferred = DeferredUploadId::new();
        set_waiting_for_deferred(&mut conn, tracker.id, deferred).await.unwrap();
        let stored = find_for_group(&mut conn, group).await.unwrap().unwrap();
        assert_eq!(stored.status, DeletionStatus::WaitingForDeferredDeletion);
        assert_eq!(stored.deferred_upload_id, Some(deferred));
        assert_eq!(stored.push_notification_message.as_deref(), Some("bye"));

        delete(&mut conn, tracker.id).await.unwrap();
        assert!(find(&mut conn, tracker.id).await.unwrap().is_none());
        assert_eq!(count_all(&mut conn).await.unwrap(), 0);
    }
}
