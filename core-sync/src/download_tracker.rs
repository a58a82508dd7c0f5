//! # Download Trackers
//!
//! Persisted state for object downloads, mirroring the upload trackers:
//! `notStarted → downloading → downloaded`. A stalled `downloading` file is
//! reset to `notStarted` rather than retried in place.

use crate::directory::{from_millis, to_millis};
use crate::ids::{FileGroupId, FileUuid, TrackerId};
use crate::{Result, SyncError};
use bridge_traits::server::GoneReason;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqliteConnection};
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DownloadStatus {
    NotStarted,
    Downloading,
    Downloaded,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::NotStarted => "notStarted",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Downloaded => "downloaded",
        }
    }
}

impl FromStr for DownloadStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "notStarted" => Ok(DownloadStatus::NotStarted),
            "downloading" => Ok(DownloadStatus::Downloading),
            "downloaded" => Ok(DownloadStatus::Downloaded),
            _ => Err(SyncError::InvalidStatus(format!("download status {}", s))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadObjectTracker {
    pub id: TrackerId,
    pub file_group_id: FileGroupId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadFileTracker {
    pub id: TrackerId,
    pub object_tracker_id: TrackerId,
    pub file_uuid: FileUuid,
    pub file_version: i64,
    pub status: DownloadStatus,
    pub expiry: Option<i64>,
    /// Set once downloaded.
    pub local_path: Option<PathBuf>,
    pub app_meta_data: Option<String>,
    /// Set when the server reported the content as gone.
    pub gone_reason: Option<GoneReason>,
}

impl DownloadFileTracker {
    pub fn is_expired(&self, now_millis: i64) -> bool {
        self.status == DownloadStatus::Downloading && self.expiry.map_or(true, |e| e <= now_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadObject {
    pub tracker: DownloadObjectTracker,
    pub files: Vec<DownloadFileTracker>,
}

impl DownloadObject {
    pub fn is_queued(&self) -> bool {
        self.files.iter().all(|f| f.status == DownloadStatus::NotStarted)
    }

    pub fn all_downloaded(&self) -> bool {
        !self.files.is_empty() && self.files.iter().all(|f| f.status == DownloadStatus::Downloaded)
    }

    pub fn is_in_progress(&self) -> bool {
        !self.is_queued() && !self.all_downloaded()
    }
}

// ============================================================================
// Persistence
// ============================================================================

#[derive(Debug, FromRow)]
struct DownloadObjectRow {
    id: String,
    file_group_id: String,
    created_at: i64,
}

#[derive(Debug, FromRow)]
struct DownloadFileRow {
    id: String,
    object_tracker_id: String,
    file_uuid: String,
    file_version: i64,
    status: String,
    expiry: Option<i64>,
    local_path: Option<String>,
    app_meta_data: Option<String>,
    gone_reason: Option<String>,
}

impl TryFrom<DownloadObjectRow> for DownloadObjectTracker {
    type Error = SyncError;

    fn try_from(row: DownloadObjectRow) -> Result<Self> {
        Ok(Self {
            id: TrackerId::from_string(&row.id)?,
            file_group_id: FileGroupId::from_string(&row.file_group_id)?,
            created_at: from_millis(row.created_at)?,
        })
    }
}

impl TryFrom<DownloadFileRow> for DownloadFileTracker {
    type Error = SyncError;

    fn try_from(row: DownloadFileRow) -> Result<Self> {
        let gone_reason = row
            .gone_reason
            .map(|reason| {
                GoneReason::parse(&reason)
                    .ok_or_else(|| SyncError::InvalidStatus(format!("gone reason {}", reason)))
            })
            .transpose()?;

        Ok(Self {
            id: TrackerId::from_string(&row.id)?,
            object_tracker_id: TrackerId::from_string(&row.object_tracker_id)?,
            file_uuid: FileUuid::from_string(&row.file_uuid)?,
            file_version: row.file_version,
            status: row.status.parse()?,
            expiry: row.expiry,
            local_path: row.local_path.map(PathBuf::from),
            app_meta_data: row.app_meta_data,
            gone_reason,
        })
    }
}

const FILE_SELECT: &str = "SELECT id, object_tracker_id, file_uuid, file_version, status, expiry, \
     local_path, app_meta_data, gone_reason FROM download_files";

pub(crate) async fn insert_object(
    conn: &mut SqliteConnection,
    object: &DownloadObject,
) -> Result<()> {
    sqlx::query("INSERT INTO download_objects (id, file_group_id, created_at) VALUES (?, ?, ?)")
        .bind(object.tracker.id.as_str())
        .bind(object.tracker.file_group_id.as_str())
        .bind(to_millis(object.tracker.created_at))
        .execute(&mut *conn)
        .await?;

    for file in &object.files {
        sqlx::query(
            r#"
            INSERT INTO download_files (
                id, object_tracker_id, file_uuid, file_version, status, expiry,
                local_path, app_meta_data, gone_reason
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(file.id.as_str())
        .bind(object.tracker.id.as_str())
        .bind(file.file_uuid.as_str())
        .bind(file.file_version)
        .bind(file.status.as_str())
        .bind(file.expiry)
        .bind(file.local_path.as_ref().map(|p| p.to_string_lossy().into_owned()))
        .bind(&file.app_meta_data)
        .bind(file.gone_reason.map(|r| r.as_str()))
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

async fn load_files(
    conn: &mut SqliteConnection,
    tracker: DownloadObjectTracker,
) -> Result<DownloadObject> {
    let sql = format!("{} WHERE object_tracker_id = ? ORDER BY rowid", FILE_SELECT);
    let files = sqlx::query_as::<_, DownloadFileRow>(&sql)
        .bind(tracker.id.as_str())
        .fetch_all(&mut *conn)
        .await?
        .into_iter()
        .map(DownloadFileTracker::try_from)
        .collect::<Result<Vec<_>>>()?;

    Ok(DownloadObject { tracker, files })
}

pub(crate) async fn find_object(
    conn: &mut SqliteConnection,
    id: TrackerId,
) -> Result<Option<DownloadObject>> {
    let row = sqlx::query_as::<_, DownloadObjectRow>(
        "SELECT id, file_group_id, created_at FROM download_objects WHERE id = ?",
    )
    .bind(id.as_str())
    .fetch_optional(&mut *conn)
    .await?;

    match row {
        Some(row) => Ok(Some(load_files(conn, row.try_into()?).await?)),
        None => Ok(None),
    }
}

/// All download objects, oldest first.
pub(crate) async fn all_objects(conn: &mut SqliteConnection) -> Result<Vec<DownloadObject>> {
    let rows = sqlx::query_as::<_, DownloadObjectRow>(
        "SELECT id, file_group_id, created_at FROM download_objects ORDER BY created_at, rowid",
    )
    .fetch_all(&mut *conn)
    .await?;

    let mut objects = Vec::with_capacity(rows.len());
    for row in rows {
        objects.push(load_files(conn, row.try_into()?).await?);
    }
    Ok(objects)
}

pub(crate) async fn find_file(
    conn: &mut SqliteConnection,
    id: TrackerId,
) -> Result<Option<DownloadFileTracker>> {
    let sql = format!("{} WHERE id = ?", FILE_SELECT);
    let row = sqlx::query_as::<_, DownloadFileRow>(&sql)
        .bind(id.as_str())
        .fetch_optional(&mut *conn)
        .await?;

    row.map(DownloadFileTracker::try_from).transpose()
}

pub(crate) async fn set_file_status(
    conn: &mut SqliteConnection,
    id: TrackerId,
    status: DownloadStatus,
    expiry: Option<i64>,
) -> Result<()> {
    sqlx::query("UPDATE download_files SET status = ?, expiry = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(expiry)
        .bind(id.as_str())
        .execute(&mut *conn)
        .await?;

    Ok(())
}

pub(crate) async fn mark_file_downloaded(
    conn: &mut SqliteConnection,
    id: TrackerId,
    file_version: i64,
    local_path: &std::path::Path,
    app_meta_data: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE download_files SET
            status = 'downloaded',
            expiry = NULL,
            file_version = ?,
            local_path = ?,
            app_meta_data = ?
        WHERE id = ?
        "#,
    )
    .bind(file_version)
    .bind(local_path.to_string_lossy().into_owned())
    .bind(app_meta_data)
    .bind(id.as_str())
    .execute(&mut *conn)
    .await?;

    Ok(())
}

pub(crate) async fn mark_file_gone(
    conn: &mut SqliteConnection,
    id: TrackerId,
    reason: GoneReason,
) -> Result<()> {
    sqlx::query(
        "UPDATE download_files SET status = 'downloaded', expiry = NULL, gone_reason = ? \
         WHERE id = ?",
    )
    .bind(reason.as_str())
    .bind(id.as_str())
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Move every stalled `downloading` file back to `notStarted`. Returns the
/// number of files reset.
pub(crate) async fn reset_expired(conn: &mut SqliteConnection, now_millis: i64) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE download_files SET status = 'notStarted', expiry = NULL
        WHERE status = 'downloading' AND (expiry IS NULL OR expiry <= ?)
        "#,
    )
    .bind(now_millis)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected())
}

pub(crate) async fn delete_object(conn: &mut SqliteConnection, id: TrackerId) -> Result<()> {
    sqlx::query("DELETE FROM download_objects WHERE id = ?")
        .bind(id.as_str())
        .execute(&mut *conn)
        .await?;

    Ok(())
}

pub(crate) async fn delete_for_group(
    conn: &mut SqliteConnection,
    file_group_id: FileGroupId,
) -> Result<u64> {
    let result = sqlx::query("DELETE FROM download_objects WHERE file_group_id = ?")
        .bind(file_group_id.as_str())
        .execute(&mut *conn)
        .await?;

    Ok(result.rows_affected())
}

pub(crate) async fn count_for_group(
    conn: &mut SqliteConnection,
    file_group_id: FileGroupId,
) -> Result<i64> {
    let count = sqlx::query_scalar("SELECT COUNT(*) FROM download_objects WHERE file_group_id = ?")
        .bind(file_group_id.as_str())
        .fetch_one(&mut *conn)
        .await?;

    Ok(count)
}

pub(crate) async fn count_all(conn: &mut SqliteConnection) -> Result<i64> {
    let count = sqlx::query_scalar("SELECT COUNT(*) FROM download_objects")
        .fetch_one(&mut *conn)
        .await?;

    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_test_pool;

    fn object(file_count: usize) -> DownloadObject {
        let tracker = DownloadObjectTracker {
            id: TrackerId::new(),
            file_group_id: FileGroupId::new(),
            created_at: from_millis(1_700_000_000_000).unwrap(),
        };
        let files = (0..file_count)
            .map(|_| DownloadFileTracker {
                id: TrackerId::new(),
                object_tracker_id: tracker.id,
                file_uuid: FileUuid::new(),
                file_version: 1,
                status: DownloadStatus::NotStarted,
                expiry: None,
                local_path: None,
                app_meta_data: None,
                gone_reason: None,
            })
            .collect();
        DownloadObject { tracker, files }
    }

    #[tokio::test]
    async fn test_download_lifecycle() {
        let pool = create_test_pool().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let object = object(2);
        insert_object(&mut conn, &object).await.unwrap();

        let (first, second) = (object.files[0].id, object.files[1].id);
        mark_file_downloaded(&mut conn, first, 2, std::path::Path::new("/tmp/a"), Some("meta"))
            .await
            .unwrap();
        mark_file_gone(&mut conn, second, GoneReason::UserRemoved).await.unwrap();

        let stored = find_object(&mut conn, object.tracker.id).await.unwrap().unwrap();
        assert!(stored.all_downloaded());
        assert_eq!(stored.files[0].file_version, 2);
        assert_eq!(stored.files[0].app_meta_data.as_deref(), Some("meta"));
        assert_eq!(stored.files[1].gone_reason, Some(GoneReason::UserRemoved));

        assert_eq!(delete_for_group(&mut conn, object.tracker.file_group_id).await.unwrap(), 1);
        assert!(find_file(&mut conn, first).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reset_expired_only_touches_stalled_files() {
        let pool = create_test_pool().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let object = object(2);
        insert_object(&mut conn, &object).await.unwrap();

        set_file_status(&mut conn, object.files[0].id, DownloadStatus::Downloading, Some(100))
            .await
            .unwrap();
        set_file_status(&mut conn, object.files[1].id, DownloadStatus::Downloading, Some(500))
            .await
            .unwrap();

        assert_eq!(reset_expired(&mut conn, 200).await.unwrap(), 1);

        let stored = find_object(&mut conn, object.tracker.id).await.unwrap().unwrap();
        assert_eq!(stored.files[0].status, DownloadStatus::NotStarted);
        assert_eq!(stored.files[0].expiry, None);
        assert_eq!(stored.files[1].status, DownloadStatus::Downloading);
        assert!(stored.is_in_progress());
    }
}
