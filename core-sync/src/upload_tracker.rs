//! # Upload Trackers
//!
//! Persisted state for upload batches. One object tracker per batch, one file
//! tracker per file in the batch.
//!
//! ## State Machine
//!
//! ```text
//! notStarted → uploading → uploaded
//!                  ↑   │
//!                  └───┘  (expiry passed: retried)
//! ```
//!
//! An object tracker is *queued* while every file is `notStarted`, *in
//! progress* while some file has started and not all have finished, and
//! *awaiting deferral* when every file is `uploaded` but the server has not
//! yet committed a later-version batch.

use crate::directory::{from_millis, to_millis};
use crate::ids::{
    parse_optional, BatchId, DeferredUploadId, FileGroupId, FileUuid, SharingGroupId, TrackerId,
};
use crate::{Result, SyncError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqliteConnection};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UploadStatus {
    NotStarted,
    Uploading,
    Uploaded,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::NotStarted => "notStarted",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Uploaded => "uploaded",
        }
    }
}

impl FromStr for UploadStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "notStarted" => Ok(UploadStatus::NotStarted),
            "uploading" => Ok(UploadStatus::Uploading),
            "uploaded" => Ok(UploadStatus::Uploaded),
            _ => Err(SyncError::InvalidStatus(format!("upload status {}", s))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadObjectTracker {
    pub id: TrackerId,
    pub file_group_id: FileGroupId,
    pub sharing_group_id: SharingGroupId,
    pub batch_uuid: BatchId,
    pub batch_expiry_interval: Duration,
    /// Decided when the batch is queued and never changed. `None` only if the
    /// row was written by something other than the engine.
    pub v0_upload: Option<bool>,
    pub deferred_upload_id: Option<DeferredUploadId>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFileTracker {
    pub id: TrackerId,
    pub object_tracker_id: TrackerId,
    pub file_uuid: FileUuid,
    pub status: UploadStatus,
    pub checksum: String,
    pub local_path: PathBuf,
    pub mime_type: String,
    pub app_meta_data: Option<String>,
    /// Unix millis after which an `uploading` file is considered stalled.
    pub expiry: Option<i64>,
    pub upload_index: u32,
    pub upload_count: u32,
    pub inform_all_but_self: bool,
    /// Version the server reported for this upload.
    pub uploaded_version: Option<i64>,
}

impl UploadFileTracker {
    pub fn is_expired(&self, now_millis: i64) -> bool {
        self.status == UploadStatus::Uploading && self.expiry.map_or(true, |e| e <= now_millis)
    }
}

/// An object tracker together with its file trackers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadObject {
    pub tracker: UploadObjectTracker,
    pub files: Vec<UploadFileTracker>,
}

impl UploadObject {
    pub fn is_queued(&self) -> bool {
        self.files.iter().all(|f| f.status == UploadStatus::NotStarted)
    }

    pub fn all_uploaded(&self) -> bool {
        !self.files.is_empty() && self.files.iter().all(|f| f.status == UploadStatus::Uploaded)
    }

    pub fn is_in_progress(&self) -> bool {
        !self.is_queued() && !self.all_uploaded()
    }

    pub fn expired_files(&self, now_millis: i64) -> Vec<&UploadFileTracker> {
        self.files.iter().filter(|f| f.is_expired(now_millis)).collect()
    }
}

// ============================================================================
// Persistence
// ============================================================================

#[derive(Debug, FromRow)]
struct UploadObjectRow {
    id: String,
    file_group_id: String,
    sharing_group_id: String,
    batch_uuid: String,
    batch_expiry_interval_ms: i64,
    v0_upload: Option<bool>,
    deferred_upload_id: Option<String>,
    created_at: i64,
}

impl TryFrom<UploadObjectRow> for UploadObjectTracker {
    type Error = SyncError;

    fn try_from(row: UploadObjectRow) -> Result<Self> {
        Ok(Self {
            id: TrackerId::from_string(&row.id)?,
            file_group_id: FileGroupId::from_string(&row.file_group_id)?,
            sharing_group_id: SharingGroupId::from_string(&row.sharing_group_id)?,
            batch_uuid: BatchId::from_string(&row.batch_uuid)?,
            batch_expiry_interval: Duration::from_millis(
                row.batch_expiry_interval_ms.max(0) as u64,
            ),
            v0_upload: row.v0_upload,
            deferred_upload_id: parse_optional(
                row.deferred_upload_id,
                DeferredUploadId::from_string,
            )?,
            created_at: from_millis(row.created_at)?,
        })
    }
}

#[derive(Debug, FromRow)]
struct UploadFileRow {
    id: String,
    object_tracker_id: String,
    file_uuid: String,
    status: String,
    checksum: String,
    local_path: String,
    mime_type: String,
    app_meta_data: Option<String>,
    expiry: Option<i64>,
    upload_index: i64,
    upload_count: i64,
    inform_all_but_self: bool,
    uploaded_version: Option<i64>,
}

impl TryFrom<UploadFileRow> for UploadFileTracker {
    type Error = SyncError;

    fn try_from(row: UploadFileRow) -> Result<Self> {
        Ok(Self {
            id: TrackerId::from_string(&row.id)?,
            object_tracker_id: TrackerId::from_string(&row.object_tracker_id)?,
            file_uuid: FileUuid::from_string(&row.file_uuid)?,
            status: row.status.parse()?,
            checksum: row.checksum,
            local_path: PathBuf::from(row.local_path),
            mime_type: row.mime_type,
            app_meta_data: row.app_meta_data,
            expiry: row.expiry,
            upload_index: row.upload_index.max(0) as u32,
            upload_count: row.upload_count.max(0) as u32,
            inform_all_but_self: row.inform_all_but_self,
            uploaded_version: row.uploaded_version,
        })
    }
}

const OBJECT_SELECT: &str = "SELECT id, file_group_id, sharing_group_id, batch_uuid, \
     batch_expiry_interval_ms, v0_upload, deferred_upload_id, created_at FROM upload_objects";
const FILE_SELECT: &str = "SELECT id, object_tracker_id, file_uuid, status, checksum, local_path, \
     mime_type, app_meta_data, expiry, upload_index, upload_count, inform_all_but_self, \
     uploaded_version FROM upload_files";

pub(crate) async fn insert_object(
    conn: &mut SqliteConnection,
    object: &UploadObject,
) -> Result<()> {
    let tracker = &object.tracker;
    let interval_ms = i64::try_from(tracker.batch_expiry_interval.as_millis()).unwrap_or(i64::MAX);

    sqlx::query(
        r#"
        INSERT INTO upload_objects (
            id, file_group_id, sharing_group_id, batch_uuid, batch_expiry_interval_ms,
            v0_upload, deferred_upload_id, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(tracker.id.as_str())
    .bind(tracker.file_group_id.as_str())
    .bind(tracker.sharing_group_id.as_str())
    .bind(tracker.batch_uuid.as_str())
    .bind(interval_ms)
    .bind(tracker.v0_upload)
    .bind(tracker.deferred_upload_id.map(|id| id.as_str()))
    .bind(to_millis(tracker.created_at))
    .execute(&mut *conn)
    .await?;

    for file in &object.files {
        sqlx::query(
            r#"
            INSERT INTO upload_files (
                id, object_tracker_id, file_uuid, status, checksum, local_path, mime_type,
                app_meta_data, expiry, upload_index, upload_count, inform_all_but_self,
                uploaded_version
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(file.id.as_str())
        .bind(tracker.id.as_str())
        .bind(file.file_uuid.as_str())
        .bind(file.status.as_str())
        .bind(&file.checksum)
        .bind(file.local_path.to_string_lossy().into_owned())
        .bind(&file.mime_type)
        .bind(&file.app_meta_data)
        .bind(file.expiry)
        .bind(i64::from(file.upload_index))
        .bind(i64::from(file.upload_count))
        .bind(file.inform_all_but_self)
        .bind(file.uploaded_version)
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

async fn load_files(
    conn: &mut SqliteConnection,
    tracker: UploadObjectTracker,
) -> Result<UploadObject> {
    let sql = format!("{} WHERE object_tracker_id = ? ORDER BY upload_index", FILE_SELECT);
    let files = sqlx::query_as::<_, UploadFileRow>(&sql)
        .bind(tracker.id.as_str())
        .fetch_all(&mut *conn)
        .await?
        .into_iter()
        .map(UploadFileTracker::try_from)
        .collect::<Result<Vec<_>>>()?;

    Ok(UploadObject { tracker, files })
}

pub(crate) async fn find_object(
    conn: &mut SqliteConnection,
    id: TrackerId,
) -> Result<Option<UploadObject>> {
    let sql = format!("{} WHERE id = ?", OBJECT_SELECT);
    let row = sqlx::query_as::<_, UploadObjectRow>(&sql)
        .bind(id.as_str())
        .fetch_optional(&mut *conn)
        .await?;

    match row {
        Some(row) => Ok(Some(load_files(conn, row.try_into()?).await?)),
        None => Ok(None),
    }
}

/// All upload batches, oldest first.
pub(crate) async fn all_objects(conn: &mut SqliteConnection) -> Result<Vec<UploadObject>> {
    let sql = format!("{} ORDER BY created_at, rowid", OBJECT_SELECT);
    let rows = sqlx::query_as::<_, UploadObjectRow>(&sql)
        .fetch_all(&mut *conn)
        .await?;

    let mut objects = Vec::with_capacity(rows.len());
    for row in rows {
        objects.push(load_files(conn, row.try_into()?).await?);
    }
    Ok(objects)
}

pub(crate) async fn objects_for_group(
    conn: &mut SqliteConnection,
    file_group_id: FileGroupId,
) -> Result<Vec<UploadObject>> {
    let sql = format!("{} WHERE file_group_id = ? ORDER BY created_at, rowid", OBJECT_SELECT);
    let rows = sqlx::query_as::<_, UploadObjectRow>(&sql)
        .bind(file_group_id.as_str())
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
) -> Result<Option<UploadFileTracker>> {
    let sql = format!("{} WHERE id = ?", FILE_SELECT);
    let row = sqlx::query_as::<_, UploadFileRow>(&sql)
        .bind(id.as_str())
        .fetch_optional(&mut *conn)
        .await?;

    row.map(UploadFileTracker::try_from).transpose()
}

/// Whether any pending upload batch contains this file.
pub(crate) async fn file_has_tracker(
    conn: &mut SqliteConnection,
    file_uuid: FileUuid,
) -> Result<bool> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM upload_files WHERE file_uuid = ?")
        .bind(file_uuid.as_str())
        .fetch_one(&mut *conn)
        .await?;

    Ok(count > 0)
}

pub(crate) async fn set_file_status(
    conn: &mut SqliteConnection,
    id: TrackerId,
    status: UploadStatus,
    expiry: Option<i64>,
) -> Result<()> {
    sqlx::query("UPDATE upload_files SET status = ?, expiry = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(expiry)
        .bind(id.as_str())
        .execute(&mut *conn)
        .await?;

    Ok(())
}

pub(crate) async fn mark_file_uploaded(
    conn: &mut SqliteConnection,
    id: TrackerId,
    uploaded_version: Option<i64>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE upload_files SET
            status = 'uploaded',
            expiry = NULL,
            uploaded_version = COALESCE(?, uploaded_version)
        WHERE id = ?
        "#,
    )
    .bind(uploaded_version)
    .bind(id.as_str())
    .execute(&mut *conn)
    .await?;

    Ok(())
}

pub(crate) async fn set_deferred_upload_id(
    conn: &mut SqliteConnection,
    id: TrackerId,
    deferred_upload_id: DeferredUploadId,
) -> Result<()> {
    sqlx::query("UPDATE upload_objects SET deferred_upload_id = ? WHERE id = ?")
        .bind(deferred_upload_id.as_str())
        .bind(id.as_str())
        .execute(&mut *conn)
        .await?;

    Ok(())
}

/// Remove a batch; its file trackers cascade.
pub(crate) async fn delete_object(conn: &mut SqliteConnection, id: TrackerId) -> Result<()> {
    sqlx::query("DELETE FROM upload_objects WHERE id = ?")
        .bind(id.as_str())
        .execute(&mut *conn)
        .await?;

    Ok(())
}

pub(crate) async fn count_for_group(
    conn: &mut SqliteConnection,
    file_group_id: FileGroupId,
) -> Result<i64> {
    let count = sqlx::query_scalar("SELECT COUNT(*) FROM upload_objects WHERE file_group_id = ?")
        .bind(file_group_id.as_str())
        .fetch_one(&mut *conn)
        .await?;

    Ok(count)
}

pub(crate) async fn count_all(conn: &mut SqliteConnection) -> Result<i64> {
    let count = sqlx::query_scalar("SELECT COUNT(*) FROM upload_objects")
        .fetch_one(&mut *conn)
        .await?;

    Ok(count)
}
