//! # Directory Store
//!
//! The local source of truth for what the client knows about each object and
//! file: local and server versions, and deletion flags on both sides. Sharing
//! group entries refreshed from the server's index live here too.
//!
//! ## Invariant
//!
//! A file whose `file_version` is `None` while `server_file_version` is set
//! holds server content the client has not downloaded; it must not be queued
//! for upload.

use crate::ids::{FileGroupId, FileUuid, SharingGroupId};
use crate::{Result, SyncError};
use bridge_traits::server::{Permission, SharingGroupMember};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqliteConnection};

// ============================================================================
// Entries
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryObjectEntry {
    pub file_group_id: FileGroupId,
    pub sharing_group_id: SharingGroupId,
    pub object_type: Option<String>,
    pub deleted_locally: bool,
    pub deleted_on_server: bool,
}

impl DirectoryObjectEntry {
    pub fn new(
        file_group_id: FileGroupId,
        sharing_group_id: SharingGroupId,
        object_type: Option<String>,
    ) -> Self {
        Self {
            file_group_id,
            sharing_group_id,
            object_type,
            deleted_locally: false,
            deleted_on_server: false,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_locally || self.deleted_on_server
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryFileEntry {
    pub file_uuid: FileUuid,
    pub file_group_id: FileGroupId,
    pub file_label: String,
    /// Version the client holds; `None` until the first upload or download completes.
    pub file_version: Option<i64>,
    /// Latest version observed on the server.
    pub server_file_version: Option<i64>,
    pub deleted_locally: bool,
    pub deleted_on_server: bool,
    pub creation_date: DateTime<Utc>,
    pub update_date: Option<DateTime<Utc>>,
}

impl DirectoryFileEntry {
    pub fn new(
        file_uuid: FileUuid,
        file_group_id: FileGroupId,
        file_label: impl Into<String>,
        creation_date: DateTime<Utc>,
    ) -> Self {
        Self {
            file_uuid,
            file_group_id,
            file_label: file_label.into(),
            file_version: None,
            server_file_version: None,
            deleted_locally: false,
            deleted_on_server: false,
            creation_date,
            update_date: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_locally || self.deleted_on_server
    }

    /// Server-known content the client never downloaded.
    pub fn is_undownloaded(&self) -> bool {
        self.file_version.is_none() && self.server_file_version.is_some()
    }

    /// The server holds a version newer than the local one.
    pub fn needs_download(&self) -> bool {
        match (self.file_version, self.server_file_version) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(local), Some(server)) => server > local,
        }
    }

    /// Whether a version of this file has ever been confirmed on either side.
    pub fn has_version(&self) -> bool {
        self.file_version.is_some() || self.server_file_version.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharingEntry {
    pub sharing_group_id: SharingGroupId,
    pub name: Option<String>,
    pub permission: Permission,
    pub deleted: bool,
    pub cloud_storage_type: Option<String>,
    pub members: Vec<SharingGroupMember>,
}

// ============================================================================
// Timestamp Helpers
// ============================================================================

pub(crate) fn to_millis(date: DateTime<Utc>) -> i64 {
    date.timestamp_millis()
}

pub(crate) fn from_millis(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| SyncError::Internal(format!("Timestamp out of range: {}", millis)))
}

// ============================================================================
// Persistence
// ============================================================================

#[derive(Debug, FromRow)]
struct DirectoryObjectRow {
    file_group_id: String,
    sharing_group_id: String,
    object_type: Option<String>,
    deleted_locally: bool,
    deleted_on_server: bool,
}

impl TryFrom<DirectoryObjectRow> for DirectoryObjectEntry {
    type Error = SyncError;

    fn try_from(row: DirectoryObjectRow) -> Result<Self> {
        Ok(Self {
            file_group_id: FileGroupId::from_string(&row.file_group_id)?,
            sharing_group_id: SharingGroupId::from_string(&row.sharing_group_id)?,
            object_type: row.object_type,
            deleted_locally: row.deleted_locally,
            deleted_on_server: row.deleted_on_server,
        })
    }
}

#[derive(Debug, FromRow)]
struct DirectoryFileRow {
    file_uuid: String,
    file_group_id: String,
    file_label: String,
    file_version: Option<i64>,
    server_file_version: Option<i64>,
    deleted_locally: bool,
    deleted_on_server: bool,
    creation_date: i64,
    update_date: Option<i64>,
}

impl TryFrom<DirectoryFileRow> for DirectoryFileEntry {
    type Error = SyncError;

    fn try_from(row: DirectoryFileRow) -> Result<Self> {
        Ok(Self {
            file_uuid: FileUuid::from_string(&row.file_uuid)?,
            file_group_id: FileGroupId::from_string(&row.file_group_id)?,
            file_label: row.file_label,
            file_version: row.file_version,
            server_file_version: row.server_file_version,
            deleted_locally: row.deleted_locally,
            deleted_on_server: row.deleted_on_server,
            creation_date: from_millis(row.creation_date)?,
            update_date: row.update_date.map(from_millis).transpose()?,
        })
    }
}

#[derive(Debug, FromRow)]
struct SharingEntryRow {
    sharing_group_id: String,
    name: Option<String>,
    permission: String,
    deleted: bool,
    cloud_storage_type: Option<String>,
    members: String,
}

impl TryFrom<SharingEntryRow> for SharingEntry {
    type Error = SyncError;

    fn try_from(row: SharingEntryRow) -> Result<Self> {
        let permission = Permission::parse(&row.permission)
            .ok_or_else(|| SyncError::InvalidStatus(format!("permission {}", row.permission)))?;
        let members = serde_json::from_str(&row.members)
            .map_err(|e| SyncError::Internal(format!("Corrupt sharing group members: {}", e)))?;

        Ok(Self {
            sharing_group_id: SharingGroupId::from_string(&row.sharing_group_id)?,
            name: row.name,
            permission,
            deleted: row.deleted,
            cloud_storage_type: row.cloud_storage_type,
            members,
        })
    }
}

const OBJECT_COLUMNS: &str =
    "file_group_id, sharing_group_id, object_type, deleted_locally, deleted_on_server";
const FILE_COLUMNS: &str = "file_uuid, file_group_id, file_label, file_version, \
     server_file_version, deleted_locally, deleted_on_server, creation_date, update_date";

pub(crate) async fn find_object(
    conn: &mut SqliteConnection,
    file_group_id: FileGroupId,
) -> Result<Option<DirectoryObjectEntry>> {
    let sql = format!(
        "SELECT {} FROM directory_objects WHERE file_group_id = ?",
        OBJECT_COLUMNS
    );
    let row = sqlx::query_as::<_, DirectoryObjectRow>(&sql)
        .bind(file_group_id.as_str())
        .fetch_optional(&mut *conn)
        .await?;

    row.map(DirectoryObjectEntry::try_from).transpose()
}

pub(crate) async fn objects_in_sharing_group(
    conn: &mut SqliteConnection,
    sharing_group_id: SharingGroupId,
) -> Result<Vec<DirectoryObjectEntry>> {
    let sql = format!(
        "SELECT {} FROM directory_objects WHERE sharing_group_id = ? ORDER BY rowid",
        OBJECT_COLUMNS
    );
    let rows = sqlx::query_as::<_, DirectoryObjectRow>(&sql)
        .bind(sharing_group_id.as_str())
        .fetch_all(&mut *conn)
        .await?;

    rows.into_iter().map(DirectoryObjectEntry::try_from).collect()
}

pub(crate) async fn all_objects(conn: &mut SqliteConnection) -> Result<Vec<DirectoryObjectEntry>> {
    let sql = format!("SELECT {} FROM directory_objects ORDER BY rowid", OBJECT_COLUMNS);
    let rows = sqlx::query_as::<_, DirectoryObjectRow>(&sql)
        .fetch_all(&mut *conn)
        .await?;

    rows.into_iter().map(DirectoryObjectEntry::try_from).collect()
}

pub(crate) async fn upsert_object(
    conn: &mut SqliteConnection,
    entry: &DirectoryObjectEntry,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO directory_objects (
            file_group_id, sharing_group_id, object_type, deleted_locally, deleted_on_server
        ) VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(file_group_id) DO UPDATE SET
            sharing_group_id = excluded.sharing_group_id,
            object_type = excluded.object_type,
            deleted_locally = excluded.deleted_locally,
            deleted_on_server = excluded.deleted_on_server
        "#,
    )
    .bind(entry.file_group_id.as_str())
    .bind(entry.sharing_group_id.as_str())
    .bind(&entry.object_type)
    .bind(entry.deleted_locally)
    .bind(entry.deleted_on_server)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

pub(crate) async fn find_file(
    conn: &mut SqliteConnection,
    file_uuid: FileUuid,
) -> Result<Option<DirectoryFileEntry>> {
    let sql = format!(
        "SELECT {} FROM directory_files WHERE file_uuid = ?",
        FILE_COLUMNS
    );
    let row = sqlx::query_as::<_, DirectoryFileRow>(&sql)
        .bind(file_uuid.as_str())
        .fetch_optional(&mut *conn)
        .await?;

    row.map(DirectoryFileEntry::try_from).transpose()
}

pub(crate) async fn files_for_object(
    conn: &mut SqliteConnection,
    file_group_id: FileGroupId,
) -> Result<Vec<DirectoryFileEntry>> {
    let sql = format!(
        "SELECT {} FROM directory_files WHERE file_group_id = ? ORDER BY rowid",
        FILE_COLUMNS
    );
    let rows = sqlx::query_as::<_, DirectoryFileRow>(&sql)
        .bind(file_group_id.as_str())
        .fetch_all(&mut *conn)
        .await?;

    rows.into_iter().map(DirectoryFileEntry::try_from).collect()
}

pub(crate) async fn upsert_file(
    conn: &mut SqliteConnection,
    entry: &DirectoryFileEntry,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO directory_files (
            file_uuid, file_group_id, file_label, file_version, server_file_version,
            deleted_locally, deleted_on_server, creation_date, update_date
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(file_uuid) DO UPDATE SET
            file_label = excluded.file_label,
            file_version = excluded.file_version,
            server_file_version = excluded.server_file_version,
            deleted_locally = excluded.deleted_locally,
            deleted_on_server = excluded.deleted_on_server,
            creation_date = excluded.creation_date,
            update_date = excluded.update_date
        "#,
    )
    .bind(entry.file_uuid.as_str())
    .bind(entry.file_group_id.as_str())
    .bind(&entry.file_label)
    .bind(entry.file_version)
    .bind(entry.server_file_version)
    .bind(entry.deleted_locally)
    .bind(entry.deleted_on_server)
    .bind(to_millis(entry.creation_date))
    .bind(entry.update_date.map(to_millis))
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Record a confirmed version for a file. The server version never moves backwards.
pub(crate) async fn set_file_version(
    conn: &mut SqliteConnection,
    file_uuid: FileUuid,
    version: i64,
    update_date: Option<DateTime<Utc>>,
) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE directory_files SET
            file_version = ?1,
            server_file_version = MAX(COALESCE(server_file_version, ?1), ?1),
            update_date = COALESCE(?2, update_date)
        WHERE file_uuid = ?3
        "#,
    )
    .bind(version)
    .bind(update_date.map(to_millis))
    .bind(file_uuid.as_str())
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(SyncError::Internal(format!(
            "Directory entry missing for file {}",
            file_uuid
        )));
    }

    Ok(())
}

/// Mark the object and all of its files deleted.
pub(crate) async fn mark_object_deleted(
    conn: &mut SqliteConnection,
    file_group_id: FileGroupId,
    locally: bool,
    on_server: bool,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE directory_objects SET
            deleted_locally = deleted_locally OR ?,
            deleted_on_server = deleted_on_server OR ?
        WHERE file_group_id = ?
        "#,
    )
    .bind(locally)
    .bind(on_server)
    .bind(file_group_id.as_str())
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        UPDATE directory_files SET
            deleted_locally = deleted_locally OR ?,
            deleted_on_server = deleted_on_server OR ?
        WHERE file_group_id = ?
        "#,
    )
    .bind(locally)
    .bind(on_server)
    .bind(file_group_id.as_str())
    .execute(&mut *conn)
    .await?;

    Ok(())
}

pub(crate) async fn set_object_sharing_group(
    conn: &mut SqliteConnection,
    file_group_id: FileGroupId,
    sharing_group_id: SharingGroupId,
) -> Result<()> {
    sqlx::query("UPDATE directory_objects SET sharing_group_id = ? WHERE file_group_id = ?")
        .bind(sharing_group_id.as_str())
        .bind(file_group_id.as_str())
        .execute(&mut *conn)
        .await?;

    Ok(())
}

pub(crate) async fn find_sharing_entry(
    conn: &mut SqliteConnection,
    sharing_group_id: SharingGroupId,
) -> Result<Option<SharingEntry>> {
    let row = sqlx::query_as::<_, SharingEntryRow>(
        r#"
        SELECT sharing_group_id, name, permission, deleted, cloud_storage_type, members
        FROM sharing_entries
        WHERE sharing_group_id = ?
        "#,
    )
    .bind(sharing_group_id.as_str())
    .fetch_optional(&mut *conn)
    .await?;

    row.map(SharingEntry::try_from).transpose()
}

pub(crate) async fn all_sharing_entries(conn: &mut SqliteConnection) -> Result<Vec<SharingEntry>> {
    let rows = sqlx::query_as::<_, SharingEntryRow>(
        r#"
        SELECT sharing_group_id, name, permission, deleted, cloud_storage_type, members
        FROM sharing_entries
        ORDER BY rowid
        "#,
    )
    .fetch_all(&mut *conn)
    .await?;

    rows.into_iter().map(SharingEntry::try_from).collect()
}

pub(crate) async fn upsert_sharing_entry(
    conn: &mut SqliteConnection,
    entry: &SharingEntry,
) -> Result<()> {
    let members = serde_json::to_string(&entry.members)
        .map_err(|e| SyncError::Internal(format!("Cannot encode members: {}", e)))?;

    sqlx::query(
        r#"
        INSERT INTO sharing_entries (
            sharing_group_id, name, permission, deleted, cloud_storage_type, members
        ) VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(sharing_group_id) DO UPDATE SET
            name = excluded.name,
            permission = excluded.permission,
            deleted = excluded.deleted,
            cloud_storage_type = excluded.cloud_storage_type,
            members = excluded.members
        "#,
    )
    .bind(entry.sharing_group_id.as_str())
    .bind(&entry.name)
    .bind(entry.permission.as_str())
    .bind(entry.deleted)
    .bind(&entry.cloud_storage_type)
    .bind(members)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_test_pool;

    #[test]
    fn test_file_entry_download_state() {
        let mut entry =
            DirectoryFileEntry::new(FileUuid::new(), FileGroupId::new(), "main", Utc::now());
        assert!(!entry.needs_download());
        assert!(!entry.is_undownloaded());
        assert!(!entry.has_version());

        entry.server_file_version = Some(0);
        assert!(entry.is_undownloaded());
        assert!(entry.needs_download());

        entry.file_version = Some(0);
        assert!(!entry.needs_download());

        entry.server_file_version = Some(2);
        assert!(entry.needs_download());
        assert!(!entry.is_undownloaded());
    }

    #[tokio::test]
    async fn test_object_and_file_round_trip() {
        let pool = create_test_pool().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();

        let object = DirectoryObjectEntry::new(
            FileGroupId::new(),
            SharingGroupId::new(),
            Some("note".to_string()),
        );
        upsert_object(&mut conn, &object).await.unwrap();

        let file = DirectoryFileEntry::new(
            FileUuid::new(),
            object.file_group_id,
            "main",
            from_millis(1_700_000_000_000).unwrap(),
        );
        upsert_file(&mut conn, &file).await.unwrap();

        assert_eq!(
            find_object(&mut conn, object.file_group_id).await.unwrap(),
            Some(object.clone())
        );
        assert_eq!(find_file(&mut conn, file.file_uuid).await.unwrap(), Some(file.clone()));
        assert_eq!(files_for_object(&mut conn, object.file_group_id).await.unwrap(), vec![file]);
    }

    #[tokio::test]
    async fn test_set_file_version_keeps_server_maximum() {
        let pool = create_test_pool().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();

        let object = DirectoryObjectEntry::new(FileGroupId::new(), SharingGroupId::new(), None);
        upsert_object(&mut conn, &object).await.unwrap();
        let mut file =
            DirectoryFileEntry::new(FileUuid::new(), object.file_group_id, "main", Utc::now());
        file.server_file_version = Some(3);
        upsert_file(&mut conn, &file).await.unwrap();

        set_file_version(&mut conn, file.file_uuid, 1, None).await.unwrap();
        let stored = find_file(&mut conn, file.file_uuid).await.unwrap().unwrap();
        assert_eq!(stored.file_version, Some(1));
        assert_eq!(stored.server_file_version, Some(3));

        set_file_version(&mut conn, file.file_uuid, 4, None).await.unwrap();
        let stored = find_file(&mut conn, file.file_uuid).await.unwrap().unwrap();
        assert_eq!(stored.server_file_version, Some(4));

        let missing = set_file_version(&mut conn, FileUuid::new(), 0, None).await;
        assert!(matches!(missing, Err(SyncError::Internal(_))));
    }

    #[tokio::test]
    async fn test_mark_object_deleted_flags_files() {
        let pool = create_test_pool().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();

        let object = DirectoryObjectEntry::new(FileGroupId::new(), SharingGroupId::new(), None);
        upsert_object(&mut conn, &object).await.unwrap();
        let file =
            DirectoryFileEntry::new(FileUuid::new(), object.file_group_id, "main", Utc::now());
        upsert_file(&mut conn, &file).await.unwrap();

        mark_object_deleted(&mut conn, object.file_group_id, false, true).await.unwrap();
        let stored = find_object(&mut conn, object.file_group_id).await.unwrap().unwrap();
        assert!(stored.deleted_on_server);
        assert!(!stored.deleted_locally);

        mark_object_deleted(&mut conn, object.file_group_id, true, false).await.unwrap();
        let stored = find_file(&mut conn, file.file_uuid).await.unwrap().unwrap();
        assert!(stored.deleted_on_server && stored.deleted_locally);
    }

    #[tokio::test]
    async fn test_sharing_entry_round_trip() {
        let pool = create_test_pool().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();

        let entry = SharingEntry {
            sharing_group_id: SharingGroupId::new(),
            name: Some("Family".to_string()),
            permission: Permission::Admin,
            deleted: false,
            cloud_storage_type: Some("Dropbox".to_string()),
            members: vec![SharingGroupMember {
                user_id: "1".to_string(),
                name: Some("Sam".to_string()),
            }],
        };
        upsert_sharing_entry(&mut conn, &entry).await.unwrap();

        assert_eq!(
            find_sharing_entry(&mut conn, entry.sharing_group_id).await.unwrap(),
            Some(entry.clone())
        );
        assert_eq!(all_sharing_entries(&mut conn).await.unwrap(), vec![entry]);
    }
}
