//! # Declaration Registry
//!
//! An object's file schema as the application declared it on first upload.
//! Later queue calls must restate the same schema; a mismatch is rejected,
//! never merged.

use crate::ids::{FileGroupId, FileUuid, SharingGroupId};
use crate::{Result, SyncError};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqliteConnection};
use std::collections::{BTreeSet, HashMap, HashSet};

/// One file slot of an object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclaredFile {
    pub file_uuid: FileUuid,
    /// Unique within the object.
    pub file_label: String,
    pub mime_types: BTreeSet<String>,
    /// Present iff the file may have more than one version.
    pub change_resolver_name: Option<String>,
}

impl DeclaredFile {
    pub fn new<I, S>(file_uuid: FileUuid, file_label: impl Into<String>, mime_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            file_uuid,
            file_label: file_label.into(),
            mime_types: mime_types.into_iter().map(Into::into).collect(),
            change_resolver_name: None,
        }
    }

    pub fn with_change_resolver(mut self, name: impl Into<String>) -> Self {
        self.change_resolver_name = Some(name.into());
        self
    }

    fn mismatch(&self, other: &DeclaredFile) -> Option<String> {
        if self.file_label != other.file_label {
            return Some(format!(
                "file {} label '{}' != '{}'",
                self.file_uuid, self.file_label, other.file_label
            ));
        }
        if self.mime_types != other.mime_types {
            return Some(format!("file {} mime types differ", self.file_uuid));
        }
        if self.change_resolver_name != other.change_resolver_name {
            return Some(format!("file {} change resolver differs", self.file_uuid));
        }
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclaredObject {
    pub file_group_id: FileGroupId,
    /// Application-level schema tag.
    pub object_type: String,
    pub sharing_group_id: SharingGroupId,
    pub declared_files: Vec<DeclaredFile>,
}

impl DeclaredObject {
    pub fn new(
        file_group_id: FileGroupId,
        object_type: impl Into<String>,
        sharing_group_id: SharingGroupId,
        declared_files: Vec<DeclaredFile>,
    ) -> Self {
        Self {
            file_group_id,
            object_type: object_type.into(),
            sharing_group_id,
            declared_files,
        }
    }

    /// Check the declaration is well formed on its own.
    pub fn validate(&self) -> Result<()> {
        if self.declared_files.is_empty() {
            return Err(SyncError::NoDeclaredFiles);
        }

        let mut uuids = HashSet::new();
        let mut labels = HashSet::new();
        for file in &self.declared_files {
            if !uuids.insert(file.file_uuid) {
                return Err(SyncError::DuplicateUuids {
                    file_uuid: file.file_uuid.as_str(),
                });
            }
            if !labels.insert(file.file_label.as_str()) {
                return Err(SyncError::DuplicateFileLabels {
                    file_label: file.file_label.clone(),
                });
            }
        }

        Ok(())
    }

    pub fn file(&self, file_uuid: FileUuid) -> Option<&DeclaredFile> {
        self.declared_files.iter().find(|f| f.file_uuid == file_uuid)
    }

    /// Describe the first structural difference from `stored`, ignoring file order.
    pub fn mismatch(&self, stored: &DeclaredObject) -> Option<String> {
        if self.file_group_id != stored.file_group_id {
            return Some("file group ids differ".to_string());
        }
        if self.object_type != stored.object_type {
            return Some(format!(
                "object type '{}' != '{}'",
                self.object_type, stored.object_type
            ));
        }
        if self.sharing_group_id != stored.sharing_group_id {
            return Some("sharing groups differ".to_string());
        }
        if self.declared_files.len() != stored.declared_files.len() {
            return Some(format!(
                "{} declared files != {}",
                self.declared_files.len(),
                stored.declared_files.len()
            ));
        }

        let stored_files: HashMap<FileUuid, &DeclaredFile> = stored
            .declared_files
            .iter()
            .map(|f| (f.file_uuid, f))
            .collect();

        self.declared_files.iter().find_map(|file| {
            match stored_files.get(&file.file_uuid) {
                Some(other) => file.mismatch(other),
                None => Some(format!("file {} was not declared before", file.file_uuid)),
            }
        })
    }
}

// ============================================================================
// Persistence
// ============================================================================

#[derive(Debug, FromRow)]
struct DeclaredObjectRow {
    file_group_id: String,
    object_type: String,
    sharing_group_id: String,
}

#[derive(Debug, FromRow)]
struct DeclaredFileRow {
    file_uuid: String,
    file_label: String,
    mime_types: String,
    change_resolver_name: Option<String>,
}

impl TryFrom<DeclaredFileRow> for DeclaredFile {
    type Error = SyncError;

    fn try_from(row: DeclaredFileRow) -> Result<Self> {
        let mime_types = serde_json::from_str(&row.mime_types)
            .map_err(|e| SyncError::Internal(format!("Corrupt declared mime types: {}", e)))?;

        Ok(Self {
            file_uuid: FileUuid::from_string(&row.file_uuid)?,
            file_label: row.file_label,
            mime_types,
            change_resolver_name: row.change_resolver_name,
        })
    }
}

pub(crate) async fn find_declaration(
    conn: &mut SqliteConnection,
    file_group_id: FileGroupId,
) -> Result<Option<DeclaredObject>> {
    let Some(row) = sqlx::query_as::<_, DeclaredObjectRow>(
        "SELECT file_group_id, object_type, sharing_group_id FROM declared_objects \
         WHERE file_group_id = ?",
    )
    .bind(file_group_id.as_str())
    .fetch_optional(&mut *conn)
    .await?
    else {
        return Ok(None);
    };

    let files = sqlx::query_as::<_, DeclaredFileRow>(
        r#"
        SELECT file_uuid, file_label, mime_types, change_resolver_name
        FROM declared_files
        WHERE file_group_id = ?
        ORDER BY position
        "#,
    )
    .bind(file_group_id.as_str())
    .fetch_all(&mut *conn)
    .await?;

    Ok(Some(DeclaredObject {
        file_group_id: FileGroupId::from_string(&row.file_group_id)?,
        object_type: row.object_type,
        sharing_group_id: SharingGroupId::from_string(&row.sharing_group_id)?,
        declared_files: files
            .into_iter()
            .map(DeclaredFile::try_from)
            .collect::<Result<_>>()?,
    }))
}

pub(crate) async fn insert_declaration(
    conn: &mut SqliteConnection,
    declaration: &DeclaredObject,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO declared_objects (file_group_id, object_type, sharing_group_id) \
         VALUES (?, ?, ?)",
    )
    .bind(declaration.file_group_id.as_str())
    .bind(&declaration.object_type)
    .bind(declaration.sharing_group_id.as_str())
    .execute(&mut *conn)
    .await?;

    for (position, file) in declaration.declared_files.iter().enumerate() {
        let mime_types = serde_json::to_string(&file.mime_types)
            .map_err(|e| SyncError::Internal(format!("Cannot encode mime types: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO declared_files (
                file_group_id, file_uuid, file_label, mime_types, change_resolver_name, position
            ) VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(declaration.file_group_id.as_str())
        .bind(file.file_uuid.as_str())
        .bind(&file.file_label)
        .bind(mime_types)
        .bind(&file.change_resolver_name)
        .bind(position as i64)
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

pub(crate) async fn set_declaration_sharing_group(
    conn: &mut SqliteConnection,
    file_group_id: FileGroupId,
    sharing_group_id: SharingGroupId,
) -> Result<()> {
    sqlx::query("UPDATE declared_objects SET sharing_group_id = ? WHERE file_group_id = ?")
        .bind(sharing_group_id.as_str())
        .bind(file_group_id.as_str())
        .execute(&mut *conn)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_test_pool;

    fn declaration() -> DeclaredObject {
        DeclaredObject::new(
            FileGroupId::new(),
            "note",
            SharingGroupId::new(),
            vec![
                DeclaredFile::new(FileUuid::new(), "main", ["text/plain"])
                    .with_change_resolver("appendLines"),
                DeclaredFile::new(FileUuid::new(), "image", ["image/png", "image/jpeg"]),
            ],
        )
    }

    #[test]
    fn test_validate_rejects_empty_and_duplicates() {
        let mut empty = declaration();
        empty.declared_files.clear();
        assert!(matches!(empty.validate(), Err(SyncError::NoDeclaredFiles)));

        let mut dup_uuid = declaration();
        dup_uuid.declared_files[1].file_uuid = dup_uuid.declared_files[0].file_uuid;
        assert!(matches!(dup_uuid.validate(), Err(SyncError::DuplicateUuids { .. })));

        let mut dup_label = declaration();
        dup_label.declared_files[1].file_label = "main".to_string();
        assert!(matches!(
            dup_label.validate(),
            Err(SyncError::DuplicateFileLabels { .. })
        ));

        assert!(declaration().validate().is_ok());
    }

    #[test]
    fn test_mismatch_ignores_file_order() {
        let stored = declaration();
        let mut reordered = stored.clone();
        reordered.declared_files.reverse();
        assert_eq!(reordered.mismatch(&stored), None);
    }

    #[test]
    fn test_mismatch_detects_schema_changes() {
        let stored = declaration();

        let mut other_type = stored.clone();
        other_type.object_type = "photo".to_string();
        assert!(other_type.mismatch(&stored).is_some());

        let mut other_mime = stored.clone();
        other_mime.declared_files[0].mime_types.insert("text/html".to_string());
        assert!(other_mime.mismatch(&stored).is_some());

        let mut other_resolver = stored.clone();
        other_resolver.declared_files[1].change_resolver_name = Some("replace".to_string());
        assert!(other_resolver.mismatch(&stored).is_some());

        let mut other_file = stored.clone();
        other_file.declared_files[1].file_uuid = FileUuid::new();
        assert!(other_file.mismatch(&stored).is_some());
    }

    #[tokio::test]
    async fn test_declaration_round_trip() {
        let pool = create_test_pool().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let declaration = declaration();

        insert_declaration(&mut conn, &declaration).await.unwrap();
        let stored = find_declaration(&mut conn, declaration.file_group_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored, declaration);

        let destination = SharingGroupId::new();
        set_declaration_sharing_group(&mut conn, declaration.file_group_id, destination)
            .await
            .unwrap();
        let moved = find_declaration(&mut conn, declaration.file_group_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(moved.sharing_group_id, destination);

        assert!(find_declaration(&mut conn, FileGroupId::new())
            .await
            .unwrap()
            .is_none());
    }
}
