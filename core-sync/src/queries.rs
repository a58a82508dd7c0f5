//! Read-only views over the engine's persisted state.

use crate::directory::{self, DirectoryFileEntry, DirectoryObjectEntry, SharingEntry};
use crate::downloads::{FileDownload, ObjectDownload};
use crate::engine::SyncEngine;
use crate::ids::{FileGroupId, FileUuid, SharingGroupId};
use crate::{deletion_tracker, download_tracker, upload_tracker, Result, SyncError};
use serde::{Deserialize, Serialize};

/// Which tracker table a queue query inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueKind {
    Upload,
    Download,
    Deletion,
}

/// An object together with its files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileGroupInfo {
    pub object: DirectoryObjectEntry,
    pub files: Vec<DirectoryFileEntry>,
}

impl SyncEngine {
    /// Whether any tracker of `kind` exists for the object.
    pub async fn is_queued(&self, kind: QueueKind, file_group_id: FileGroupId) -> Result<bool> {
        let _queue = self.lock_queue().await;
        let mut conn = self.inner.pool.acquire().await?;

        let queued = match kind {
            QueueKind::Upload => {
                upload_tracker::count_for_group(&mut conn, file_group_id).await? > 0
            }
            QueueKind::Download => {
                download_tracker::count_for_group(&mut conn, file_group_id).await? > 0
            }
            QueueKind::Deletion => deletion_tracker::find_for_group(&mut conn, file_group_id)
                .await?
                .is_some(),
        };
        Ok(queued)
    }

    /// Number of object-level trackers of `kind`, in any state.
    pub async fn number_queued(&self, kind: QueueKind) -> Result<usize> {
        let _queue = self.lock_queue().await;
        let mut conn = self.inner.pool.acquire().await?;

        let count = match kind {
            QueueKind::Upload => upload_tracker::count_all(&mut conn).await?,
            QueueKind::Download => download_tracker::count_all(&mut conn).await?,
            QueueKind::Deletion => deletion_tracker::count_all(&mut conn).await?,
        };
        Ok(usize::try_from(count).unwrap_or_default())
    }

    pub async fn file_info(&self, file_uuid: FileUuid) -> Result<DirectoryFileEntry> {
        let _queue = self.lock_queue().await;
        let mut conn = self.inner.pool.acquire().await?;

        directory::find_file(&mut conn, file_uuid)
            .await?
            .ok_or_else(|| SyncError::UnknownFile {
                file_uuid: file_uuid.as_str(),
            })
    }

    pub async fn file_group_info(&self, file_group_id: FileGroupId) -> Result<FileGroupInfo> {
        let _queue = self.lock_queue().await;
        let mut conn = self.inner.pool.acquire().await?;

        let object = directory::find_object(&mut conn, file_group_id)
            .await?
            .ok_or_else(|| SyncError::UnknownFileGroup {
                file_group_id: file_group_id.as_str(),
            })?;
        let files = directory::files_for_object(&mut conn, file_group_id).await?;
        Ok(FileGroupInfo { object, files })
    }

    /// Every sharing group the engine knows about, including deleted ones.
    pub async fn sharing_groups(&self) -> Result<Vec<SharingEntry>> {
        let _queue = self.lock_queue().await;
        let mut conn = self.inner.pool.acquire().await?;
        directory::all_sharing_entries(&mut conn).await
    }

    /// Objects whose server content is newer than the local copy.
    ///
    /// Deleted objects and objects with an upload or download tracker are
    /// skipped. Each result lists exactly the files to fetch, at their server
    /// versions, and can be handed to [`SyncEngine::queue_download`] unchanged.
    pub async fn objects_needing_download(
        &self,
        sharing_group_id: Option<SharingGroupId>,
    ) -> Result<Vec<ObjectDownload>> {
        let _queue = self.lock_queue().await;
        let mut conn = self.inner.pool.acquire().await?;

        let objects = match sharing_group_id {
            Some(id) => directory::objects_in_sharing_group(&mut conn, id).await?,
            None => directory::all_objects(&mut conn).await?,
        };

        let mut needing = Vec::new();
        for object in objects {
            if object.is_deleted() {
                continue;
            }
            let file_group_id = object.file_group_id;
            if download_tracker::count_for_group(&mut conn, file_group_id).await? > 0
                || upload_tracker::count_for_group(&mut conn, file_group_id).await? > 0
            {
                continue;
            }

            let files: Vec<FileDownload> = directory::files_for_object(&mut conn, file_group_id)
                .await?
                .into_iter()
                .filter(|file| !file.is_deleted() && file.needs_download())
                .filter_map(|file| {
                    file.server_file_version.map(|file_version| FileDownload {
                        file_uuid: file.file_uuid,
                        file_version,
                    })
                })
                .collect();

            if !files.is_empty() {
                needing.push(ObjectDownload {
                    file_group_id,
                    files,
                });
            }
        }

        Ok(needing)
    }
}
