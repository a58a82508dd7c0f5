//! # Download Pipeline
//!
//! Queues downloads of server versions the directory knows about, starts them
//! within the object-level concurrency limit and applies results. Stalled
//! downloads are not retried in place: [`SyncEngine::reset_expired_downloads`]
//! returns them to `notStarted` and the next trigger pass picks them up.

use crate::directory;
use crate::download_tracker::{
    self, DownloadFileTracker, DownloadObject, DownloadObjectTracker, DownloadStatus,
};
use crate::engine::{Effects, Request, SyncEngine};
use crate::ids::{FileGroupId, FileUuid, TrackerId};
use crate::uploads::absorb_internal;
use crate::{deletion_tracker, Result, SyncError};
use bridge_traits::error::Result as BridgeResult;
use bridge_traits::server::{DownloadFileResult, FileDownloadRequest};
use core_runtime::events::{
    CoreEvent, DownloadEvent, DownloadOutcome, DownloadedFile, DownloadedObject,
};
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use std::collections::HashSet;
use tracing::{debug, info, instrument};

/// One file version to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDownload {
    pub file_uuid: FileUuid,
    /// Must equal the server version recorded in the directory.
    pub file_version: i64,
}

/// Files of one object to download together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectDownload {
    pub file_group_id: FileGroupId,
    pub files: Vec<FileDownload>,
}

impl SyncEngine {
    /// Queue the download of one object's files.
    ///
    /// # Errors
    ///
    /// Validation errors leave no state behind.
    #[instrument(skip(self, download), fields(file_group_id = %download.file_group_id))]
    pub async fn queue_download(&self, download: ObjectDownload) -> Result<()> {
        if download.files.is_empty() {
            return Err(SyncError::NoDownloads);
        }
        let mut seen = HashSet::new();
        for file in &download.files {
            if !seen.insert(file.file_uuid) {
                return Err(SyncError::DuplicateUuids {
                    file_uuid: file.file_uuid.as_str(),
                });
            }
        }
        let network_usable = self.network_usable().await;

        let queue = self.lock_queue().await;
        let mut tx = self.inner.pool.begin().await?;
        let mut effects = Effects::default();

        self.persist_download(&mut tx, &download, network_usable, &mut effects)
            .await?;

        tx.commit().await?;
        drop(queue);
        self.finish(effects);
        Ok(())
    }

    async fn persist_download(
        &self,
        conn: &mut SqliteConnection,
        download: &ObjectDownload,
        network_usable: bool,
        effects: &mut Effects,
    ) -> Result<()> {
        let file_group_id = download.file_group_id;

        let object = directory::find_object(conn, file_group_id)
            .await?
            .ok_or_else(|| SyncError::UnknownFileGroup {
                file_group_id: file_group_id.as_str(),
            })?;
        if object.is_deleted() {
            return Err(SyncError::FileGroupDeleted {
                file_group_id: file_group_id.as_str(),
            });
        }
        if deletion_tracker::find_for_group(conn, file_group_id)
            .await?
            .is_some()
        {
            return Err(SyncError::DeletionPending {
                file_group_id: file_group_id.as_str(),
            });
        }

        for file in &download.files {
            let entry = directory::find_file(conn, file.file_uuid)
                .await?
                .filter(|entry| entry.file_group_id == file_group_id)
                .ok_or_else(|| SyncError::UnknownFile {
                    file_uuid: file.file_uuid.as_str(),
                })?;
            if entry.is_deleted() {
                return Err(SyncError::FileGroupDeleted {
                    file_group_id: file_group_id.as_str(),
                });
            }
            if entry.server_file_version != Some(file.file_version) {
                return Err(SyncError::DownloadVersionMismatch {
                    file_uuid: file.file_uuid.as_str(),
                    requested: file.file_version,
                    server: entry.server_file_version,
                });
            }
        }

        let existing = download_tracker::all_objects(conn).await?;
        let group_busy = existing
            .iter()
            .any(|o| o.tracker.file_group_id == file_group_id);
        let active = existing.iter().filter(|o| !o.is_queued()).count();

        let tracker = DownloadObjectTracker {
            id: TrackerId::new(),
            file_group_id,
            created_at: self.inner.clock.now(),
        };
        let files = download
            .files
            .iter()
            .map(|file| DownloadFileTracker {
                id: TrackerId::new(),
                object_tracker_id: tracker.id,
                file_uuid: file.file_uuid,
                file_version: file.file_version,
                status: DownloadStatus::NotStarted,
                expiry: None,
                local_path: None,
                app_meta_data: None,
                gone_reason: None,
            })
            .collect();
        let object = DownloadObject { tracker, files };
        download_tracker::insert_object(conn, &object).await?;

        info!(file_count = object.files.len(), "Download queued");

        let can_start = !group_busy
            && active < self.inner.limits.max_concurrent_file_group_downloads
            && network_usable;
        if can_start {
            self.start_download_files(conn, &object, effects).await?;
        } else {
            effects.event(CoreEvent::Download(DownloadEvent::Queued {
                file_group_id: file_group_id.into(),
            }));
        }

        Ok(())
    }

    /// Start every `notStarted` file of a download object. Returns how many started.
    async fn start_download_files(
        &self,
        conn: &mut SqliteConnection,
        object: &DownloadObject,
        effects: &mut Effects,
    ) -> Result<usize> {
        let entry = directory::find_object(conn, object.tracker.file_group_id)
            .await?
            .ok_or_else(|| {
                SyncError::Internal(format!(
                    "Download tracker {} has no directory object",
                    object.tracker.id
                ))
            })?;
        let expiry = self
            .inner
            .clock
            .deadline_after(self.inner.limits.download_expiry);

        let mut started = 0;
        for file in object
            .files
            .iter()
            .filter(|f| f.status == DownloadStatus::NotStarted)
        {
            download_tracker::set_file_status(
                conn,
                file.id,
                DownloadStatus::Downloading,
                Some(expiry),
            )
            .await?;
            effects.request(Request::Download {
                file_tracker_id: file.id,
                request: FileDownloadRequest {
                    file_uuid: file.file_uuid.into(),
                    file_group_id: object.tracker.file_group_id.into(),
                    sharing_group_id: entry.sharing_group_id.into(),
                    file_version: file.file_version,
                    tracker_id: file.id.into(),
                },
            });
            started += 1;
        }

        Ok(started)
    }

    /// Apply the server's answer to one file download.
    pub(crate) async fn complete_download(
        &self,
        file_tracker_id: TrackerId,
        result: BridgeResult<DownloadFileResult>,
    ) -> Result<()> {
        let queue = self.lock_queue().await;
        let mut tx = self.inner.pool.begin().await?;
        let mut effects = Effects::default();

        let Some(file) = download_tracker::find_file(&mut tx, file_tracker_id).await? else {
            debug!(
                tracker = %file_tracker_id,
                "Download result for a tracker that no longer exists"
            );
            return Ok(());
        };

        match result {
            Err(e) => {
                let object = download_tracker::find_object(&mut tx, file.object_tracker_id).await?;
                effects.user_error(
                    format!("Download of file {} failed: {}", file.file_uuid, e),
                    object.map(|o| o.tracker.file_group_id),
                );
            }
            Ok(DownloadFileResult::Success {
                local_path,
                app_meta_data,
                file_version,
                ..
            }) => {
                download_tracker::mark_file_downloaded(
                    &mut tx,
                    file.id,
                    file_version,
                    &local_path,
                    app_meta_data.as_deref(),
                )
                .await?;
            }
            Ok(DownloadFileResult::Gone(reason)) => {
                download_tracker::mark_file_gone(&mut tx, file.id, reason).await?;
            }
        }

        if let Some(object) = download_tracker::find_object(&mut tx, file.object_tracker_id).await?
        {
            if object.all_downloaded() {
                self.finish_download(&mut tx, &object, &mut effects).await?;
            }
        }

        tx.commit().await?;
        drop(queue);
        self.finish(effects);
        Ok(())
    }

    /// Every file is terminal: record versions, drop trackers, report.
    async fn finish_download(
        &self,
        conn: &mut SqliteConnection,
        object: &DownloadObject,
        effects: &mut Effects,
    ) -> Result<()> {
        let file_group_id = object.tracker.file_group_id;
        let entry = directory::find_object(conn, file_group_id)
            .await?
            .ok_or_else(|| {
                SyncError::Internal(format!(
                    "Downloaded object {} is not in the directory",
                    file_group_id
                ))
            })?;

        let mut files = Vec::with_capacity(object.files.len());
        for file in &object.files {
            let label = directory::find_file(conn, file.file_uuid)
                .await?
                .map(|e| e.file_label)
                .unwrap_or_default();

            let outcome = match (&file.gone_reason, &file.local_path) {
                (Some(reason), _) => DownloadOutcome::Gone { reason: *reason },
                (None, Some(local_path)) => {
                    directory::set_file_version(conn, file.file_uuid, file.file_version, None)
                        .await?;
                    DownloadOutcome::Downloaded {
                        local_path: local_path.clone(),
                        app_meta_data: file.app_meta_data.clone(),
                    }
                }
                (None, None) => {
                    return Err(SyncError::Internal(format!(
                        "Downloaded file {} has no content",
                        file.file_uuid
                    )))
                }
            };

            files.push(DownloadedFile {
                file_uuid: file.file_uuid.into(),
                file_label: label,
                file_version: file.file_version,
                outcome,
            });
        }

        download_tracker::delete_object(conn, object.tracker.id).await?;
        info!(%file_group_id, files = files.len(), "Download completed");

        effects.event(CoreEvent::Download(DownloadEvent::Completed {
            object: DownloadedObject {
                file_group_id: file_group_id.into(),
                sharing_group_id: entry.sharing_group_id.into(),
                files,
            },
        }));
        Ok(())
    }

    /// Resume partially started objects, then start queued objects oldest
    /// first within the concurrency limit.
    pub(crate) async fn trigger_downloads(
        &self,
        conn: &mut SqliteConnection,
        effects: &mut Effects,
    ) -> Result<()> {
        let objects = download_tracker::all_objects(conn).await?;
        let mut started_objects = 0;

        for object in objects.iter().filter(|o| o.is_in_progress()) {
            match self.start_download_files(conn, object, effects).await {
                Ok(0) => {}
                Ok(_) => started_objects += 1,
                Err(e) => absorb_internal(Err(e), effects)?,
            }
        }

        let max = self.inner.limits.max_concurrent_file_group_downloads;
        let mut active = objects.iter().filter(|o| !o.is_queued()).count();
        let mut busy_groups: HashSet<FileGroupId> = objects
            .iter()
            .filter(|o| !o.is_queued())
            .map(|o| o.tracker.file_group_id)
            .collect();

        for object in objects.iter().filter(|o| o.is_queued()) {
            if active >= max {
                debug!(active, max, "Download concurrency limit reached");
                break;
            }
            if !busy_groups.insert(object.tracker.file_group_id) {
                continue;
            }
            match self.start_download_files(conn, object, effects).await {
                Ok(_) => {
                    started_objects += 1;
                    active += 1;
                }
                Err(e) => absorb_internal(Err(e), effects)?,
            }
        }

        if started_objects > 0 {
            info!(started = started_objects, "Downloads started");
            effects.event(CoreEvent::Download(DownloadEvent::Sync {
                started: started_objects,
            }));
        }
        Ok(())
    }

    /// Return stalled `downloading` files to `notStarted`.
    pub(crate) async fn reset_expired_downloads(&self, conn: &mut SqliteConnection) -> Result<()> {
        let reset = download_tracker::reset_expired(conn, self.now_millis()).await?;
        if reset > 0 {
            info!(reset, "Reset expired downloads");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{DirectoryFileEntry, DirectoryObjectEntry};
    use crate::engine::test_support::{engine_with, MockServer};
    use crate::ids::SharingGroupId;
    use chrono::Utc;

    async fn seed(engine: &SyncEngine, server_version: i64) -> (FileGroupId, FileUuid) {
        let mut conn = engine.inner.pool.acquire().await.unwrap();
        let object = DirectoryObjectEntry::new(FileGroupId::new(), SharingGroupId::new(), None);
        directory::upsert_object(&mut conn, &object).await.unwrap();
        let mut file =
            DirectoryFileEntry::new(FileUuid::new(), object.file_group_id, "main", Utc::now());
        file.server_file_version = Some(server_version);
        directory::upsert_file(&mut conn, &file).await.unwrap();
        (object.file_group_id, file.file_uuid)
    }

    #[tokio::test]
    async fn test_queue_download_validation() {
        let engine = engine_with(MockServer::new(), None).await;
        let (group, file) = seed(&engine, 2).await;

        let empty = ObjectDownload { file_group_id: group, files: vec![] };
        assert!(matches!(engine.queue_download(empty).await, Err(SyncError::NoDownloads)));

        let duplicate = ObjectDownload {
            file_group_id: group,
            files: vec![
                FileDownload { file_uuid: file, file_version: 2 },
                FileDownload { file_uuid: file, file_version: 2 },
            ],
        };
        assert!(matches!(
            engine.queue_download(duplicate).await,
            Err(SyncError::DuplicateUuids { .. })
        ));

        let unknown_group = ObjectDownload {
            file_group_id: FileGroupId::new(),
            files: vec![FileDownload { file_uuid: file, file_version: 2 }],
        };
        assert!(matches!(
            engine.queue_download(unknown_group).await,
            Err(SyncError::UnknownFileGroup { .. })
        ));

        let stale = ObjectDownload {
            file_group_id: group,
            files: vec![FileDownload { file_uuid: file, file_version: 1 }],
        };
        assert!(matches!(
            engine.queue_download(stale).await,
            Err(SyncError::DownloadVersionMismatch { requested: 1, server: Some(2), .. })
        ));

        let mut conn = engine.inner.pool.acquire().await.unwrap();
        assert_eq!(download_tracker::count_all(&mut conn).await.unwrap(), 0);
    }
}
