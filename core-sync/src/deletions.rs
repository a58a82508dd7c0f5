//! # Deletion Pipeline
//!
//! Object deletions are persisted first and sent only when no upload or
//! download for the object is outstanding. That condition is checked inside
//! the same transaction that flips the tracker to `deleting`.

use crate::deletion_tracker::{self, DeletionStatus, DeletionTracker};
use crate::directory;
use crate::engine::{Effects, Request, SyncEngine};
use crate::ids::{DeferredUploadId, FileGroupId, TrackerId};
use crate::uploads::absorb_internal;
use crate::{download_tracker, upload_tracker, Result, SyncError};
use bridge_traits::error::Result as BridgeResult;
use bridge_traits::server::{DeletionRequest, DeletionResult};
use core_runtime::events::{CoreEvent, DeletionEvent};
use sqlx::SqliteConnection;
use tracing::{debug, info, instrument};

impl SyncEngine {
    /// Queue deletion of an object. `push_notification_message`, when given,
    /// is sent to the sharing group once the deletion completes.
    ///
    /// # Errors
    ///
    /// Validation errors leave no state behind.
    #[instrument(skip(self, push_notification_message))]
    pub async fn queue_deletion(
        &self,
        file_group_id: FileGroupId,
        push_notification_message: Option<String>,
    ) -> Result<()> {
        let network_usable = self.network_usable().await;

        let queue = self.lock_queue().await;
        let mut tx = self.inner.pool.begin().await?;
        let mut effects = Effects::default();

        let object = directory::find_object(&mut tx, file_group_id)
            .await?
            .ok_or_else(|| SyncError::UnknownFileGroup {
                file_group_id: file_group_id.as_str(),
            })?;

        let sharing_group_id = object.sharing_group_id;
        match directory::find_sharing_entry(&mut tx, sharing_group_id).await? {
            None => {
                return Err(SyncError::UnknownSharingGroup {
                    sharing_group_id: sharing_group_id.as_str(),
                })
            }
            Some(entry) if entry.deleted => {
                return Err(SyncError::SharingGroupDeleted {
                    sharing_group_id: sharing_group_id.as_str(),
                })
            }
            Some(_) => {}
        }

        let files = directory::files_for_object(&mut tx, file_group_id).await?;
        if object.is_deleted() || files.iter().any(|f| f.is_deleted()) {
            return Err(SyncError::FileGroupDeleted {
                file_group_id: file_group_id.as_str(),
            });
        }
        if deletion_tracker::find_for_group(&mut tx, file_group_id)
            .await?
            .is_some()
        {
            return Err(SyncError::DeletionAlreadyQueued {
                file_group_id: file_group_id.as_str(),
            });
        }

        let tracker = DeletionTracker::new(
            file_group_id,
            push_notification_message,
            self.inner.clock.now(),
        );
        deletion_tracker::insert(&mut tx, &tracker).await?;
        info!("Deletion queued");

        if network_usable {
            self.start_deletion_if_clear(&mut tx, &tracker, &mut effects)
                .await?;
        }

        tx.commit().await?;
        drop(queue);
        self.finish(effects);
        Ok(())
    }

    /// Start a `notStarted` deletion unless transfers for its object are outstanding.
    async fn start_deletion_if_clear(
        &self,
        conn: &mut SqliteConnection,
        tracker: &DeletionTracker,
        effects: &mut Effects,
    ) -> Result<bool> {
        let file_group_id = tracker.file_group_id;
        let uploads = upload_tracker::count_for_group(conn, file_group_id).await?;
        let downloads = download_tracker::count_for_group(conn, file_group_id).await?;

        if uploads > 0 || downloads > 0 {
            debug!(%file_group_id, uploads, downloads, "Deletion waiting for transfers");
            return Ok(false);
        }

        self.send_deletion(conn, tracker, effects).await?;
        Ok(true)
    }

    async fn send_deletion(
        &self,
        conn: &mut SqliteConnection,
        tracker: &DeletionTracker,
        effects: &mut Effects,
    ) -> Result<()> {
        let object = directory::find_object(conn, tracker.file_group_id)
            .await?
            .ok_or_else(|| {
                SyncError::Internal(format!(
                    "Deletion tracker {} has no directory object",
                    tracker.id
                ))
            })?;

        let expiry = self
            .inner
            .clock
            .deadline_after(self.inner.limits.deletion_expiry);
        deletion_tracker::set_status(conn, tracker.id, DeletionStatus::Deleting, Some(expiry))
            .await?;

        info!(file_group_id = %tracker.file_group_id, "Deletion started");
        effects.request(Request::Deletion {
            tracker_id: tracker.id,
            request: DeletionRequest {
                file_group_id: tracker.file_group_id.into(),
                sharing_group_id: object.sharing_group_id.into(),
                tracker_id: tracker.id.into(),
            },
        });
        Ok(())
    }

    /// Apply the server's answer to a deletion request.
    pub(crate) async fn complete_deletion(
        &self,
        tracker_id: TrackerId,
        result: BridgeResult<DeletionResult>,
    ) -> Result<()> {
        let queue = self.lock_queue().await;
        let mut tx = self.inner.pool.begin().await?;
        let mut effects = Effects::default();

        let Some(tracker) = deletion_tracker::find(&mut tx, tracker_id).await? else {
            debug!(tracker = %tracker_id, "Deletion result for a tracker that no longer exists");
            return Ok(());
        };

        match result {
            Err(e) => {
                deletion_tracker::set_status(&mut tx, tracker.id, DeletionStatus::NotStarted, None)
                    .await?;
                effects.user_error(
                    format!("Deletion of {} failed: {}", tracker.file_group_id, e),
                    Some(tracker.file_group_id),
                );
            }
            Ok(DeletionResult {
                deferred_upload_id: Some(id),
            }) => {
                let id = DeferredUploadId::from(id);
                deletion_tracker::set_waiting_for_deferred(&mut tx, tracker.id, id).await?;
                info!(file_group_id = %tracker.file_group_id, deferred = %id, "Deletion deferred");
                effects.start_polling = true;
            }
            Ok(DeletionResult {
                deferred_upload_id: None,
            }) => {
                finalize_deletion(&mut tx, &tracker, &mut effects).await?;
            }
        }

        tx.commit().await?;
        drop(queue);
        self.finish(effects);
        Ok(())
    }

    /// Start deletions whose objects are clear of transfers and resend stalled ones.
    pub(crate) async fn trigger_deletions(
        &self,
        conn: &mut SqliteConnection,
        effects: &mut Effects,
    ) -> Result<()> {
        let now = self.now_millis();

        for tracker in deletion_tracker::all(conn).await? {
            let result = match tracker.status {
                DeletionStatus::NotStarted => self
                    .start_deletion_if_clear(conn, &tracker, effects)
                    .await
                    .map(|_| ()),
                DeletionStatus::Deleting if tracker.is_expired(now) => {
                    info!(file_group_id = %tracker.file_group_id, "Retrying expired deletion");
                    self.send_deletion(conn, &tracker, effects).await
                }
                _ => Ok(()),
            };
            absorb_internal(result, effects)?;
        }

        Ok(())
    }

    /// Acknowledge locally an object the server reported as deleted.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotDeletedOnServer`] unless the object is deleted
    /// on the server and not yet acknowledged.
    #[instrument(skip(self))]
    pub async fn object_deleted_locally(&self, file_group_id: FileGroupId) -> Result<()> {
        let queue = self.lock_queue().await;
        let mut tx = self.inner.pool.begin().await?;

        let object = directory::find_object(&mut tx, file_group_id)
            .await?
            .ok_or_else(|| SyncError::UnknownFileGroup {
                file_group_id: file_group_id.as_str(),
            })?;
        if !object.deleted_on_server || object.deleted_locally {
            return Err(SyncError::NotDeletedOnServer {
                file_group_id: file_group_id.as_str(),
            });
        }

        directory::mark_object_deleted(&mut tx, file_group_id, true, false).await?;
        let dropped = download_tracker::delete_for_group(&mut tx, file_group_id).await?;

        tx.commit().await?;
        drop(queue);
        info!(dropped_downloads = dropped, "Object deletion acknowledged locally");
        Ok(())
    }
}

/// The server has deleted the object: mark it, drop the tracker, notify.
pub(crate) async fn finalize_deletion(
    conn: &mut SqliteConnection,
    tracker: &DeletionTracker,
    effects: &mut Effects,
) -> Result<()> {
    let file_group_id = tracker.file_group_id;

    directory::mark_object_deleted(conn, file_group_id, true, true).await?;
    deletion_tracker::delete(conn, tracker.id).await?;

    if let Some(message) = &tracker.push_notification_message {
        if let Some(object) = directory::find_object(conn, file_group_id).await? {
            effects.request(Request::PushNotification {
                message: message.clone(),
                sharing_group_id: object.sharing_group_id.into(),
                file_group_id,
            });
        }
    }

    info!(%file_group_id, "Deletion completed");
    effects.event(CoreEvent::Deletion(DeletionEvent::Completed {
        file_group_id: file_group_id.into(),
    }));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{DirectoryFileEntry, DirectoryObjectEntry, SharingEntry};
    use crate::download_tracker::{
        DownloadFileTracker, DownloadObject, DownloadObjectTracker, DownloadStatus,
    };
    use crate::engine::test_support::{engine_with, MockServer};
    use crate::ids::{FileUuid, SharingGroupId};
    use bridge_traits::server::Permission;
    use chrono::Utc;

    async fn seed_object(engine: &SyncEngine, deleted_on_server: bool) -> FileGroupId {
        let mut conn = engine.inner.pool.acquire().await.unwrap();
        let sharing_group_id = SharingGroupId::new();
        directory::upsert_sharing_entry(
            &mut conn,
            &SharingEntry {
                sharing_group_id,
                name: None,
                permission: Permission::Write,
                deleted: false,
                cloud_storage_type: None,
                members: vec![],
            },
        )
        .await
        .unwrap();

        let file_group_id = FileGroupId::new();
        let mut object = DirectoryObjectEntry::new(file_group_id, sharing_group_id, None);
        object.deleted_on_server = deleted_on_server;
        directory::upsert_object(&mut conn, &object).await.unwrap();

        let mut file = DirectoryFileEntry::new(FileUuid::new(), file_group_id, "body", Utc::now());
        file.server_file_version = Some(1);
        directory::upsert_file(&mut conn, &file).await.unwrap();
        file_group_id
    }

    #[tokio::test]
    async fn test_object_deleted_locally_requires_server_deletion() {
        let engine = engine_with(MockServer::new(), None).await;
        let live = seed_object(&engine, false).await;

        assert!(matches!(
            engine.object_deleted_locally(live).await,
            Err(SyncError::NotDeletedOnServer { .. })
        ));
        assert!(matches!(
            engine.object_deleted_locally(FileGroupId::new()).await,
            Err(SyncError::UnknownFileGroup { .. })
        ));
    }

    #[tokio::test]
    async fn test_object_deleted_locally_drops_downloads() {
        let engine = engine_with(MockServer::new(), None).await;
        let gone = seed_object(&engine, true).await;

        {
            let mut conn = engine.inner.pool.acquire().await.unwrap();
            let tracker = DownloadObjectTracker {
                id: TrackerId::new(),
                file_group_id: gone,
                created_at: Utc::now(),
            };
            let files = vec![DownloadFileTracker {
                id: TrackerId::new(),
                object_tracker_id: tracker.id,
                file_uuid: FileUuid::new(),
                file_version: 1,
                status: DownloadStatus::NotStarted,
                expiry: None,
                local_path: None,
                app_meta_data: None,
                gone_reason: None,
            }];
            download_tracker::insert_object(&mut conn, &DownloadObject { tracker, files })
                .await
                .unwrap();
        }

        engine.object_deleted_locally(gone).await.unwrap();

        let mut conn = engine.inner.pool.acquire().await.unwrap();
        let object = directory::find_object(&mut conn, gone).await.unwrap().unwrap();
        assert!(object.deleted_locally && object.deleted_on_server);
        assert_eq!(download_tracker::count_for_group(&mut conn, gone).await.unwrap(), 0);
        drop(conn);

        // Acknowledging twice is rejected.
        assert!(matches!(
            engine.object_deleted_locally(gone).await,
            Err(SyncError::NotDeletedOnServer { .. })
        ));
    }

    #[tokio::test]
    async fn test_queue_deletion_validation() {
        let engine = engine_with(MockServer::new(), None).await;
        assert!(matches!(
            engine.queue_deletion(FileGroupId::new(), None).await,
            Err(SyncError::UnknownFileGroup { .. })
        ));

        let gone = seed_object(&engine, true).await;
        assert!(matches!(
            engine.queue_deletion(gone, None).await,
            Err(SyncError::FileGroupDeleted { .. })
        ));
        assert_eq!(
            engine
                .number_queued(crate::queries::QueueKind::Deletion)
                .await
                .unwrap(),
            0
        );
    }
}
