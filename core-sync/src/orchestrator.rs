//! # Sync Orchestrator
//!
//! `sync()` is pure reconciliation and safe to call repeatedly:
//!
//! 1. Refresh sharing groups (and the file index of one group) from the server.
//! 2. Start or resend deletions whose objects are clear of transfers.
//! 3. Retry stalled uploads, resume started batches, start queued batches.
//! 4. Start queued downloads, then reset stalled downloads for the next pass.
//! 5. Keep deferred polling alive while deferred work exists.
//!
//! Steps 2 to 4 run in one transaction under the queue guard, so two passes
//! can never both decide to start work for the same object.

use crate::directory::{self, DirectoryFileEntry, DirectoryObjectEntry, SharingEntry};
use crate::engine::{Effects, SyncEngine};
use crate::ids::{FileGroupId, FileUuid, SharingGroupId};
use crate::{declaration, deletion_tracker, download_tracker, upload_tracker, Result, SyncError};
use bridge_traits::server::{IndexObject, IndexResult, MoveFileGroupsRequest, MoveFileGroupsResult};
use core_runtime::events::{CoreEvent, SyncEvent};
use sqlx::SqliteConnection;
use std::collections::HashSet;
use tracing::{debug, info, instrument, warn};

impl SyncEngine {
    /// Run one reconciliation pass, optionally refreshing the file index of
    /// `sharing_group_id`.
    ///
    /// Server and network failures are reported as events; the pass still runs
    /// with what is stored locally.
    #[instrument(skip(self))]
    pub async fn sync(&self, sharing_group_id: Option<SharingGroupId>) -> Result<()> {
        let network_usable = self.network_usable().await;

        if network_usable {
            match self
                .inner
                .server
                .index(sharing_group_id.map(Into::into))
                .await
            {
                Ok(index) => self.apply_index(index, sharing_group_id).await?,
                Err(e) => {
                    let mut effects = Effects::default();
                    effects.user_error(format!("Index request failed: {}", e), None);
                    self.finish(effects);
                }
            }
        } else {
            debug!("Network unusable, skipping index and new work");
        }

        {
            let queue = self.lock_queue().await;
            let mut tx = self.inner.pool.begin().await?;
            let mut effects = Effects::default();

            if network_usable {
                self.trigger_deletions(&mut tx, &mut effects).await?;
                self.trigger_uploads(&mut tx, &mut effects).await?;
                self.trigger_downloads(&mut tx, &mut effects).await?;
            }
            self.reset_expired_downloads(&mut tx).await?;

            tx.commit().await?;
            drop(queue);
            self.finish(effects);
        }

        if self.inner.limits.auto_deferred_polling {
            if self.has_deferred_work().await? {
                self.start_deferred_polling();
            }
        } else if network_usable {
            if let Err(e) = self.check_on_deferred_uploads().await {
                warn!(error = %e, "Inline deferred upload check failed");
            }
            if let Err(e) = self.check_on_deferred_deletions().await {
                warn!(error = %e, "Inline deferred deletion check failed");
            }
        }

        let objects_needing_download = self.objects_needing_download(sharing_group_id).await?.len();
        info!(objects_needing_download, "Sync pass completed");
        self.emit(CoreEvent::Sync(SyncEvent::Completed {
            sharing_group_id: sharing_group_id.map(Into::into),
            objects_needing_download,
        }));
        Ok(())
    }

    async fn apply_index(
        &self,
        index: IndexResult,
        sharing_group_id: Option<SharingGroupId>,
    ) -> Result<()> {
        let queue = self.lock_queue().await;
        let mut tx = self.inner.pool.begin().await?;

        merge_sharing_groups(&mut tx, &index).await?;

        if let Some(objects) = &index.file_index {
            if sharing_group_id.is_none() {
                warn!("File index returned without a sharing group, merging anyway");
            }
            for object in objects {
                merge_index_object(&mut tx, object).await?;
            }
            debug!(objects = objects.len(), "File index merged");
        }

        tx.commit().await?;
        drop(queue);
        Ok(())
    }

    /// Move objects to another sharing group.
    ///
    /// Every object must share one source group, be live and have no
    /// outstanding transfers or deletions. The directory and declarations are
    /// updated only when the server reports success.
    #[instrument(skip(self, file_group_ids), fields(count = file_group_ids.len()))]
    pub async fn move_file_groups(
        &self,
        file_group_ids: Vec<FileGroupId>,
        dest_sharing_group_id: SharingGroupId,
    ) -> Result<MoveFileGroupsResult> {
        if file_group_ids.is_empty() {
            return Err(SyncError::InvalidMove("No file groups given".to_string()));
        }

        let source_sharing_group_id = {
            let _queue = self.lock_queue().await;
            let mut conn = self.inner.pool.acquire().await?;
            validate_move(&mut conn, &file_group_ids, dest_sharing_group_id).await?
        };

        let result = self
            .inner
            .server
            .move_file_groups(MoveFileGroupsRequest {
                file_group_ids: file_group_ids.iter().map(|&id| id.into()).collect(),
                source_sharing_group_id: source_sharing_group_id.into(),
                dest_sharing_group_id: dest_sharing_group_id.into(),
            })
            .await?;

        if result == MoveFileGroupsResult::Success {
            let queue = self.lock_queue().await;
            let mut tx = self.inner.pool.begin().await?;
            for &file_group_id in &file_group_ids {
                directory::set_object_sharing_group(&mut tx, file_group_id, dest_sharing_group_id)
                    .await?;
                declaration::set_declaration_sharing_group(
                    &mut tx,
                    file_group_id,
                    dest_sharing_group_id,
                )
                .await?;
            }
            tx.commit().await?;
            drop(queue);
            info!(dest = %dest_sharing_group_id, "File groups moved");
        } else {
            warn!(?result, "Server refused to move file groups");
        }

        Ok(result)
    }
}

async fn merge_sharing_groups(conn: &mut SqliteConnection, index: &IndexResult) -> Result<()> {
    let mut seen = HashSet::new();

    for group in &index.sharing_groups {
        let sharing_group_id = SharingGroupId::from(group.sharing_group_id);
        seen.insert(sharing_group_id);
        directory::upsert_sharing_entry(
            conn,
            &SharingEntry {
                sharing_group_id,
                name: group.name.clone(),
                permission: group.permission,
                deleted: group.deleted,
                cloud_storage_type: group.cloud_storage_type.clone(),
                members: group.members.clone(),
            },
        )
        .await?;
    }

    for mut entry in directory::all_sharing_entries(conn).await? {
        if !seen.contains(&entry.sharing_group_id) && !entry.deleted {
            info!(sharing_group_id = %entry.sharing_group_id, "Sharing group no longer on server");
            entry.deleted = true;
            directory::upsert_sharing_entry(conn, &entry).await?;
        }
    }

    Ok(())
}

/// Fold one object of the server's file index into the directory.
async fn merge_index_object(conn: &mut SqliteConnection, object: &IndexObject) -> Result<()> {
    let file_group_id = FileGroupId::from(object.file_group_id);
    let sharing_group_id = SharingGroupId::from(object.sharing_group_id);

    let mut entry = directory::find_object(conn, file_group_id)
        .await?
        .unwrap_or_else(|| {
            DirectoryObjectEntry::new(file_group_id, sharing_group_id, object.object_type.clone())
        });
    if entry.sharing_group_id != sharing_group_id {
        info!(
            %file_group_id,
            from = %entry.sharing_group_id,
            to = %sharing_group_id,
            "Object moved on server"
        );
        declaration::set_declaration_sharing_group(conn, file_group_id, sharing_group_id).await?;
        entry.sharing_group_id = sharing_group_id;
    }
    entry.deleted_on_server |= object.deleted;
    if entry.object_type.is_none() {
        entry.object_type = object.object_type.clone();
    }
    directory::upsert_object(conn, &entry).await?;

    for file in &object.files {
        let file_uuid = FileUuid::from(file.file_uuid);
        let deleted = file.deleted || object.deleted;

        let mut file_entry = match directory::find_file(conn, file_uuid).await? {
            Some(existing) => existing,
            None => DirectoryFileEntry::new(
                file_uuid,
                file_group_id,
                file.file_label.clone(),
                file.creation_date,
            ),
        };
        file_entry.server_file_version = Some(
            file_entry
                .server_file_version
                .map_or(file.file_version, |known| known.max(file.file_version)),
        );
        file_entry.deleted_on_server |= deleted;
        if file.update_date.is_some() {
            file_entry.update_date = file.update_date;
        }
        directory::upsert_file(conn, &file_entry).await?;
    }

    Ok(())
}

/// Returns the common source sharing group.
async fn validate_move(
    conn: &mut SqliteConnection,
    file_group_ids: &[FileGroupId],
    dest_sharing_group_id: SharingGroupId,
) -> Result<SharingGroupId> {
    let dest = directory::find_sharing_entry(conn, dest_sharing_group_id)
        .await?
        .ok_or_else(|| SyncError::UnknownSharingGroup {
            sharing_group_id: dest_sharing_group_id.as_str(),
        })?;
    if dest.deleted {
        return Err(SyncError::SharingGroupDeleted {
            sharing_group_id: dest_sharing_group_id.as_str(),
        });
    }

    let mut source: Option<SharingGroupId> = None;
    for &file_group_id in file_group_ids {
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

        match source {
            None => source = Some(object.sharing_group_id),
            Some(sharing_group_id) if sharing_group_id != object.sharing_group_id => {
                return Err(SyncError::InvalidMove(
                    "File groups belong to different sharing groups".to_string(),
                ));
            }
            Some(_) => {}
        }

        let pending = upload_tracker::count_for_group(conn, file_group_id).await?
            + download_tracker::count_for_group(conn, file_group_id).await?
            + i64::from(
                deletion_tracker::find_for_group(conn, file_group_id)
                    .await?
                    .is_some(),
            );
        if pending > 0 {
            return Err(SyncError::OperationsPending {
                file_group_id: file_group_id.as_str(),
            });
        }
    }

    let source = source.ok_or_else(|| SyncError::InvalidMove("No file groups given".to_string()))?;
    if source == dest_sharing_group_id {
        return Err(SyncError::InvalidMove(
            "Destination is the current sharing group".to_string(),
        ));
    }

    Ok(source)
}
