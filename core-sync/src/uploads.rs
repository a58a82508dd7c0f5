//! # Upload Pipeline
//!
//! Queues upload batches, starts them within the object-level concurrency
//! limit, applies server responses and retries stalled files.
//!
//! ## Versions
//!
//! A batch is a *v0* upload when no file of the object has a version yet on
//! either side and no other batch of the object is pending. The flag is fixed
//! when the batch is queued. Each file request
//! carries full first-version metadata only if that file has never been
//! versioned; later versions send content and checksum only, and their commit
//! is deferred on the server (see [`crate::deferred`]).
//!
//! ## Ordering
//!
//! At most one batch per object is in flight. A batch queued while another
//! batch of the same object exists is persisted and reported as queued; a
//! later trigger pass starts it, oldest first.

use crate::checksum::sha256_file;
use crate::declaration::{self, DeclaredObject};
use crate::directory::{self, DirectoryFileEntry, DirectoryObjectEntry};
use crate::engine::{Effects, Request, SyncEngine};
use crate::ids::{BatchId, DeferredUploadId, FileGroupId, FileUuid, SharingGroupId, TrackerId};
use crate::upload_tracker::{
    self, UploadFileTracker, UploadObject, UploadObjectTracker, UploadStatus,
};
use crate::{deletion_tracker, Result, SyncError};
use bridge_traits::error::Result as BridgeResult;
use bridge_traits::server::{
    DeferredStatus, FileUploadRequest, FirstVersionInfo, UploadBatch, UploadFileResult,
    UploadVersion,
};
use chrono::{DateTime, Utc};
use core_runtime::events::{
    CoreEvent, DeferredEvent, DeferredOperation, UploadEvent, UploadOutcome,
};
use core_runtime::logging::strip_path;
use sqlx::SqliteConnection;
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::{debug, info, instrument, warn};

/// One file of an upload request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUpload {
    pub file_uuid: FileUuid,
    /// Must match the declared label for `file_uuid`.
    pub file_label: String,
    pub mime_type: String,
    /// Content to upload. Must stay readable until the upload completes.
    pub local_path: PathBuf,
    pub app_meta_data: Option<String>,
    pub inform_all_but_self: bool,
}

impl FileUpload {
    pub fn new(
        file_uuid: FileUuid,
        file_label: impl Into<String>,
        mime_type: impl Into<String>,
        local_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            file_uuid,
            file_label: file_label.into(),
            mime_type: mime_type.into(),
            local_path: local_path.into(),
            app_meta_data: None,
            inform_all_but_self: false,
        }
    }

    pub fn with_app_meta_data(mut self, app_meta_data: impl Into<String>) -> Self {
        self.app_meta_data = Some(app_meta_data.into());
        self
    }

    pub fn inform_all_but_self(mut self, inform: bool) -> Self {
        self.inform_all_but_self = inform;
        self
    }
}

/// Request-shape checks that need no stored state.
fn validate_uploads(files: &[FileUpload], declaration: &DeclaredObject) -> Result<()> {
    if files.is_empty() {
        return Err(SyncError::NoUploads);
    }
    declaration.validate()?;

    let mut seen = HashSet::new();
    for file in files {
        if !seen.insert(file.file_uuid) {
            return Err(SyncError::DuplicateUuids {
                file_uuid: file.file_uuid.as_str(),
            });
        }

        let declared = declaration
            .file(file.file_uuid)
            .ok_or_else(|| SyncError::FileNotDeclared {
                file_uuid: file.file_uuid.as_str(),
            })?;

        if declared.file_label != file.file_label {
            return Err(SyncError::FileMismatch {
                file_uuid: file.file_uuid.as_str(),
                reason: format!(
                    "label '{}' is declared as '{}'",
                    file.file_label, declared.file_label
                ),
            });
        }
        if !declared.mime_types.contains(&file.mime_type) {
            return Err(SyncError::FileMismatch {
                file_uuid: file.file_uuid.as_str(),
                reason: format!("mime type '{}' is not declared", file.mime_type),
            });
        }
    }

    Ok(())
}

/// Stored data every request of a batch is built from.
struct UploadContext {
    declaration: DeclaredObject,
    /// Current group of the object, which may differ from the one queued with.
    sharing_group_id: SharingGroupId,
    cloud_storage_type: Option<String>,
}

impl UploadContext {
    async fn load(conn: &mut SqliteConnection, tracker: &UploadObjectTracker) -> Result<Self> {
        let declaration = declaration::find_declaration(conn, tracker.file_group_id)
            .await?
            .ok_or_else(|| {
                SyncError::Internal(format!(
                    "Upload tracker {} has no declaration for {}",
                    tracker.id, tracker.file_group_id
                ))
            })?;
        let sharing_group_id = directory::find_object(conn, tracker.file_group_id)
            .await?
            .map_or(tracker.sharing_group_id, |object| object.sharing_group_id);
        let cloud_storage_type = directory::find_sharing_entry(conn, sharing_group_id)
            .await?
            .and_then(|entry| entry.cloud_storage_type);

        Ok(Self {
            declaration,
            sharing_group_id,
            cloud_storage_type,
        })
    }
}

/// Record an invariant violation and carry on; other errors abort the pass.
pub(crate) fn absorb_internal(result: Result<()>, effects: &mut Effects) -> Result<()> {
    match result {
        Err(SyncError::Internal(message)) => {
            effects.internal_error(message);
            Ok(())
        }
        other => other,
    }
}

impl SyncEngine {
    /// Queue a batch of file uploads for one object.
    ///
    /// The batch starts immediately when no other batch of the object exists,
    /// the concurrency limit allows and the network is usable; otherwise it is
    /// persisted and an [`UploadEvent::Queued`] is emitted.
    ///
    /// # Errors
    ///
    /// Validation errors leave no state behind. See [`SyncError::is_validation`].
    #[instrument(
        skip(self, files, declaration),
        fields(file_group_id = %declaration.file_group_id)
    )]
    pub async fn queue_upload(
        &self,
        files: Vec<FileUpload>,
        declaration: DeclaredObject,
    ) -> Result<()> {
        validate_uploads(&files, &declaration)?;

        let mut checksums = Vec::with_capacity(files.len());
        for file in &files {
            checksums.push(sha256_file(&file.local_path).await?);
        }
        let network_usable = self.network_usable().await;

        let queue = self.lock_queue().await;
        let mut tx = self.inner.pool.begin().await?;
        let mut effects = Effects::default();

        self.persist_upload(
            &mut tx,
            &files,
            checksums,
            &declaration,
            network_usable,
            &mut effects,
        )
        .await?;

        tx.commit().await?;
        drop(queue);
        self.finish(effects);
        Ok(())
    }

    async fn persist_upload(
        &self,
        conn: &mut SqliteConnection,
        files: &[FileUpload],
        checksums: Vec<String>,
        declaration: &DeclaredObject,
        network_usable: bool,
        effects: &mut Effects,
    ) -> Result<()> {
        let file_group_id = declaration.file_group_id;
        let stored_object = directory::find_object(conn, file_group_id).await?;
        // A known object lives wherever the directory last saw it.
        let sharing_group_id = stored_object
            .as_ref()
            .map_or(declaration.sharing_group_id, |object| object.sharing_group_id);

        let sharing = directory::find_sharing_entry(conn, sharing_group_id)
            .await?
            .ok_or_else(|| SyncError::UnknownSharingGroup {
                sharing_group_id: sharing_group_id.as_str(),
            })?;
        if sharing.deleted {
            return Err(SyncError::SharingGroupDeleted {
                sharing_group_id: sharing_group_id.as_str(),
            });
        }
        if declaration.sharing_group_id != sharing_group_id {
            return Err(SyncError::DeclarationMismatch {
                file_group_id: file_group_id.as_str(),
                reason: format!(
                    "declared sharing group {} but the object is in {}",
                    declaration.sharing_group_id, sharing_group_id
                ),
            });
        }

        match declaration::find_declaration(conn, file_group_id).await? {
            Some(stored) => {
                if let Some(reason) = declaration.mismatch(&stored) {
                    return Err(SyncError::DeclarationMismatch {
                        file_group_id: file_group_id.as_str(),
                        reason,
                    });
                }
            }
            None => declaration::insert_declaration(conn, declaration).await?,
        }

        match stored_object {
            Some(object) if object.is_deleted() => {
                return Err(SyncError::FileGroupDeleted {
                    file_group_id: file_group_id.as_str(),
                });
            }
            Some(_) => {}
            None => {
                let object = DirectoryObjectEntry::new(
                    file_group_id,
                    sharing_group_id,
                    Some(declaration.object_type.clone()),
                );
                directory::upsert_object(conn, &object).await?;
            }
        }

        if deletion_tracker::find_for_group(conn, file_group_id)
            .await?
            .is_some()
        {
            return Err(SyncError::DeletionPending {
                file_group_id: file_group_id.as_str(),
            });
        }

        let existing = upload_tracker::objects_for_group(conn, file_group_id).await?;
        let never_versioned = directory::files_for_object(conn, file_group_id)
            .await?
            .iter()
            .all(|entry| !entry.has_version());
        // Any earlier batch produces a version before this one is sent.
        let v0_upload = never_versioned && existing.is_empty();

        let now = self.inner.clock.now();
        for file in files {
            self.check_directory_file(conn, file, declaration, now).await?;
        }

        let active = upload_tracker::all_objects(conn)
            .await?
            .iter()
            .filter(|object| object.is_in_progress())
            .count();

        let object = new_upload_object(
            declaration,
            files,
            checksums,
            v0_upload,
            self.inner.limits.batch_expiry_interval,
            now,
        );
        upload_tracker::insert_object(conn, &object).await?;

        info!(
            batch = %object.tracker.batch_uuid,
            file_count = object.files.len(),
            v0_upload,
            "Upload batch queued"
        );

        let can_start = existing.is_empty()
            && active < self.inner.limits.max_concurrent_file_group_uploads
            && network_usable;

        if can_start {
            self.start_upload_object(conn, &object, effects).await
        } else {
            debug!(
                other_batches = existing.len(),
                active, network_usable, "Upload batch held back"
            );
            effects.event(CoreEvent::Upload(UploadEvent::Queued {
                file_group_id: file_group_id.into(),
            }));
            Ok(())
        }
    }

    /// Validate a file against its directory entry, creating the entry for a new file.
    async fn check_directory_file(
        &self,
        conn: &mut SqliteConnection,
        file: &FileUpload,
        declaration: &DeclaredObject,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let file_uuid = file.file_uuid;
        let multi_version = declaration
            .file(file_uuid)
            .and_then(|declared| declared.change_resolver_name.as_ref())
            .is_some();

        let Some(entry) = directory::find_file(conn, file_uuid).await? else {
            let entry = DirectoryFileEntry::new(
                file_uuid,
                declaration.file_group_id,
                file.file_label.clone(),
                now,
            );
            return directory::upsert_file(conn, &entry).await;
        };

        if entry.file_group_id != declaration.file_group_id {
            return Err(SyncError::FileMismatch {
                file_uuid: file_uuid.as_str(),
                reason: format!("file belongs to {}", entry.file_group_id),
            });
        }
        if entry.is_deleted() {
            return Err(SyncError::FileGroupDeleted {
                file_group_id: entry.file_group_id.as_str(),
            });
        }
        if entry.is_undownloaded() {
            return Err(SyncError::AttemptToQueueUndownloadedFile {
                file_uuid: file_uuid.as_str(),
            });
        }
        if !multi_version
            && (entry.has_version() || upload_tracker::file_has_tracker(conn, file_uuid).await?)
        {
            return Err(SyncError::VersionedFileWithoutResolver {
                file_uuid: file_uuid.as_str(),
            });
        }

        Ok(())
    }

    /// Start every not-yet-started file of a batch.
    async fn start_upload_object(
        &self,
        conn: &mut SqliteConnection,
        object: &UploadObject,
        effects: &mut Effects,
    ) -> Result<()> {
        let context = UploadContext::load(conn, &object.tracker).await?;

        let mut started = 0;
        for file in &object.files {
            if file.status == UploadStatus::NotStarted {
                self.start_upload_file(conn, &object.tracker, file, &context, effects)
                    .await?;
                started += 1;
            }
        }

        info!(
            file_group_id = %object.tracker.file_group_id,
            started, "Upload batch started"
        );
        effects.event(CoreEvent::Upload(UploadEvent::Started {
            file_group_id: object.tracker.file_group_id.into(),
            file_count: started,
        }));
        Ok(())
    }

    /// Mark a file `uploading` with a fresh expiry and schedule its request.
    async fn start_upload_file(
        &self,
        conn: &mut SqliteConnection,
        tracker: &UploadObjectTracker,
        file: &UploadFileTracker,
        context: &UploadContext,
        effects: &mut Effects,
    ) -> Result<()> {
        let request = build_upload_request(conn, tracker, file, context).await?;
        let expiry = self.inner.clock.deadline_after(self.inner.limits.upload_expiry);
        upload_tracker::set_file_status(conn, file.id, UploadStatus::Uploading, Some(expiry))
            .await?;

        let path = file.local_path.to_string_lossy();
        debug!(
            file_uuid = %file.file_uuid,
            path = strip_path(&path),
            "Upload scheduled"
        );
        effects.request(Request::Upload {
            file_tracker_id: file.id,
            request,
        });
        Ok(())
    }

    /// Apply the server's answer to one file upload.
    pub(crate) async fn complete_upload(
        &self,
        file_tracker_id: TrackerId,
        result: BridgeResult<UploadFileResult>,
    ) -> Result<()> {
        let queue = self.lock_queue().await;
        let mut tx = self.inner.pool.begin().await?;
        let mut effects = Effects::default();

        let Some(file) = upload_tracker::find_file(&mut tx, file_tracker_id).await? else {
            debug!(tracker = %file_tracker_id, "Upload result for a tracker that no longer exists");
            return Ok(());
        };
        let Some(object) = upload_tracker::find_object(&mut tx, file.object_tracker_id).await?
        else {
            return Ok(());
        };
        let file_group_id = object.tracker.file_group_id;

        match result {
            Err(e) => {
                effects.user_error(
                    format!("Upload of file {} failed: {}", file.file_uuid, e),
                    Some(file_group_id),
                );
            }
            Ok(UploadFileResult::Gone(reason)) => {
                warn!(file_uuid = %file.file_uuid, reason = reason.as_str(), "Upload target gone");
                upload_tracker::delete_object(&mut tx, object.tracker.id).await?;
                effects.event(CoreEvent::Upload(UploadEvent::Completed {
                    file_group_id: file_group_id.into(),
                    outcome: UploadOutcome::Gone {
                        file_uuid: file.file_uuid.into(),
                        reason,
                    },
                }));
            }
            Ok(UploadFileResult::Success { .. }) if file.status == UploadStatus::Uploaded => {
                debug!(file_uuid = %file.file_uuid, "Duplicate upload result ignored");
            }
            Ok(UploadFileResult::Success {
                update_date,
                file_version,
                deferred_upload_id,
                ..
            }) => {
                upload_tracker::mark_file_uploaded(&mut tx, file.id, Some(file_version)).await?;
                if let Some(id) = deferred_upload_id.map(DeferredUploadId::from) {
                    upload_tracker::set_deferred_upload_id(&mut tx, object.tracker.id, id).await?;
                }
                debug!(file_uuid = %file.file_uuid, file_version, "File uploaded");

                let object = upload_tracker::find_object(&mut tx, object.tracker.id)
                    .await?
                    .ok_or_else(|| SyncError::Internal("Upload tracker vanished".to_string()))?;
                if object.all_uploaded() {
                    finish_upload_transfer(&mut tx, &object, Some(update_date), &mut effects)
                        .await?;
                }
            }
        }

        tx.commit().await?;
        drop(queue);
        self.finish(effects);
        Ok(())
    }

    /// Apply the server's view of an expired later-version batch.
    pub(crate) async fn complete_batch_status(
        &self,
        object_tracker_id: TrackerId,
        expired_file_ids: Vec<TrackerId>,
        result: BridgeResult<DeferredStatus>,
    ) -> Result<()> {
        let queue = self.lock_queue().await;
        let mut tx = self.inner.pool.begin().await?;
        let mut effects = Effects::default();

        let Some(object) = upload_tracker::find_object(&mut tx, object_tracker_id).await? else {
            return Ok(());
        };
        let file_group_id = object.tracker.file_group_id;
        let expired: Vec<&UploadFileTracker> = object
            .files
            .iter()
            .filter(|f| expired_file_ids.contains(&f.id) && f.status == UploadStatus::Uploading)
            .collect();

        match result {
            Err(e) => effects.user_error(
                format!("Checking batch {} failed: {}", object.tracker.batch_uuid, e),
                Some(file_group_id),
            ),
            Ok(DeferredStatus::None) => {
                info!(
                    %file_group_id,
                    retried = expired.len(),
                    "Server has no record of batch, retrying"
                );
                let context = UploadContext::load(&mut tx, &object.tracker).await?;
                for file in expired {
                    self.start_upload_file(&mut tx, &object.tracker, file, &context, &mut effects)
                        .await?;
                }
            }
            Ok(status) if status.is_pending() => {
                for file in &expired {
                    upload_tracker::mark_file_uploaded(&mut tx, file.id, None).await?;
                }
                let object = upload_tracker::find_object(&mut tx, object_tracker_id)
                    .await?
                    .ok_or_else(|| SyncError::Internal("Upload tracker vanished".to_string()))?;
                if object.all_uploaded() {
                    finish_upload_transfer(&mut tx, &object, None, &mut effects).await?;
                }
            }
            Ok(DeferredStatus::Completed) => {
                finalize_deferred_upload(&mut tx, &object).await?;
                // A fully transferred batch already reported its completion.
                if !object.all_uploaded() {
                    effects.event(CoreEvent::Upload(UploadEvent::Completed {
                        file_group_id: file_group_id.into(),
                        outcome: UploadOutcome::Success { v0_upload: false },
                    }));
                }
                effects.event(CoreEvent::Deferred(DeferredEvent::Completed {
                    operation: DeferredOperation::Upload,
                    file_group_ids: vec![file_group_id.into()],
                }));
            }
            Ok(status) => effects.internal_error(format!(
                "Batch {} for {} reported {:?}",
                object.tracker.batch_uuid, file_group_id, status
            )),
        }

        tx.commit().await?;
        drop(queue);
        self.finish(effects);
        Ok(())
    }

    /// Retry stalled files, resume partially started batches, then start
    /// queued batches oldest first within the concurrency limit.
    pub(crate) async fn trigger_uploads(
        &self,
        conn: &mut SqliteConnection,
        effects: &mut Effects,
    ) -> Result<()> {
        let now = self.now_millis();
        let objects = upload_tracker::all_objects(conn).await?;

        for object in &objects {
            let result = self.retry_expired_uploads(conn, object, now, effects).await;
            absorb_internal(result, effects)?;
        }

        for object in objects.iter().filter(|o| o.is_in_progress()) {
            let result = self.resume_upload_object(conn, object, effects).await;
            absorb_internal(result, effects)?;
        }

        let max = self.inner.limits.max_concurrent_file_group_uploads;
        let mut active = objects.iter().filter(|o| o.is_in_progress()).count();
        let mut busy_groups: HashSet<FileGroupId> = objects
            .iter()
            .filter(|o| !o.is_queued())
            .map(|o| o.tracker.file_group_id)
            .collect();

        for object in objects.iter().filter(|o| o.is_queued()) {
            if active >= max {
                debug!(active, max, "Upload concurrency limit reached");
                break;
            }
            if !busy_groups.insert(object.tracker.file_group_id) {
                continue;
            }
            let result = self.start_upload_object(conn, object, effects).await;
            absorb_internal(result, effects)?;
            active += 1;
        }

        Ok(())
    }

    async fn retry_expired_uploads(
        &self,
        conn: &mut SqliteConnection,
        object: &UploadObject,
        now: i64,
        effects: &mut Effects,
    ) -> Result<()> {
        let expired = object.expired_files(now);
        if expired.is_empty() {
            return Ok(());
        }

        match object.tracker.v0_upload {
            None => Err(SyncError::Internal(format!(
                "Upload tracker {} has no v0 flag",
                object.tracker.id
            ))),
            Some(true) => {
                info!(
                    file_group_id = %object.tracker.file_group_id,
                    files = expired.len(),
                    "Retrying expired v0 uploads"
                );
                let context = UploadContext::load(conn, &object.tracker).await?;
                for file in expired {
                    self.start_upload_file(conn, &object.tracker, file, &context, effects)
                        .await?;
                }
                Ok(())
            }
            Some(false) => {
                info!(
                    file_group_id = %object.tracker.file_group_id,
                    files = expired.len(),
                    "Checking expired batch before retry"
                );
                let expiry = self.inner.clock.deadline_after(self.inner.limits.upload_expiry);
                for file in &expired {
                    upload_tracker::set_file_status(
                        conn,
                        file.id,
                        UploadStatus::Uploading,
                        Some(expiry),
                    )
                    .await?;
                }
                effects.request(Request::BatchStatus {
                    object_tracker_id: object.tracker.id,
                    batch_uuid: object.tracker.batch_uuid.into(),
                    expired_file_ids: expired.iter().map(|f| f.id).collect(),
                });
                Ok(())
            }
        }
    }

    async fn resume_upload_object(
        &self,
        conn: &mut SqliteConnection,
        object: &UploadObject,
        effects: &mut Effects,
    ) -> Result<()> {
        let pending: Vec<&UploadFileTracker> = object
            .files
            .iter()
            .filter(|f| f.status == UploadStatus::NotStarted)
            .collect();
        if pending.is_empty() {
            return Ok(());
        }

        let context = UploadContext::load(conn, &object.tracker).await?;
        for file in pending {
            self.start_upload_file(conn, &object.tracker, file, &context, effects)
                .await?;
        }
        Ok(())
    }
}

fn new_upload_object(
    declaration: &DeclaredObject,
    files: &[FileUpload],
    checksums: Vec<String>,
    v0_upload: bool,
    batch_expiry_interval: std::time::Duration,
    now: DateTime<Utc>,
) -> UploadObject {
    let tracker = UploadObjectTracker {
        id: TrackerId::new(),
        file_group_id: declaration.file_group_id,
        sharing_group_id: declaration.sharing_group_id,
        batch_uuid: BatchId::new(),
        batch_expiry_interval,
        v0_upload: Some(v0_upload),
        deferred_upload_id: None,
        created_at: now,
    };

    let upload_count = files.len() as u32;
    let files = files
        .iter()
        .zip(checksums)
        .enumerate()
        .map(|(index, (file, checksum))| UploadFileTracker {
            id: TrackerId::new(),
            object_tracker_id: tracker.id,
            file_uuid: file.file_uuid,
            status: UploadStatus::NotStarted,
            checksum,
            local_path: file.local_path.clone(),
            mime_type: file.mime_type.clone(),
            app_meta_data: file.app_meta_data.clone(),
            expiry: None,
            upload_index: index as u32 + 1,
            upload_count,
            inform_all_but_self: file.inform_all_but_self,
            uploaded_version: None,
        })
        .collect();

    UploadObject { tracker, files }
}

async fn build_upload_request(
    conn: &mut SqliteConnection,
    tracker: &UploadObjectTracker,
    file: &UploadFileTracker,
    context: &UploadContext,
) -> Result<FileUploadRequest> {
    if tracker.v0_upload.is_none() {
        return Err(SyncError::Internal(format!(
            "Upload tracker {} has no v0 flag",
            tracker.id
        )));
    }

    let entry = directory::find_file(conn, file.file_uuid)
        .await?
        .ok_or_else(|| {
            SyncError::Internal(format!("No directory entry for uploading file {}", file.file_uuid))
        })?;
    let declared = context.declaration.file(file.file_uuid).ok_or_else(|| {
        SyncError::Internal(format!("Uploading file {} is not declared", file.file_uuid))
    })?;

    let version = if entry.has_version() {
        UploadVersion::Subsequent
    } else {
        UploadVersion::First(FirstVersionInfo {
            file_label: declared.file_label.clone(),
            object_type: context.declaration.object_type.clone(),
            change_resolver_name: declared.change_resolver_name.clone(),
            cloud_storage_type: context.cloud_storage_type.clone(),
        })
    };

    Ok(FileUploadRequest {
        file_uuid: file.file_uuid.into(),
        file_group_id: tracker.file_group_id.into(),
        sharing_group_id: context.sharing_group_id.into(),
        mime_type: file.mime_type.clone(),
        checksum: file.checksum.clone(),
        local_path: file.local_path.clone(),
        app_meta_data: file.app_meta_data.clone(),
        inform_all_but_self: file.inform_all_but_self,
        batch: UploadBatch {
            batch_uuid: tracker.batch_uuid.into(),
            batch_expiry_interval: tracker.batch_expiry_interval,
            upload_index: file.upload_index,
            upload_count: file.upload_count,
        },
        version,
    })
}

/// Every file of the batch has been transferred.
///
/// A v0 batch is committed immediately: directory versions are updated and the
/// trackers removed. Any other batch waits for its deferred commit.
async fn finish_upload_transfer(
    conn: &mut SqliteConnection,
    object: &UploadObject,
    update_date: Option<DateTime<Utc>>,
    effects: &mut Effects,
) -> Result<()> {
    let file_group_id = object.tracker.file_group_id;

    match object.tracker.v0_upload {
        None => {
            effects.internal_error(format!(
                "Upload tracker {} for {} has no v0 flag",
                object.tracker.id, file_group_id
            ));
        }
        Some(true) if object.tracker.deferred_upload_id.is_none() => {
            for file in &object.files {
                let version = file.uploaded_version.ok_or_else(|| {
                    SyncError::Internal(format!("Uploaded file {} has no version", file.file_uuid))
                })?;
                directory::set_file_version(conn, file.file_uuid, version, update_date).await?;
            }
            upload_tracker::delete_object(conn, object.tracker.id).await?;

            info!(%file_group_id, "v0 upload completed");
            effects.event(CoreEvent::Upload(UploadEvent::Completed {
                file_group_id: file_group_id.into(),
                outcome: UploadOutcome::Success { v0_upload: true },
            }));
        }
        Some(v0_upload) => {
            if object.tracker.deferred_upload_id.is_none() {
                warn!(
                    %file_group_id,
                    "Batch finished without a deferred upload id, polling by batch"
                );
            }
            info!(%file_group_id, "Upload transferred, awaiting deferred commit");
            effects.event(CoreEvent::Upload(UploadEvent::Completed {
                file_group_id: file_group_id.into(),
                outcome: UploadOutcome::Success { v0_upload },
            }));
            effects.start_polling = true;
        }
    }

    Ok(())
}

/// Apply a committed deferred upload: record versions and drop the trackers.
pub(crate) async fn finalize_deferred_upload(
    conn: &mut SqliteConnection,
    object: &UploadObject,
) -> Result<()> {
    for file in &object.files {
        let version = match file.uploaded_version {
            Some(version) => version,
            None => directory::find_file(conn, file.file_uuid)
                .await?
                .and_then(|entry| entry.file_version)
                .map_or(0, |current| current + 1),
        };
        directory::set_file_version(conn, file.file_uuid, version, None).await?;
    }
    upload_tracker::delete_object(conn, object.tracker.id).await?;

    info!(file_group_id = %object.tracker.file_group_id, "Deferred upload committed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::declaration::DeclaredFile;
    use crate::engine::test_support::{engine_with, MockServer};
    use uuid::Uuid;

    fn declaration(file_uuid: FileUuid) -> DeclaredObject {
        DeclaredObject::new(
            FileGroupId::new(),
            "note",
            SharingGroupId::new(),
            vec![DeclaredFile::new(file_uuid, "main", ["text/plain"])],
        )
    }

    #[test]
    fn test_validate_uploads_rejects_bad_requests() {
        let file_uuid = FileUuid::new();
        let declaration = declaration(file_uuid);
        let upload = FileUpload::new(file_uuid, "main", "text/plain", "/tmp/a");

        assert!(matches!(
            validate_uploads(&[], &declaration),
            Err(SyncError::NoUploads)
        ));
        assert!(matches!(
            validate_uploads(&[upload.clone(), upload.clone()], &declaration),
            Err(SyncError::DuplicateUuids { .. })
        ));
        assert!(matches!(
            validate_uploads(
                &[FileUpload::new(FileUuid::new(), "main", "text/plain", "/tmp/a")],
                &declaration
            ),
            Err(SyncError::FileNotDeclared { .. })
        ));
        assert!(matches!(
            validate_uploads(
                &[FileUpload::new(file_uuid, "other", "text/plain", "/tmp/a")],
                &declaration
            ),
            Err(SyncError::FileMismatch { .. })
        ));
        assert!(matches!(
            validate_uploads(
                &[FileUpload::new(file_uuid, "main", "image/png", "/tmp/a")],
                &declaration
            ),
            Err(SyncError::FileMismatch { .. })
        ));
        assert!(validate_uploads(&[upload], &declaration).is_ok());
    }

    #[test]
    fn test_new_upload_object_indexes_files() {
        let (a, b) = (FileUuid::new(), FileUuid::new());
        let declaration = DeclaredObject::new(
            FileGroupId::new(),
            "note",
            SharingGroupId::new(),
            vec![
                DeclaredFile::new(a, "a", ["text/plain"]),
                DeclaredFile::new(b, "b", ["text/plain"]),
            ],
        );
        let files = vec![
            FileUpload::new(a, "a", "text/plain", "/tmp/a").inform_all_but_self(true),
            FileUpload::new(b, "b", "text/plain", "/tmp/b").with_app_meta_data("m"),
        ];

        let object = new_upload_object(
            &declaration,
            &files,
            vec!["1".to_string(), "2".to_string()],
            true,
            std::time::Duration::from_secs(60),
            Utc::now(),
        );

        assert_eq!(object.tracker.v0_upload, Some(true));
        assert!(object.is_queued());
        assert_eq!(object.files[0].upload_index, 1);
        assert_eq!(object.files[1].upload_index, 2);
        assert!(object.files.iter().all(|f| f.upload_count == 2));
        assert!(object.files[0].inform_all_but_self);
        assert_eq!(object.files[1].app_meta_data.as_deref(), Some("m"));
        assert_eq!(object.files[1].checksum, "2");
    }

    #[test]
    fn test_absorb_internal_keeps_other_errors() {
        let mut effects = Effects::default();
        assert!(absorb_internal(Err(SyncError::Internal("x".to_string())), &mut effects).is_ok());
        assert_eq!(effects.events.len(), 1);
        assert!(absorb_internal(Err(SyncError::NoUploads), &mut effects).is_err());
    }

    #[tokio::test]
    async fn test_repeated_upload_result_reported_once() {
        let engine = engine_with(MockServer::new(), None).await;
        let file_uuid = FileUuid::new();
        let files = vec![FileUpload::new(file_uuid, "main", "text/plain", "/tmp/a")];
        let mut object = new_upload_object(
            &declaration(file_uuid),
            &files,
            vec!["c".to_string()],
            false,
            std::time::Duration::from_secs(60),
            Utc::now(),
        );
        object.files[0].status = UploadStatus::Uploading;
        {
            let mut conn = engine.inner.pool.acquire().await.unwrap();
            upload_tracker::insert_object(&mut conn, &object).await.unwrap();
        }

        let success = |deferred: Uuid| {
            Ok(UploadFileResult::Success {
                creation_date: Utc::now(),
                update_date: Utc::now(),
                file_version: 1,
                deferred_upload_id: Some(deferred),
            })
        };
        let first = Uuid::new_v4();
        let mut events = engine.subscribe();
        let file_id = object.files[0].id;
        engine.complete_upload(file_id, success(first)).await.unwrap();
        engine
            .complete_upload(file_id, success(Uuid::new_v4()))
            .await
            .unwrap();

        let completed = events
            .drain()
            .into_iter()
            .filter(|e| matches!(e, CoreEvent::Upload(UploadEvent::Completed { .. })))
            .count();
        assert_eq!(completed, 1);

        let mut conn = engine.inner.pool.acquire().await.unwrap();
        let stored = upload_tracker::find_object(&mut conn, object.tracker.id)
            .await
            .unwrap()
            .unwrap();
        assert!(stored.all_uploaded());
        assert_eq!(stored.tracker.deferred_upload_id, Some(DeferredUploadId::from(first)));
    }
}
