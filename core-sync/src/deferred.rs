//! # Deferred Reconciliation
//!
//! Later-version uploads and some deletions are committed by the server
//! asynchronously. Once the client side of such an operation has finished,
//! its tracker stays behind until a status query reports the job completed.
//!
//! ## Flow
//!
//! 1. Collect candidates under the queue guard.
//! 2. Release the guard and query every candidate concurrently.
//! 3. Take the guard again and apply each completed job in its own transaction.
//!
//! A failing query never cancels its siblings. The aggregate call returns an
//! error when any query failed, after every successful result was applied.

use crate::deletion_tracker::{self, DeletionStatus, DeletionTracker};
use crate::deletions::finalize_deletion;
use crate::engine::{Effects, SyncEngine};
use crate::ids::FileGroupId;
use crate::upload_tracker::{self, UploadObject};
use crate::uploads::finalize_deferred_upload;
use crate::{Result, SyncError};
use bridge_traits::server::{DeferredStatus, UploadsResultsQuery};
use core_runtime::events::{CoreEvent, DeferredEvent, DeferredOperation};
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};

enum Checked {
    Completed,
    Pending,
    Failed(String),
}

fn classify(
    file_group_id: FileGroupId,
    result: bridge_traits::error::Result<DeferredStatus>,
    effects: &mut Effects,
) -> Checked {
    match result {
        Ok(DeferredStatus::Completed) => Checked::Completed,
        Ok(status) if status.is_pending() => {
            debug!(%file_group_id, ?status, "Deferred job still pending");
            Checked::Pending
        }
        Ok(status) => {
            let message = format!("Deferred job for {} reported {:?}", file_group_id, status);
            effects.internal_error(message.clone());
            Checked::Failed(message)
        }
        Err(e) => {
            let message = format!("Deferred check for {} failed: {}", file_group_id, e);
            effects.user_error(message.clone(), Some(file_group_id));
            Checked::Failed(message)
        }
    }
}

fn aggregate(completed: Vec<FileGroupId>, failures: Vec<String>) -> Result<Vec<FileGroupId>> {
    if failures.is_empty() {
        Ok(completed)
    } else {
        Err(SyncError::DeferredChecksFailed {
            completed: completed.iter().map(|id| id.as_str()).collect(),
            failures,
        })
    }
}

fn upload_query(object: &UploadObject) -> UploadsResultsQuery {
    match object.tracker.deferred_upload_id {
        Some(id) => UploadsResultsQuery::Deferred(id.into()),
        None => UploadsResultsQuery::Batch(object.tracker.batch_uuid.into()),
    }
}

impl SyncEngine {
    /// Poll the server for later-version uploads whose transfer has finished
    /// and commit the ones it reports completed.
    ///
    /// # Errors
    ///
    /// [`SyncError::DeferredChecksFailed`] when at least one query failed; the
    /// error carries the file groups that were committed anyway.
    pub async fn check_on_deferred_uploads(&self) -> Result<Vec<FileGroupId>> {
        let candidates: Vec<UploadObject> = {
            let _queue = self.lock_queue().await;
            let mut conn = self.inner.pool.acquire().await?;
            upload_tracker::all_objects(&mut conn)
                .await?
                .into_iter()
                .filter(|object| object.all_uploaded())
                .collect()
        };
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        debug!(count = candidates.len(), "Checking deferred uploads");
        let server = Arc::clone(&self.inner.server);
        let results = join_all(
            candidates
                .iter()
                .map(|object| server.get_uploads_results(upload_query(object))),
        )
        .await;

        let queue = self.lock_queue().await;
        let mut effects = Effects::default();
        let mut completed = Vec::new();
        let mut failures = Vec::new();

        for (object, result) in candidates.iter().zip(results) {
            let file_group_id = object.tracker.file_group_id;
            match classify(file_group_id, result, &mut effects) {
                Checked::Pending => {}
                Checked::Failed(message) => failures.push(message),
                Checked::Completed => {
                    let mut tx = self.inner.pool.begin().await?;
                    let current = upload_tracker::find_object(&mut tx, object.tracker.id).await?;
                    let Some(current) = current else {
                        continue;
                    };
                    finalize_deferred_upload(&mut tx, &current).await?;
                    tx.commit().await?;
                    completed.push(file_group_id);
                }
            }
        }
        drop(queue);

        if !completed.is_empty() {
            info!(count = completed.len(), "Deferred uploads committed");
            effects.event(CoreEvent::Deferred(DeferredEvent::Completed {
                operation: DeferredOperation::Upload,
                file_group_ids: completed.iter().map(|&id| id.into()).collect(),
            }));
        }
        self.finish(effects);

        aggregate(completed, failures)
    }

    /// Poll the server for deletions waiting on a deferred job and finalize
    /// the ones it reports completed.
    ///
    /// # Errors
    ///
    /// Same aggregation as [`SyncEngine::check_on_deferred_uploads`].
    pub async fn check_on_deferred_deletions(&self) -> Result<Vec<FileGroupId>> {
        let candidates: Vec<DeletionTracker> = {
            let _queue = self.lock_queue().await;
            let mut conn = self.inner.pool.acquire().await?;
            deletion_tracker::all(&mut conn)
                .await?
                .into_iter()
                .filter(|t| t.status == DeletionStatus::WaitingForDeferredDeletion)
                .collect()
        };
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        debug!(count = candidates.len(), "Checking deferred deletions");
        let server = Arc::clone(&self.inner.server);
        let results = join_all(candidates.iter().map(|tracker| {
            let server = Arc::clone(&server);
            let deferred = tracker.deferred_upload_id;
            async move {
                match deferred {
                    Some(id) => {
                        server
                            .get_uploads_results(UploadsResultsQuery::Deferred(id.into()))
                            .await
                    }
                    None => Ok(DeferredStatus::None),
                }
            }
        }))
        .await;

        let queue = self.lock_queue().await;
        let mut effects = Effects::default();
        let mut completed = Vec::new();
        let mut failures = Vec::new();

        for (tracker, result) in candidates.iter().zip(results) {
            let file_group_id = tracker.file_group_id;
            match classify(file_group_id, result, &mut effects) {
                Checked::Pending => {}
                Checked::Failed(message) => failures.push(message),
                Checked::Completed => {
                    let mut tx = self.inner.pool.begin().await?;
                    let Some(current) = deletion_tracker::find(&mut tx, tracker.id).await? else {
                        continue;
                    };
                    finalize_deletion(&mut tx, &current, &mut effects).await?;
                    tx.commit().await?;
                    completed.push(file_group_id);
                }
            }
        }
        drop(queue);

        if !completed.is_empty() {
            info!(count = completed.len(), "Deferred deletions committed");
            effects.event(CoreEvent::Deferred(DeferredEvent::Completed {
                operation: DeferredOperation::Deletion,
                file_group_ids: completed.iter().map(|&id| id.into()).collect(),
            }));
        }
        self.finish(effects);

        aggregate(completed, failures)
    }

    /// Whether any tracker is waiting on a deferred server job.
    pub async fn has_deferred_work(&self) -> Result<bool> {
        let _queue = self.lock_queue().await;
        let mut conn = self.inner.pool.acquire().await?;

        let uploads = upload_tracker::all_objects(&mut conn)
            .await?
            .iter()
            .any(|object| object.all_uploaded());
        if uploads {
            return Ok(true);
        }

        Ok(deletion_tracker::all(&mut conn)
            .await?
            .iter()
            .any(|t| t.status == DeletionStatus::WaitingForDeferredDeletion))
    }

    /// Start the background poller unless it is already running.
    ///
    /// Every `deferred_check_interval` the poller runs both deferred checks and
    /// stops once no deferred work remains. It holds only a weak reference to
    /// the engine and ends when the engine is dropped.
    pub fn start_deferred_polling(&self) {
        let mut poller = match self.inner.poller.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if poller.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let interval = self.inner.limits.deferred_check_interval;
        info!(?interval, "Deferred polling started");

        *poller = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let engine = SyncEngine { inner };

                if let Err(e) = engine.check_on_deferred_uploads().await {
                    warn!(error = %e, "Deferred upload check failed");
                }
                if let Err(e) = engine.check_on_deferred_deletions().await {
                    warn!(error = %e, "Deferred deletion check failed");
                }

                match engine.has_deferred_work().await {
                    Ok(true) => continue,
                    Ok(false) => {
                        info!("No deferred work left, polling stopped");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Cannot inspect deferred work, polling stopped");
                        break;
                    }
                }
            }
        }));
    }

    /// Stop the background poller if it is running.
    pub fn stop_deferred_polling(&self) {
        let mut poller = match self.inner.poller.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(handle) = poller.take() {
            handle.abort();
        }
    }

    pub fn is_deferred_polling(&self) -> bool {
        match self.inner.poller.lock() {
            Ok(guard) => guard.as_ref().is_some_and(|handle| !handle.is_finished()),
            Err(poisoned) => poisoned
                .into_inner()
                .as_ref()
                .is_some_and(|handle| !handle.is_finished()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_support::{engine_with, MockServer};

    #[test]
    fn test_aggregate_reports_partial_success() {
        let done = FileGroupId::new();
        assert_eq!(aggregate(vec![done], vec![]).unwrap(), vec![done]);

        let err = aggregate(vec![done], vec!["boom".to_string()]).unwrap_err();
        match err {
            SyncError::DeferredChecksFailed { completed, failures } => {
                assert_eq!(completed, vec![done.as_str()]);
                assert_eq!(failures, vec!["boom".to_string()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_classify_statuses() {
        let group = FileGroupId::new();
        let mut effects = Effects::default();

        assert!(matches!(
            classify(group, Ok(DeferredStatus::Completed), &mut effects),
            Checked::Completed
        ));
        assert!(matches!(
            classify(group, Ok(DeferredStatus::PendingChange), &mut effects),
            Checked::Pending
        ));
        assert!(effects.events.is_empty());

        assert!(matches!(
            classify(group, Ok(DeferredStatus::None), &mut effects),
            Checked::Failed(_)
        ));
        assert!(matches!(
            classify(group, Ok(DeferredStatus::Error), &mut effects),
            Checked::Failed(_)
        ));
        assert_eq!(effects.events.len(), 2);
    }

    #[tokio::test]
    async fn test_polling_start_and_stop() {
        let engine = engine_with(MockServer::new(), None).await;
        assert!(!engine.has_deferred_work().await.unwrap());
        assert!(!engine.is_deferred_polling());

        engine.start_deferred_polling();
        engine.start_deferred_polling();
        assert!(engine.is_deferred_polling());

        engine.stop_deferred_polling();
        assert!(!engine.is_deferred_polling());
    }
}
