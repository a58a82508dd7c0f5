//! # Sync Engine
//!
//! The single entry point hosts hold on to. It owns the SQLite pool, the
//! injected server client, network monitor and clock, and the event bus.
//!
//! ## Serial Queue
//!
//! Every read that feeds a decision and every mutation of trackers or the
//! directory happens while holding the engine's queue guard, inside one
//! SQLite transaction per logical step. Network requests never run under the
//! guard: a step records the requests it wants to make as [`Request`]s, and
//! once its transaction has committed they are spawned as tracked tasks. A
//! request's completion takes the guard again before touching state.
//!
//! Events follow the same path: they are collected during the transaction and
//! only published after commit, so subscribers never observe state that was
//! rolled back.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use core_runtime::config::SyncEngineConfig;
//! use core_sync::SyncEngine;
//!
//! let config = SyncEngineConfig::builder()
//!     .database_path("/data/sync.db")
//!     .server_api(server)
//!     .build()?;
//! let engine = SyncEngine::new(config).await?;
//!
//! let mut events = engine.subscribe();
//! engine.sync(Some(sharing_group_id)).await?;
//! ```

use crate::db::{create_pool, DatabaseConfig};
use crate::ids::{FileGroupId, TrackerId};
use crate::{Result, SyncError};
use bridge_traits::error::Result as BridgeResult;
use bridge_traits::network::{NetworkMonitor, NetworkStatus};
use bridge_traits::server::{
    DeferredStatus, DeletionRequest, DeletionResult, DownloadFileResult, FileDownloadRequest,
    FileUploadRequest, SyncServerApi, UploadFileResult, UploadsResultsQuery,
};
use bridge_traits::time::Clock;
use core_runtime::config::{SyncEngineConfig, SyncLimits};
use core_runtime::events::{CoreEvent, ErrorEvent, EventBus, EventStream};
use sqlx::SqlitePool;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

// ============================================================================
// Effects
// ============================================================================

/// A network request decided on under the queue guard.
#[derive(Debug, Clone)]
pub(crate) enum Request {
    Upload {
        file_tracker_id: TrackerId,
        request: FileUploadRequest,
    },
    /// Ask the server whether an expired later-version batch actually landed.
    BatchStatus {
        object_tracker_id: TrackerId,
        batch_uuid: Uuid,
        expired_file_ids: Vec<TrackerId>,
    },
    Download {
        file_tracker_id: TrackerId,
        request: FileDownloadRequest,
    },
    Deletion {
        tracker_id: TrackerId,
        request: DeletionRequest,
    },
    PushNotification {
        message: String,
        sharing_group_id: Uuid,
        file_group_id: FileGroupId,
    },
}

/// Side effects of one transaction, released only after it commits.
#[derive(Debug, Default)]
pub(crate) struct Effects {
    pub(crate) events: Vec<CoreEvent>,
    pub(crate) requests: Vec<Request>,
    pub(crate) start_polling: bool,
}

impl Effects {
    pub(crate) fn event(&mut self, event: CoreEvent) {
        self.events.push(event);
    }

    pub(crate) fn request(&mut self, request: Request) {
        self.requests.push(request);
    }

    pub(crate) fn internal_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        error!(message = %message, "Sync invariant violated");
        self.events
            .push(CoreEvent::Error(ErrorEvent::Internal { message }));
    }

    pub(crate) fn user_error(
        &mut self,
        message: impl Into<String>,
        file_group_id: Option<FileGroupId>,
    ) {
        let message = message.into();
        warn!(message = %message, "Sync operation failed");
        self.events.push(CoreEvent::Error(ErrorEvent::User {
            message,
            file_group_id: file_group_id.map(Into::into),
        }));
    }
}

// ============================================================================
// Engine
// ============================================================================

pub(crate) struct EngineInner {
    pub(crate) pool: SqlitePool,
    queue: Mutex<()>,
    pub(crate) server: Arc<dyn SyncServerApi>,
    network: Option<Arc<dyn NetworkMonitor>>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) limits: SyncLimits,
    events: EventBus,
    requests: TaskTracker,
    pub(crate) poller: StdMutex<Option<JoinHandle<()>>>,
}

/// Client-side sync engine. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct SyncEngine {
    pub(crate) inner: Arc<EngineInner>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("limits", &self.inner.limits)
            .field("in_flight_requests", &self.inner.requests.len())
            .finish()
    }
}

impl SyncEngine {
    /// Open (or create) the engine's database and build the engine.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, or the database
    /// cannot be opened or migrated.
    pub async fn new(config: SyncEngineConfig) -> Result<Self> {
        config.validate()?;

        let db_config = match &config.database_path {
            Some(path) => DatabaseConfig::new(path),
            None => DatabaseConfig::in_memory(),
        };
        let pool = create_pool(db_config).await?;

        Self::with_pool(pool, config)
    }

    /// Build an engine on an existing, migrated pool.
    pub fn with_pool(pool: SqlitePool, config: SyncEngineConfig) -> Result<Self> {
        config.validate()?;

        info!(
            max_uploads = config.limits.max_concurrent_file_group_uploads,
            max_downloads = config.limits.max_concurrent_file_group_downloads,
            auto_deferred_polling = config.limits.auto_deferred_polling,
            "Sync engine created"
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                pool,
                queue: Mutex::new(()),
                server: config.server_api,
                network: config.network_monitor,
                clock: config.clock,
                limits: config.limits,
                events: EventBus::new(config.event_buffer_size),
                requests: TaskTracker::new(),
                poller: StdMutex::new(None),
            }),
        })
    }

    /// Subscribe to engine events emitted from now on.
    pub fn subscribe(&self) -> EventStream {
        EventStream::new(self.inner.events.subscribe())
    }

    pub fn limits(&self) -> &SyncLimits {
        &self.inner.limits
    }

    /// Wait until every in-flight server request and its completion handling
    /// has finished, including requests spawned while waiting.
    pub async fn wait_for_pending_requests(&self) {
        self.inner.requests.close();
        self.inner.requests.wait().await;
        self.inner.requests.reopen();
    }

    /// Verify the stored credentials with the server.
    pub async fn check_credentials(&self) -> Result<bool> {
        Ok(self.inner.server.check_creds().await?)
    }

    // ------------------------------------------------------------------
    // Serial queue
    // ------------------------------------------------------------------

    pub(crate) async fn lock_queue(&self) -> MutexGuard<'_, ()> {
        self.inner.queue.lock().await
    }

    /// Whether the network allows starting new work. No monitor means always.
    pub(crate) async fn network_usable(&self) -> bool {
        let Some(monitor) = &self.inner.network else {
            return true;
        };

        match monitor.get_network_info().await {
            Ok(info) => info.status != NetworkStatus::Disconnected,
            Err(e) => {
                warn!(error = %e, "Network status unavailable, holding back new work");
                false
            }
        }
    }

    pub(crate) fn now_millis(&self) -> i64 {
        self.inner.clock.unix_timestamp_millis()
    }

    pub(crate) fn emit(&self, event: CoreEvent) {
        trace!(event = event.description(), "Emitting event");
        if self.inner.events.emit(event).is_err() {
            trace!("No event subscribers");
        }
    }

    /// Publish the effects of a committed transaction.
    pub(crate) fn finish(&self, effects: Effects) {
        for event in effects.events {
            self.emit(event);
        }
        for request in effects.requests {
            self.dispatch(request);
        }
        if effects.start_polling && self.inner.limits.auto_deferred_polling {
            self.start_deferred_polling();
        }
    }

    /// Report an error raised while applying a request's completion.
    pub(crate) fn report_failure(&self, context: &str, err: SyncError) {
        error!(error = %err, context, "Failed to apply request completion");
        self.emit(CoreEvent::Error(ErrorEvent::Internal {
            message: format!("{}: {}", context, err),
        }));
    }

    fn dispatch(&self, request: Request) {
        let engine = self.clone();

        self.inner.requests.spawn(async move {
            match request {
                Request::Upload {
                    file_tracker_id,
                    request,
                } => {
                    debug!(file_uuid = %request.file_uuid, "Uploading file");
                    let result: BridgeResult<UploadFileResult> =
                        engine.inner.server.upload_file(request).await;
                    if let Err(e) = engine.complete_upload(file_tracker_id, result).await {
                        engine.report_failure("upload completion", e);
                    }
                }
                Request::BatchStatus {
                    object_tracker_id,
                    batch_uuid,
                    expired_file_ids,
                } => {
                    debug!(batch = %batch_uuid, "Checking expired batch on server");
                    let result: BridgeResult<DeferredStatus> = engine
                        .inner
                        .server
                        .get_uploads_results(UploadsResultsQuery::Batch(batch_uuid))
                        .await;
                    if let Err(e) = engine
                        .complete_batch_status(object_tracker_id, expired_file_ids, result)
                        .await
                    {
                        engine.report_failure("batch status", e);
                    }
                }
                Request::Download {
                    file_tracker_id,
                    request,
                } => {
                    debug!(
                        file_uuid = %request.file_uuid,
                        version = request.file_version,
                        "Downloading file"
                    );
                    let result: BridgeResult<DownloadFileResult> =
                        engine.inner.server.download_file(request).await;
                    if let Err(e) = engine.complete_download(file_tracker_id, result).await {
                        engine.report_failure("download completion", e);
                    }
                }
                Request::Deletion {
                    tracker_id,
                    request,
                } => {
                    debug!(file_group_id = %request.file_group_id, "Sending deletion");
                    let result: BridgeResult<DeletionResult> =
                        engine.inner.server.upload_deletion(request).await;
                    if let Err(e) = engine.complete_deletion(tracker_id, result).await {
                        engine.report_failure("deletion completion", e);
                    }
                }
                Request::PushNotification {
                    message,
                    sharing_group_id,
                    file_group_id,
                } => {
                    if let Err(e) = engine
                        .inner
                        .server
                        .send_push_notification(message, sharing_group_id)
                        .await
                    {
                        let mut effects = Effects::default();
                        effects.user_error(
                            format!("Push notification failed: {}", e),
                            Some(file_group_id),
                        );
                        engine.finish(effects);
                    }
                }
            }
        });
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use bridge_traits::server::{
        IndexResult, MoveFileGroupsRequest, MoveFileGroupsResult,
    };
    use bridge_traits::time::SystemClock;
    use mockall::mock;

    mock! {
        pub Server {}

        #[async_trait::async_trait]
        impl SyncServerApi for Server {
            async fn check_creds(&self) -> BridgeResult<bool>;
            async fn index(&self, sharing_group_id: Option<Uuid>) -> BridgeResult<IndexResult>;
            async fn upload_file(
                &self,
                request: FileUploadRequest,
            ) -> BridgeResult<UploadFileResult>;
            async fn download_file(
                &self,
                request: FileDownloadRequest,
            ) -> BridgeResult<DownloadFileResult>;
            async fn upload_deletion(
                &self,
                request: DeletionRequest,
            ) -> BridgeResult<DeletionResult>;
            async fn get_uploads_results(
                &self,
                query: UploadsResultsQuery,
            ) -> BridgeResult<DeferredStatus>;
            async fn move_file_groups(
                &self,
                request: MoveFileGroupsRequest,
            ) -> BridgeResult<MoveFileGroupsResult>;
            async fn send_push_notification(
                &self,
                message: String,
                sharing_group_id: Uuid,
            ) -> BridgeResult<()>;
        }
    }

    mock! {
        pub Monitor {}

        #[async_trait::async_trait]
        impl NetworkMonitor for Monitor {
            async fn get_network_info(&self) -> BridgeResult<bridge_traits::network::NetworkInfo>;
        }
    }

    pub(crate) async fn engine_with(
        server: MockServer,
        monitor: Option<MockMonitor>,
    ) -> SyncEngine {
        let mut builder = SyncEngineConfig::builder()
            .server_api(Arc::new(server))
            .clock(Arc::new(SystemClock))
            .auto_deferred_polling(false);
        if let Some(monitor) = monitor {
            builder = builder.network_monitor(Arc::new(monitor));
        }
        let config = builder.build().unwrap();
        let pool = crate::db::create_test_pool().await.unwrap();
        SyncEngine::with_pool(pool, config).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use bridge_traits::error::BridgeError;
    use bridge_traits::network::{NetworkInfo, NetworkType};

    #[tokio::test]
    async fn test_network_usable_without_monitor() {
        let engine = engine_with(MockServer::new(), None).await;
        assert!(engine.network_usable().await);
    }

    #[tokio::test]
    async fn test_network_usable_follows_monitor() {
        let mut offline = MockMonitor::new();
        offline
            .expect_get_network_info()
            .returning(|| Ok(NetworkInfo::disconnected()));
        let engine = engine_with(MockServer::new(), Some(offline)).await;
        assert!(!engine.network_usable().await);

        let mut online = MockMonitor::new();
        online
            .expect_get_network_info()
            .returning(|| Ok(NetworkInfo::connected(NetworkType::WiFi)));
        let engine = engine_with(MockServer::new(), Some(online)).await;
        assert!(engine.network_usable().await);

        let mut broken = MockMonitor::new();
        broken
            .expect_get_network_info()
            .returning(|| Err(BridgeError::NotAvailable("reachability".to_string())));
        let engine = engine_with(MockServer::new(), Some(broken)).await;
        assert!(!engine.network_usable().await);
    }

    #[tokio::test]
    async fn test_check_credentials_passthrough() {
        let mut server = MockServer::new();
        server.expect_check_creds().times(1).returning(|| Ok(true));
        let engine = engine_with(server, None).await;

        assert!(engine.check_credentials().await.unwrap());
    }

    #[tokio::test]
    async fn test_finish_publishes_events_in_order() {
        let engine = engine_with(MockServer::new(), None).await;
        let mut events = engine.subscribe();

        let mut effects = Effects::default();
        effects.user_error("first", None);
        effects.internal_error("second");
        engine.finish(effects);

        let drained = events.drain();
        assert_eq!(drained.len(), 2);
        assert!(matches!(
            &drained[0],
            CoreEvent::Error(ErrorEvent::User { message, .. }) if message == "first"
        ));
        assert!(matches!(
            &drained[1],
            CoreEvent::Error(ErrorEvent::Internal { message }) if message == "second"
        ));
    }
}
