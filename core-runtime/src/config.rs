//! # Sync Engine Configuration
//!
//! Builder-based configuration for the sync engine.
//!
//! ## Overview
//!
//! [`SyncEngineConfig`] carries the injected bridges (server client, network
//! monitor, clock) and the tunables that drive tracker scheduling: object-level
//! concurrency limits and the expiry windows after which in-flight work is
//! considered stalled. The builder fails fast when a required bridge is missing
//! or a tunable is out of range.
//!
//! ## Required Dependencies
//!
//! - `SyncServerApi` - every network operation goes through it
//!
//! ## Optional Dependencies
//!
//! - `NetworkMonitor` - without one the network is assumed usable
//! - `Clock` - defaults to [`SystemClock`]
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::SyncEngineConfig;
//! use std::time::Duration;
//!
//! let config = SyncEngineConfig::builder()
//!     .database_path("/data/sync.db")
//!     .server_api(Arc::new(MyServerClient::new()))
//!     .max_concurrent_file_group_uploads(3)
//!     .upload_expiry(Duration::from_secs(300))
//!     .build()?;
//! ```

use crate::error::{Error, Result};
use bridge_traits::{Clock, NetworkMonitor, SyncServerApi, SystemClock};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_MAX_CONCURRENT_FILE_GROUP_UPLOADS: usize = 5;
pub const DEFAULT_MAX_CONCURRENT_FILE_GROUP_DOWNLOADS: usize = 5;
pub const DEFAULT_TRANSFER_EXPIRY: Duration = Duration::from_secs(120);
pub const DEFAULT_DELETION_EXPIRY: Duration = Duration::from_secs(120);
pub const DEFAULT_BATCH_EXPIRY_INTERVAL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_DEFERRED_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Scheduling tunables, separated from the injected bridges so the engine can
/// copy them around freely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncLimits {
    pub max_concurrent_file_group_uploads: usize,
    pub max_concurrent_file_group_downloads: usize,
    /// How long a file may stay `uploading` before a retry is considered.
    pub upload_expiry: Duration,
    /// How long a file may stay `downloading` before it is reset.
    pub download_expiry: Duration,
    /// How long a deletion may stay `deleting` before it is re-sent.
    pub deletion_expiry: Duration,
    /// Sent with each upload batch; the server drops unfinished batches after it.
    pub batch_expiry_interval: Duration,
    pub deferred_check_interval: Duration,
    /// Start the deferred polling timer automatically. When off, every
    /// `sync()` pass polls deferred work inline instead.
    pub auto_deferred_polling: bool,
}

impl Default for SyncLimits {
    fn default() -> Self {
        Self {
            max_concurrent_file_group_uploads: DEFAULT_MAX_CONCURRENT_FILE_GROUP_UPLOADS,
            max_concurrent_file_group_downloads: DEFAULT_MAX_CONCURRENT_FILE_GROUP_DOWNLOADS,
            upload_expiry: DEFAULT_TRANSFER_EXPIRY,
            download_expiry: DEFAULT_TRANSFER_EXPIRY,
            deletion_expiry: DEFAULT_DELETION_EXPIRY,
            batch_expiry_interval: DEFAULT_BATCH_EXPIRY_INTERVAL,
            deferred_check_interval: DEFAULT_DEFERRED_CHECK_INTERVAL,
            auto_deferred_polling: true,
        }
    }
}

impl SyncLimits {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_file_group_uploads == 0 {
            return Err(Error::Config(
                "max_concurrent_file_group_uploads must be greater than 0".to_string(),
            ));
        }

        if self.max_concurrent_file_group_downloads == 0 {
            return Err(Error::Config(
                "max_concurrent_file_group_downloads must be greater than 0".to_string(),
            ));
        }

        for (name, value) in [
            ("upload_expiry", self.upload_expiry),
            ("download_expiry", self.download_expiry),
            ("deletion_expiry", self.deletion_expiry),
            ("batch_expiry_interval", self.batch_expiry_interval),
            ("deferred_check_interval", self.deferred_check_interval),
        ] {
            if value.is_zero() {
                return Err(Error::Config(format!("{} must be non-zero", name)));
            }
        }

        Ok(())
    }
}

/// Configuration for the sync engine. Use [`SyncEngineConfigBuilder`] to
/// construct instances.
#[derive(Clone)]
pub struct SyncEngineConfig {
    /// SQLite file holding trackers and the directory; `None` keeps state in memory.
    pub database_path: Option<PathBuf>,
    pub server_api: Arc<dyn SyncServerApi>,
    pub network_monitor: Option<Arc<dyn NetworkMonitor>>,
    pub clock: Arc<dyn Clock>,
    pub limits: SyncLimits,
    pub event_buffer_size: usize,
}

impl std::fmt::Debug for SyncEngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngineConfig")
            .field("database_path", &self.database_path)
            .field("server_api", &"SyncServerApi { ... }")
            .field(
                "network_monitor",
                &self
                    .network_monitor
                    .as_ref()
                    .map(|_| "NetworkMonitor { ... }"),
            )
            .field("limits", &self.limits)
            .field("event_buffer_size", &self.event_buffer_size)
            .finish()
    }
}

impl SyncEngineConfig {
    pub fn builder() -> SyncEngineConfigBuilder {
        SyncEngineConfigBuilder::default()
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(path) = &self.database_path {
            if path.as_os_str().is_empty() {
                return Err(Error::Config("Database path cannot be empty".to_string()));
            }
        }

        if self.event_buffer_size == 0 {
            return Err(Error::Config(
                "Event buffer size must be greater than 0".to_string(),
            ));
        }

        self.limits.validate()
    }
}

#[derive(Default)]
pub struct SyncEngineConfigBuilder {
    database_path: Option<PathBuf>,
    server_api: Option<Arc<dyn SyncServerApi>>,
    network_monitor: Option<Arc<dyn NetworkMonitor>>,
    clock: Option<Arc<dyn Clock>>,
    limits: SyncLimits,
    event_buffer_size: Option<usize>,
}

impl SyncEngineConfigBuilder {
    /// Persist engine state in the SQLite file at `path`.
    pub fn database_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.database_path = Some(path.into());
        self
    }

    /// Sets the server client (required).
    pub fn server_api(mut self, api: Arc<dyn SyncServerApi>) -> Self {
        self.server_api = Some(api);
        self
    }

    pub fn network_monitor(mut self, monitor: Arc<dyn NetworkMonitor>) -> Self {
        self.network_monitor = Some(monitor);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn max_concurrent_file_group_uploads(mut self, max: usize) -> Self {
        self.limits.max_concurrent_file_group_uploads = max;
        self
    }

    pub fn max_concurrent_file_group_downloads(mut self, max: usize) -> Self {
        self.limits.max_concurrent_file_group_downloads = max;
        self
    }

    pub fn upload_expiry(mut self, expiry: Duration) -> Self {
        self.limits.upload_expiry = expiry;
        self
    }

    pub fn download_expiry(mut self, expiry: Duration) -> Self {
        self.limits.download_expiry = expiry;
        self
    }

    pub fn deletion_expiry(mut self, expiry: Duration) -> Self {
        self.limits.deletion_expiry = expiry;
        self
    }

    pub fn batch_expiry_interval(mut self, interval: Duration) -> Self {
        self.limits.batch_expiry_interval = interval;
        self
    }

    pub fn deferred_check_interval(mut self, interval: Duration) -> Self {
        self.limits.deferred_check_interval = interval;
        self
    }

    pub fn auto_deferred_polling(mut self, enabled: bool) -> Self {
        self.limits.auto_deferred_polling = enabled;
        self
    }

    pub fn limits(mut self, limits: SyncLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = Some(size);
        self
    }

    /// Builds and validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CapabilityMissing`] when no server client was provided
    /// and [`Error::Config`] when a tunable is out of range.
    pub fn build(self) -> Result<SyncEngineConfig> {
        let server_api = self.server_api.ok_or_else(|| Error::CapabilityMissing {
            capability: "SyncServerApi".to_string(),
            message: "No server client provided. Inject an implementation with \
                      .server_api() before building the engine."
                .to_string(),
        })?;

        let config = SyncEngineConfig {
            database_path: self.database_path,
            server_api,
            network_monitor: self.network_monitor,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            limits: self.limits,
            event_buffer_size: self
                .event_buffer_size
                .unwrap_or(crate::events::DEFAULT_EVENT_BUFFER_SIZE),
        };

        config.validate()?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bridge_traits::error::Result as BridgeResult;
    use bridge_traits::server::*;
    use mockall::mock;
    use uuid::Uuid;

    mock! {
        pub Server {}

        #[async_trait]
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

    fn server() -> Arc<dyn SyncServerApi> {
        Arc::new(MockServer::new())
    }

    #[test]
    fn test_builder_requires_server_api() {
        let result = SyncEngineConfig::builder().database_path("/tmp/sync.db").build();

        let err = result.unwrap_err();
        assert!(matches!(err, Error::CapabilityMissing { .. }));
        assert!(err.to_string().contains("SyncServerApi"));
    }

    #[test]
    fn test_builder_defaults() {
        let config = SyncEngineConfig::builder()
            .server_api(server())
            .build()
            .unwrap();

        assert!(config.database_path.is_none());
        assert!(config.network_monitor.is_none());
        assert_eq!(config.limits, SyncLimits::default());
        assert_eq!(config.event_buffer_size, 100);
    }

    #[test]
    fn test_builder_overrides() {
        let config = SyncEngineConfig::builder()
            .server_api(server())
            .database_path("/data/sync.db")
            .max_concurrent_file_group_uploads(2)
            .max_concurrent_file_group_downloads(3)
            .upload_expiry(Duration::from_secs(10))
            .auto_deferred_polling(false)
            .build()
            .unwrap();

        assert_eq!(config.database_path, Some(PathBuf::from("/data/sync.db")));
        assert_eq!(config.limits.max_concurrent_file_group_uploads, 2);
        assert_eq!(config.limits.max_concurrent_file_group_downloads, 3);
        assert_eq!(config.limits.upload_expiry, Duration::from_secs(10));
        assert!(!config.limits.auto_deferred_polling);
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let err = SyncEngineConfig::builder()
            .server_api(server())
            .max_concurrent_file_group_uploads(0)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("max_concurrent_file_group_uploads"));

        let err = SyncEngineConfig::builder()
            .server_api(server())
            .deletion_expiry(Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("deletion_expiry"));
    }

    #[test]
    fn test_validate_rejects_empty_database_path() {
        let err = SyncEngineConfig::builder()
            .server_api(server())
            .database_path("")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("Database path"));
    }
}
