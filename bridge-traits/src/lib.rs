//! # Host Bridge Traits
//!
//! Contracts between the sync core and the outside world.
//!
//! ## Overview
//!
//! The core never talks to the network, the OS or the host logger directly.
//! Each capability it needs is expressed as a trait here and injected at
//! construction time, so hosts can ship platform adapters and tests can ship
//! scripted fakes.
//!
//! ## Traits
//!
//! - [`SyncServerApi`](server::SyncServerApi) - Upload, download, deletion, index and
//!   deferred-status calls against the sync server
//! - [`NetworkMonitor`](network::NetworkMonitor) - Connectivity gate for starting work
//! - [`Clock`](time::Clock) - Time source for tracker expiries
//! - [`LoggerSink`](time::LoggerSink) - Forward structured logs to host logging
//!
//! ## Error Handling
//!
//! All bridge traits use [`BridgeError`](error::BridgeError). Implementations should
//! report transport failures as `BridgeError::Network` so the engine can treat them
//! as transient and leave recovery to tracker expiry.
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync` on native targets; the engine shares
//! them across the tasks that carry in-flight requests.

pub mod error;
pub mod network;
pub mod platform;
pub mod server;
pub mod time;

pub use error::BridgeError;

pub use network::{NetworkInfo, NetworkMonitor, NetworkStatus, NetworkType};
pub use server::{
    DeferredStatus, DeletionRequest, DeletionResult, DownloadFileResult, FileDownloadRequest,
    FileUploadRequest, FirstVersionInfo, GoneReason, IndexFile, IndexObject, IndexResult,
    MoveFileGroupsRequest, MoveFileGroupsResult, Permission, SharingGroup, SharingGroupMember,
    SyncServerApi, UploadBatch, UploadFileResult, UploadVersion, UploadsResultsQuery,
};
pub use time::{Clock, LogEntry, LogLevel, LoggerSink, SystemClock};
