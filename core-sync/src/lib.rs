//! # Object Sync Engine
//!
//! Client-side engine that keeps a local directory of objects (file groups)
//! in step with a sync server.
//!
//! ## Overview
//!
//! Callers declare objects, queue uploads, downloads and deletions, and call
//! [`SyncEngine::sync`] to reconcile. Every operation is persisted before any
//! request leaves the process, so work survives restarts and is resumed or
//! retried by the next sync pass.
//!
//! ## Components
//!
//! - **Directory** (`directory`): local view of objects, files and sharing groups
//! - **Declarations** (`declaration`): the fixed file layout of each object
//! - **Trackers** (`upload_tracker`, `download_tracker`, `deletion_tracker`): persisted work items
//! - **Pipelines** (`uploads`, `downloads`, `deletions`): queueing, starting and completion
//! - **Deferred reconciliation** (`deferred`): polling of server-side deferred jobs
//! - **Orchestrator** (`orchestrator`): the `sync()` pass and object moves
//! - **Engine** (`engine`): serial queue, request dispatch and event publication
//!
//! ## Usage
//!
//! ```rust,ignore
//! use core_sync::{DeclaredFile, DeclaredObject, FileUpload, SyncEngine};
//!
//! let engine = SyncEngine::new(config).await?;
//! let mut events = engine.subscribe();
//!
//! engine.queue_upload(vec![upload], declaration).await?;
//! engine.sync(Some(sharing_group_id)).await?;
//! ```

pub mod checksum;
pub mod db;
pub mod declaration;
pub mod deferred;
pub mod deletion_tracker;
pub mod deletions;
pub mod directory;
pub mod download_tracker;
pub mod downloads;
pub mod engine;
pub mod error;
pub mod ids;
pub mod orchestrator;
pub mod queries;
pub mod upload_tracker;
pub mod uploads;

pub use declaration::{DeclaredFile, DeclaredObject};
pub use deletion_tracker::{DeletionStatus, DeletionTracker, DeletionType};
pub use directory::{DirectoryFileEntry, DirectoryObjectEntry, SharingEntry};
pub use download_tracker::{DownloadFileTracker, DownloadObject, DownloadStatus};
pub use downloads::{FileDownload, ObjectDownload};
pub use engine::SyncEngine;
pub use error::{Result, SyncError};
pub use ids::{BatchId, DeferredUploadId, FileGroupId, FileUuid, SharingGroupId, TrackerId};
pub use queries::{FileGroupInfo, QueueKind};
pub use upload_tracker::{UploadFileTracker, UploadObject, UploadStatus};
pub use uploads::FileUpload;
