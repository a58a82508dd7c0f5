use bridge_traits::error::BridgeError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    // ------------------------------------------------------------------
    // Validation (queue time, nothing persisted)
    // ------------------------------------------------------------------
    #[error("No uploads were given")]
    NoUploads,

    #[error("No downloads were given")]
    NoDownloads,

    #[error("Declaration has no files")]
    NoDeclaredFiles,

    #[error("Duplicate file UUID: {file_uuid}")]
    DuplicateUuids { file_uuid: String },

    #[error("Duplicate file label in declaration: {file_label}")]
    DuplicateFileLabels { file_label: String },

    #[error("File {file_uuid} is not declared")]
    FileNotDeclared { file_uuid: String },

    #[error("File {file_uuid} does not match its declaration: {reason}")]
    FileMismatch { file_uuid: String, reason: String },

    #[error("Declaration for {file_group_id} does not match the stored one: {reason}")]
    DeclarationMismatch {
        file_group_id: String,
        reason: String,
    },

    #[error("File {file_uuid} has server content that was never downloaded")]
    AttemptToQueueUndownloadedFile { file_uuid: String },

    #[error("File {file_uuid} has no change resolver and cannot take another version")]
    VersionedFileWithoutResolver { file_uuid: String },

    #[error("Unknown file group: {file_group_id}")]
    UnknownFileGroup { file_group_id: String },

    #[error("Unknown file: {file_uuid}")]
    UnknownFile { file_uuid: String },

    #[error("Unknown sharing group: {sharing_group_id}")]
    UnknownSharingGroup { sharing_group_id: String },

    #[error("Sharing group {sharing_group_id} has been deleted")]
    SharingGroupDeleted { sharing_group_id: String },

    #[error("File group {file_group_id} has been deleted")]
    FileGroupDeleted { file_group_id: String },

    #[error("A deletion is already queued for {file_group_id}")]
    DeletionAlreadyQueued { file_group_id: String },

    #[error("File group {file_group_id} has a deletion pending")]
    DeletionPending { file_group_id: String },

    #[error("File group {file_group_id} is not awaiting local deletion")]
    NotDeletedOnServer { file_group_id: String },

    #[error("Requested version {requested} of {file_uuid}, server has {server:?}")]
    DownloadVersionMismatch {
        file_uuid: String,
        requested: i64,
        server: Option<i64>,
    },

    #[error("File group {file_group_id} has transfers or deletions outstanding")]
    OperationsPending { file_group_id: String },

    #[error("Invalid move: {0}")]
    InvalidMove(String),

    // ------------------------------------------------------------------
    // Runtime
    // ------------------------------------------------------------------
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Deferred checks failed for {} object(s)", .failures.len())]
    DeferredChecksFailed {
        /// File groups reconciled before the failures were collected.
        completed: Vec<String>,
        failures: Vec<String>,
    },

    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("Cannot read {path}: {source}")]
    LocalFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid status: {0}")]
    InvalidStatus(String),

    #[error("Invalid identifier: {0}")]
    InvalidId(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Configuration error: {0}")]
    Config(#[from] core_runtime::Error),
}

impl SyncError {
    /// Errors raised before any state is touched because the request itself is invalid.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            SyncError::NoUploads
                | SyncError::NoDownloads
                | SyncError::NoDeclaredFiles
                | SyncError::DuplicateUuids { .. }
                | SyncError::DuplicateFileLabels { .. }
                | SyncError::FileNotDeclared { .. }
                | SyncError::FileMismatch { .. }
                | SyncError::DeclarationMismatch { .. }
                | SyncError::AttemptToQueueUndownloadedFile { .. }
                | SyncError::VersionedFileWithoutResolver { .. }
                | SyncError::UnknownFileGroup { .. }
                | SyncError::UnknownFile { .. }
                | SyncError::UnknownSharingGroup { .. }
                | SyncError::SharingGroupDeleted { .. }
                | SyncError::FileGroupDeleted { .. }
                | SyncError::DeletionAlreadyQueued { .. }
                | SyncError::DeletionPending { .. }
                | SyncError::NotDeletedOnServer { .. }
                | SyncError::DownloadVersionMismatch { .. }
                | SyncError::OperationsPending { .. }
                | SyncError::InvalidMove(_)
        )
    }

    /// States that should be impossible and need investigation.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            SyncError::Internal(_) | SyncError::InvalidStatus(_) | SyncError::InvalidId(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
