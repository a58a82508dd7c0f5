//! Sync Server API Abstraction
//!
//! The contract between the sync engine and the client that talks to the
//! sync server. The engine never builds HTTP requests itself: every network
//! operation goes through [`SyncServerApi`], which returns typed payloads or a
//! [`BridgeError`](crate::error::BridgeError).
//!
//! ## Deferred operations
//!
//! Uploads of later file versions and object deletions may be committed by the
//! server asynchronously. Those calls hand back a deferred upload id, and the
//! engine later asks [`SyncServerApi::get_uploads_results`] how the job is doing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use crate::{error::Result, platform::PlatformSendSync};

// ============================================================================
// Sharing Groups & Index
// ============================================================================

/// Access level the current user holds in a sharing group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
    Admin,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Read => "read",
            Permission::Write => "write",
            Permission::Admin => "admin",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "read" => Some(Permission::Read),
            "write" => Some(Permission::Write),
            "admin" => Some(Permission::Admin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharingGroupMember {
    pub user_id: String,
    pub name: Option<String>,
}

/// A sharing group as reported by the index endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharingGroup {
    pub sharing_group_id: Uuid,
    pub name: Option<String>,
    pub permission: Permission,
    pub deleted: bool,
    /// Storage backend new files in this group land on (e.g. "Dropbox").
    pub cloud_storage_type: Option<String>,
    pub members: Vec<SharingGroupMember>,
}

/// Server view of one file in an object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexFile {
    pub file_uuid: Uuid,
    pub file_label: String,
    pub file_version: i64,
    pub mime_type: String,
    pub deleted: bool,
    pub creation_date: DateTime<Utc>,
    pub update_date: Option<DateTime<Utc>>,
}

/// Server view of one object (file group).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexObject {
    pub file_group_id: Uuid,
    pub sharing_group_id: Uuid,
    pub object_type: Option<String>,
    pub deleted: bool,
    pub files: Vec<IndexFile>,
}

/// Result of an index call. `file_index` is only present when the call was
/// scoped to a sharing group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexResult {
    pub sharing_groups: Vec<SharingGroup>,
    pub file_index: Option<Vec<IndexObject>>,
}

// ============================================================================
// Uploads
// ============================================================================

/// Metadata the server needs only for the first version of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirstVersionInfo {
    pub file_label: String,
    pub object_type: String,
    pub change_resolver_name: Option<String>,
    pub cloud_storage_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadVersion {
    /// The server has never seen this file; create it.
    First(FirstVersionInfo),
    /// Content-only upload of a later version.
    Subsequent,
}

/// Batch envelope shared by every file uploaded together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadBatch {
    pub batch_uuid: Uuid,
    pub batch_expiry_interval: Duration,
    /// 1-based position of this file within the batch.
    pub upload_index: u32,
    pub upload_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileUploadRequest {
    pub file_uuid: Uuid,
    pub file_group_id: Uuid,
    pub sharing_group_id: Uuid,
    pub mime_type: String,
    /// Hex encoded SHA-256 of the content.
    pub checksum: String,
    pub local_path: PathBuf,
    pub app_meta_data: Option<String>,
    pub inform_all_but_self: bool,
    pub batch: UploadBatch,
    pub version: UploadVersion,
}

/// Reason the server gives when content is permanently unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GoneReason {
    FileRemovedOrRenamed,
    UserRemoved,
    AuthTokenExpiredOrRevoked,
}

impl GoneReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            GoneReason::FileRemovedOrRenamed => "fileRemovedOrRenamed",
            GoneReason::UserRemoved => "userRemoved",
            GoneReason::AuthTokenExpiredOrRevoked => "authTokenExpiredOrRevoked",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "fileRemovedOrRenamed" => Some(GoneReason::FileRemovedOrRenamed),
            "userRemoved" => Some(GoneReason::UserRemoved),
            "authTokenExpiredOrRevoked" => Some(GoneReason::AuthTokenExpiredOrRevoked),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadFileResult {
    Success {
        creation_date: DateTime<Utc>,
        update_date: DateTime<Utc>,
        /// Version the server assigned (or will assign) to this upload.
        file_version: i64,
        /// Present on the last file of a batch whose commit is deferred.
        deferred_upload_id: Option<Uuid>,
    },
    Gone(GoneReason),
}

// ============================================================================
// Downloads
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDownloadRequest {
    pub file_uuid: Uuid,
    pub file_group_id: Uuid,
    pub sharing_group_id: Uuid,
    pub file_version: i64,
    /// Correlates the response with the download tracker that issued it.
    pub tracker_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadFileResult {
    Success {
        local_path: PathBuf,
        checksum: String,
        app_meta_data: Option<String>,
        file_version: i64,
    },
    Gone(GoneReason),
}

// ============================================================================
// Deletions & Deferred Status
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionRequest {
    pub file_group_id: Uuid,
    pub sharing_group_id: Uuid,
    pub tracker_id: Uuid,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionResult {
    pub deferred_upload_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadsResultsQuery {
    Batch(Uuid),
    Deferred(Uuid),
}

/// Status of a deferred server-side job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeferredStatus {
    Error,
    PendingChange,
    PendingDeletion,
    Completed,
    /// The server has no record of the job.
    None,
}

impl DeferredStatus {
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            DeferredStatus::PendingChange | DeferredStatus::PendingDeletion
        )
    }
}

// ============================================================================
// Moving File Groups
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveFileGroupsRequest {
    pub file_group_ids: Vec<Uuid>,
    pub source_sharing_group_id: Uuid,
    pub dest_sharing_group_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MoveFileGroupsResult {
    Success,
    /// The server still has uploads in flight for one of the groups.
    CurrentUploads,
    /// Some owner of the moved groups is not a member of the destination.
    NotAllOwnersInTarget,
}

// ============================================================================
// Server API Trait
// ============================================================================

/// Client for the sync server.
///
/// Every method is asynchronous and independent; the engine may call several
/// concurrently. Implementations map transport failures to
/// [`BridgeError::Network`](crate::error::BridgeError::Network) so the engine
/// can tell them apart from protocol errors.
#[cfg_attr(target_arch = "wasm32", async_trait::async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait::async_trait)]
pub trait SyncServerApi: PlatformSendSync {
    /// Returns `true` when the stored credentials are accepted by the server.
    async fn check_creds(&self) -> Result<bool>;

    /// Fetch sharing groups, plus the file index when a group is given.
    async fn index(&self, sharing_group_id: Option<Uuid>) -> Result<IndexResult>;

    async fn upload_file(&self, request: FileUploadRequest) -> Result<UploadFileResult>;

    async fn download_file(&self, request: FileDownloadRequest) -> Result<DownloadFileResult>;

    async fn upload_deletion(&self, request: DeletionRequest) -> Result<DeletionResult>;

    async fn get_uploads_results(&self, query: UploadsResultsQuery) -> Result<DeferredStatus>;

    async fn move_file_groups(&self, request: MoveFileGroupsRequest)
        -> Result<MoveFileGroupsResult>;

    async fn send_push_notification(&self, message: String, sharing_group_id: Uuid)
        -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gone_reason_round_trip() {
        for reason in [
            GoneReason::FileRemovedOrRenamed,
            GoneReason::UserRemoved,
            GoneReason::AuthTokenExpiredOrRevoked,
        ] {
            assert_eq!(GoneReason::parse(reason.as_str()), Some(reason));
        }
        assert_eq!(GoneReason::parse("nope"), None);
    }

    #[test]
    fn test_deferred_status_pending() {
        assert!(DeferredStatus::PendingChange.is_pending());
        assert!(DeferredStatus::PendingDeletion.is_pending());
        assert!(!DeferredStatus::Completed.is_pending());
        assert!(!DeferredStatus::None.is_pending());
    }

    #[test]
    fn test_deferred_status_serialization() {
        let json = serde_json::to_string(&DeferredStatus::PendingChange).unwrap();
        assert_eq!(json, "\"pendingChange\"");
    }

    #[test]
    fn test_permission_parse() {
        assert_eq!(Permission::parse("admin"), Some(Permission::Admin));
        assert_eq!(Permission::parse(Permission::Write.as_str()), Some(Permission::Write));
        assert_eq!(Permission::parse("owner"), None);
    }
}
