//! # Identifier Types
//!
//! Every identity in the engine is a random 128-bit UUID compared by equality
//! only. Each role gets its own newtype so a file UUID can never be passed
//! where a file group id is expected.

use crate::{Result, SyncError};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            /// Create a new random identifier
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Parse an identifier from its string form
            ///
            /// # Errors
            ///
            /// Returns an error if the string is not a valid UUID
            pub fn from_string(s: &str) -> Result<Self> {
                Uuid::parse_str(s).map(Self).map_err(|e| {
                    SyncError::InvalidId(format!("{} '{}': {}", stringify!($name), s, e))
                })
            }

            /// String representation used for database storage
            pub fn as_str(&self) -> String {
                self.0.to_string()
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

define_id!(
    /// Identity of an object (a group of files uploaded, downloaded and deleted together)
    FileGroupId
);
define_id!(
    /// Identity of one file within an object, stable across its versions
    FileUuid
);
define_id!(
    /// Identity of a sharing group on the server
    SharingGroupId
);
define_id!(
    /// Row identity of a tracker
    TrackerId
);
define_id!(
    /// Groups the files uploaded together in one batch
    BatchId
);
define_id!(
    /// Server-side job committing a deferred upload or deletion
    DeferredUploadId
);

/// Parse an optional id column.
pub(crate) fn parse_optional<T, F>(value: Option<String>, parse: F) -> Result<Option<T>>
where
    F: Fn(&str) -> Result<T>,
{
    value.as_deref().map(parse).transpose()
}
