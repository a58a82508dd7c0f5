//! Workspace facade crate.
//!
//! Host applications depend on `object-sync` alone and reach the engine, its
//! configuration and the host-side traits through the re-exported crates.

pub use bridge_traits;
pub use core_runtime;
pub use core_sync;

pub use core_runtime::config::{SyncEngineConfig, SyncLimits};
pub use core_runtime::events::{CoreEvent, EventStream};
pub use core_sync::{SyncEngine, SyncError};
