//! # Core Runtime Module
//!
//! Foundational runtime infrastructure for the object sync core:
//! - Logging and tracing infrastructure
//! - Engine configuration
//! - Event bus the engine reports progress through
//!
//! ## Overview
//!
//! The sync engine in `core-sync` depends on this crate for everything that is
//! not sync logic proper. Hosts use it to configure logging, build a
//! [`SyncEngineConfig`](config::SyncEngineConfig) and subscribe to
//! [`CoreEvent`](events::CoreEvent)s.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};
