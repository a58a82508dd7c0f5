//! # Event Bus System
//!
//! Typed notifications from the sync engine to its embedder, delivered over
//! `tokio::sync::broadcast`.
//!
//! ## Overview
//!
//! The event bus system consists of:
//! - **Event Types**: one enum per pipeline (upload, download, deletion,
//!   deferred reconciliation, sync pass) plus a non-fatal error channel
//! - **EventBus**: broadcast channel the engine publishes on
//! - **EventStream**: receiver wrapper with optional filtering
//!
//! The engine holds no reference to its embedder: anyone interested subscribes
//! and drops the receiver when done.
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{CoreEvent, EventBus, UploadEvent};
//! use uuid::Uuid;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let event_bus = EventBus::new(100);
//! let mut stream = event_bus.subscribe();
//!
//! event_bus.emit(CoreEvent::Upload(UploadEvent::Queued {
//!     file_group_id: Uuid::new_v4(),
//! })).ok();
//!
//! let event = stream.recv().await.unwrap();
//! assert!(matches!(event, CoreEvent::Upload(UploadEvent::Queued { .. })));
//! # }
//! ```
//!
//! ## Error Handling
//!
//! - **`RecvError::Lagged(n)`**: the subscriber missed `n` events; it can keep
//!   receiving newer ones.
//! - **`RecvError::Closed`**: the engine was dropped.
//!
//! Emitting with no subscribers returns an error which the engine ignores.

use bridge_traits::server::GoneReason;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tokio::sync::broadcast;
use uuid::Uuid;

pub use tokio::sync::broadcast::error::{RecvError, SendError};
pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

// ============================================================================
// Core Event Types
// ============================================================================

/// Top-level event enum encompassing all event categories.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    Upload(UploadEvent),
    Download(DownloadEvent),
    Deletion(DeletionEvent),
    Deferred(DeferredEvent),
    Sync(SyncEvent),
    /// Non-fatal failures and invariant violations.
    Error(ErrorEvent),
}

impl CoreEvent {
    /// Returns a human-readable description of the event.
    pub fn description(&self) -> &str {
        match self {
            CoreEvent::Upload(e) => e.description(),
            CoreEvent::Download(e) => e.description(),
            CoreEvent::Deletion(_) => "Object deleted",
            CoreEvent::Deferred(_) => "Deferred operations completed",
            CoreEvent::Sync(_) => "Sync pass completed",
            CoreEvent::Error(e) => e.description(),
        }
    }

    /// Returns the severity level of the event.
    pub fn severity(&self) -> EventSeverity {
        match self {
            CoreEvent::Error(ErrorEvent::Internal { .. }) => EventSeverity::Error,
            CoreEvent::Error(ErrorEvent::User { .. }) => EventSeverity::Warning,
            CoreEvent::Upload(UploadEvent::Completed {
                outcome: UploadOutcome::Gone { .. },
                ..
            }) => EventSeverity::Warning,
            CoreEvent::Upload(UploadEvent::Completed { .. })
            | CoreEvent::Download(DownloadEvent::Completed { .. })
            | CoreEvent::Deletion(_)
            | CoreEvent::Deferred(_) => EventSeverity::Info,
            _ => EventSeverity::Debug,
        }
    }
}

/// Event severity levels for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

// ============================================================================
// Upload Events
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum UploadEvent {
    /// Batch persisted but held back (another batch for the object is active,
    /// the concurrency limit is reached or the network is down).
    Queued { file_group_id: Uuid },
    /// Batch requests were sent.
    Started { file_group_id: Uuid, file_count: usize },
    /// Every file of the batch reached a terminal state.
    Completed {
        file_group_id: Uuid,
        outcome: UploadOutcome,
    },
}

impl UploadEvent {
    fn description(&self) -> &str {
        match self {
            UploadEvent::Queued { .. } => "Upload queued",
            UploadEvent::Started { .. } => "Upload started",
            UploadEvent::Completed { .. } => "Upload completed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum UploadOutcome {
    /// For later versions this only means the transfer finished; the commit
    /// is reported separately through [`DeferredEvent`].
    Success { v0_upload: bool },
    Gone { file_uuid: Uuid, reason: GoneReason },
}

// ============================================================================
// Download Events
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum DownloadEvent {
    Queued { file_group_id: Uuid },
    Completed { object: DownloadedObject },
    /// A sync pass started this many download objects.
    Sync { started: usize },
}

impl DownloadEvent {
    fn description(&self) -> &str {
        match self {
            DownloadEvent::Queued { .. } => "Download queued",
            DownloadEvent::Completed { .. } => "Download completed",
            DownloadEvent::Sync { .. } => "Downloads started",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DownloadedObject {
    pub file_group_id: Uuid,
    pub sharing_group_id: Uuid,
    pub files: Vec<DownloadedFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DownloadedFile {
    pub file_uuid: Uuid,
    pub file_label: String,
    pub file_version: i64,
    pub outcome: DownloadOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum DownloadOutcome {
    Downloaded {
        local_path: PathBuf,
        app_meta_data: Option<String>,
    },
    Gone { reason: GoneReason },
}

// ============================================================================
// Deletion, Deferred & Sync Events
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum DeletionEvent {
    Completed { file_group_id: Uuid },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeferredOperation {
    Upload,
    Deletion,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum DeferredEvent {
    Completed {
        operation: DeferredOperation,
        file_group_ids: Vec<Uuid>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum SyncEvent {
    Completed {
        sharing_group_id: Option<Uuid>,
        objects_needing_download: usize,
    },
}

// ============================================================================
// Error Events
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum ErrorEvent {
    /// Transient failure; the engine recovers through tracker expiry.
    User {
        message: String,
        file_group_id: Option<Uuid>,
    },
    /// A state that should be impossible. Needs investigation, not retry.
    Internal { message: String },
}

impl ErrorEvent {
    fn description(&self) -> &str {
        match self {
            ErrorEvent::User { .. } => "Sync operation failed",
            ErrorEvent::Internal { .. } => "Internal sync error",
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Central event bus for publishing and subscribing to events.
///
/// Cloning the bus clones the sender; every `subscribe()` creates an
/// independent receiver that sees events emitted after it was created.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// Creates a new event bus with the specified buffer size.
    ///
    /// Subscribers falling behind by more than `capacity` events receive
    /// `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event, or an error
    /// if there are none.
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        self.sender.send(event)
    }

    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ============================================================================
// Event Stream Wrapper
// ============================================================================

type EventFilter = Box<dyn Fn(&CoreEvent) -> bool + Send + Sync>;

/// A wrapper around `broadcast::Receiver` with optional filtering.
///
/// ```rust
/// use core_runtime::events::{CoreEvent, EventBus, EventStream};
///
/// let event_bus = EventBus::new(100);
/// let uploads = EventStream::new(event_bus.subscribe())
///     .filter(|event| matches!(event, CoreEvent::Upload(_)));
/// ```
pub struct EventStream {
    receiver: Receiver<CoreEvent>,
    filter: Option<EventFilter>,
}

impl EventStream {
    pub fn new(receiver: Receiver<CoreEvent>) -> Self {
        Self {
            receiver,
            filter: None,
        }
    }

    /// Only events matching `predicate` are returned by `recv()`/`try_recv()`.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CoreEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }

    fn matches(&self, event: &CoreEvent) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(event))
    }

    /// Receives the next event that passes the filter.
    pub async fn recv(&mut self) -> Result<CoreEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.matches(&event) {
                return Ok(event);
            }
        }
    }

    /// Returns `None` if no matching event is currently buffered.
    pub fn try_recv(&mut self) -> Option<Result<CoreEvent, RecvError>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.matches(&event) {
                        return Some(Ok(event));
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Some(Err(RecvError::Lagged(n)))
                }
                Err(broadcast::error::TryRecvError::Closed) => return Some(Err(RecvError::Closed)),
            }
        }
    }

    /// Drains every matching event currently buffered.
    pub fn drain(&mut self) -> Vec<CoreEvent> {
        let mut events = Vec::new();
        while let Some(result) = self.try_recv() {
            match result {
                Ok(event) => events.push(event),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
        events
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn queued() -> CoreEvent {
        CoreEvent::Upload(UploadEvent::Queued {
            file_group_id: Uuid::new_v4(),
        })
    }

    #[tokio::test]
    async fn test_event_emission_no_subscribers() {
        let bus = EventBus::new(10);
        assert_eq!(bus.subscriber_count(), 0);
        assert!(bus.emit(queued()).is_err());
    }

    #[tokio::test]
    async fn test_multiple_subscribers_receive_same_event() {
        let bus = EventBus::new(10);
        let mut sub1 = bus.subscribe();
        let mut sub2 = bus.subscribe();

        let event = CoreEvent::Deletion(DeletionEvent::Completed {
            file_group_id: Uuid::new_v4(),
        });
        assert_eq!(bus.emit(event.clone()).unwrap(), 2);

        assert_eq!(sub1.recv().await.unwrap(), event);
        assert_eq!(sub2.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn test_event_stream_with_filter() {
        let bus = EventBus::new(10);
        let mut stream = EventStream::new(bus.subscribe())
            .filter(|event| matches!(event, CoreEvent::Download(_)));

        bus.emit(queued()).ok();
        let download = CoreEvent::Download(DownloadEvent::Sync { started: 2 });
        bus.emit(download.clone()).ok();

        assert_eq!(stream.recv().await.unwrap(), download);
    }

    #[tokio::test]
    async fn test_drain_collects_buffered_events() {
        let bus = EventBus::new(10);
        let mut stream = EventStream::new(bus.subscribe());
        assert!(stream.try_recv().is_none());

        for _ in 0..3 {
            bus.emit(queued()).ok();
        }

        assert_eq!(stream.drain().len(), 3);
        assert!(stream.drain().is_empty());
    }

    #[tokio::test]
    async fn test_lagged_subscriber() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe();

        for _ in 0..5 {
            bus.emit(queued()).ok();
        }

        assert!(matches!(sub.recv().await, Err(RecvError::Lagged(_))));
    }

    #[test]
    fn test_event_severity() {
        let internal = CoreEvent::Error(ErrorEvent::Internal {
            message: "deferred status none".to_string(),
        });
        assert_eq!(internal.severity(), EventSeverity::Error);

        let gone = CoreEvent::Upload(UploadEvent::Completed {
            file_group_id: Uuid::new_v4(),
            outcome: UploadOutcome::Gone {
                file_uuid: Uuid::new_v4(),
                reason: GoneReason::UserRemoved,
            },
        });
        assert_eq!(gone.severity(), EventSeverity::Warning);

        let done = CoreEvent::Upload(UploadEvent::Completed {
            file_group_id: Uuid::new_v4(),
            outcome: UploadOutcome::Success { v0_upload: true },
        });
        assert_eq!(done.severity(), EventSeverity::Info);
        assert_eq!(queued().severity(), EventSeverity::Debug);
        assert_eq!(done.description(), "Upload completed");
    }

    #[test]
    fn test_event_serialization() {
        let event = CoreEvent::Deferred(DeferredEvent::Completed {
            operation: DeferredOperation::Upload,
            file_group_ids: vec![Uuid::new_v4()],
        });

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"Deferred\""));
        assert!(json.contains("\"operation\":\"upload\""));

        let deserialized: CoreEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, event);
    }
}
