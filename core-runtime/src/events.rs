//! # Event Bus System
//!
//! Typed event broadcasting for the media index pipeline using `tokio::sync::broadcast`.
//!
//! ## Overview
//!
//! The event bus system consists of:
//! - **Event Types**: A closed set of tagged enums, one per pipeline component
//! - **EventBus**: Central broadcast channel for publishing events
//! - **EventStream**: Wrapper for consuming events with filtering
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐    emit     ┌───────────┐
//! │ Orchestrator ├────────────>│           │
//! └──────────────┘             │           │    subscribe    ┌────────────┐
//! ┌──────────────┐    emit     │ EventBus  ├────────────────>│ Progress UI│
//! │ Worker Coord ├────────────>│ (broadcast│                 └────────────┘
//! └──────────────┘             │  channel) │    subscribe    ┌────────────┐
//! ┌──────────────┐    emit     │           ├────────────────>│ Audit tail │
//! │ Upload Proc  ├────────────>│           │                 └────────────┘
//! └──────────────┘             └───────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{CoreEvent, EventBus, PipelineEvent};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let event_bus = EventBus::new(100);
//! let mut stream = event_bus.subscribe();
//!
//! event_bus
//!     .emit(CoreEvent::Pipeline(PipelineEvent::StateChanged {
//!         session_id: "s-1".to_string(),
//!         from: "idle".to_string(),
//!         to: "checking_discovery".to_string(),
//!     }))
//!     .ok();
//!
//! let event = stream.recv().await.unwrap();
//! assert!(matches!(event, CoreEvent::Pipeline(_)));
//! # }
//! ```
//!
//! ## Error Handling
//!
//! - **`RecvError::Lagged(n)`**: Subscriber was too slow and missed `n` events.
//!   Non-fatal; the subscriber keeps receiving newer events.
//! - **`RecvError::Closed`**: All senders have been dropped. Treat as shutdown.
//!
//! Emitting with no subscribers returns an error; publishers ignore it with `.ok()`.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

pub use tokio::sync::broadcast::error::{RecvError, SendError};
pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 256;

// ============================================================================
// Core Event Types
// ============================================================================

/// Top-level event enum encompassing all event categories.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    /// Queue orchestrator lifecycle
    Pipeline(PipelineEvent),
    /// Discovery crawl progress
    Discovery(DiscoveryEvent),
    /// Page scanning progress
    Scan(ScanEvent),
    /// Batch upload outcomes
    Upload(UploadEvent),
    /// Session lock changes
    Session(SessionEvent),
}

impl CoreEvent {
    /// Human-readable description of the event
    pub fn description(&self) -> &str {
        match self {
            CoreEvent::Pipeline(e) => e.description(),
            CoreEvent::Discovery(e) => e.description(),
            CoreEvent::Scan(e) => e.description(),
            CoreEvent::Upload(e) => e.description(),
            CoreEvent::Session(e) => e.description(),
        }
    }

    /// Severity used by subscribers that surface events to users
    pub fn severity(&self) -> EventSeverity {
        match self {
            CoreEvent::Pipeline(PipelineEvent::Failed { .. }) => EventSeverity::Error,
            CoreEvent::Upload(UploadEvent::BatchFailed { .. }) => EventSeverity::Warning,
            CoreEvent::Scan(ScanEvent::PageFailed { .. }) => EventSeverity::Warning,
            CoreEvent::Session(SessionEvent::StaleCleared { .. })
            | CoreEvent::Session(SessionEvent::Paused { .. }) => EventSeverity::Warning,
            CoreEvent::Pipeline(PipelineEvent::Completed { .. })
            | CoreEvent::Discovery(DiscoveryEvent::Completed { .. }) => EventSeverity::Info,
            _ => EventSeverity::Debug,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

// ============================================================================
// Pipeline Events
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum PipelineEvent {
    StateChanged {
        session_id: String,
        from: String,
        to: String,
    },
    Completed {
        session_id: String,
        final_state: String,
        scanned_pages: u64,
        failed_pages: u64,
        total_media: u64,
    },
    Failed {
        session_id: String,
        message: String,
    },
}

impl PipelineEvent {
    fn description(&self) -> &str {
        match self {
            PipelineEvent::StateChanged { .. } => "Pipeline state changed",
            PipelineEvent::Completed { .. } => "Scan cycle finished",
            PipelineEvent::Failed { .. } => "Scan cycle failed",
        }
    }
}

// ============================================================================
// Discovery Events
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum DiscoveryEvent {
    Started {
        discovery_type: String,
        total_folders: u64,
    },
    FolderCompleted {
        folder: String,
        documents: u64,
        completed_folders: u64,
        total_folders: u64,
    },
    Completed {
        discovery_type: String,
        total_documents: u64,
        skipped: bool,
    },
}

impl DiscoveryEvent {
    fn description(&self) -> &str {
        match self {
            DiscoveryEvent::Started { .. } => "Discovery started",
            DiscoveryEvent::FolderCompleted { .. } => "Folder discovered",
            DiscoveryEvent::Completed { .. } => "Discovery completed",
        }
    }
}

// ============================================================================
// Scan Events
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum ScanEvent {
    PageScanned {
        page: String,
        media_count: u64,
    },
    PageFailed {
        page: String,
        message: String,
    },
    BatchCompleted {
        processed_count: u64,
        total_media: u64,
    },
}

impl ScanEvent {
    fn description(&self) -> &str {
        match self {
            ScanEvent::PageScanned { .. } => "Page scanned",
            ScanEvent::PageFailed { .. } => "Page scan failed",
            ScanEvent::BatchCompleted { .. } => "Scan batch completed",
        }
    }
}

// ============================================================================
// Upload Events
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum UploadEvent {
    BatchUploaded {
        batch_id: String,
        batch_number: u64,
        media_count: u64,
        attempts: u32,
    },
    BatchFailed {
        batch_id: String,
        batch_number: u64,
        attempts: u32,
        message: String,
    },
}

impl UploadEvent {
    fn description(&self) -> &str {
        match self {
            UploadEvent::BatchUploaded { .. } => "Media batch uploaded",
            UploadEvent::BatchFailed { .. } => "Media batch failed",
        }
    }
}

// ============================================================================
// Session Events
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum SessionEvent {
    Acquired {
        session_id: String,
        user_id: String,
    },
    Released {
        session_id: String,
        status: String,
    },
    StaleCleared {
        session_id: String,
        heartbeat_age_secs: u64,
    },
    Paused {
        session_id: String,
        primary_session_id: String,
    },
}

impl SessionEvent {
    fn description(&self) -> &str {
        match self {
            SessionEvent::Acquired { .. } => "Scan lock acquired",
            SessionEvent::Released { .. } => "Scan lock released",
            SessionEvent::StaleCleared { .. } => "Stale scan lock cleared",
            SessionEvent::Paused { .. } => "Secondary session paused",
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Central event bus for broadcasting events to multiple subscribers.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// Creates a new event bus with the specified buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emits an event to all current subscribers.
    ///
    /// Returns the number of subscribers that received the event, or an
    /// error when nobody is listening.
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        self.sender.send(event)
    }

    /// Creates a new subscription to the event bus.
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

/// Subscription wrapper with an optional filter predicate.
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

    /// Only yield events matching `predicate`
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CoreEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }

    /// Receives the next matching event.
    pub async fn recv(&mut self) -> Result<CoreEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;

            let Some(filter) = &self.filter else {
                return Ok(event);
            };

            if filter(&event) {
                return Ok(event);
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<Result<CoreEvent, RecvError>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    let Some(filter) = &self.filter else {
                        return Some(Ok(event));
                    };

                    if filter(&event) {
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
