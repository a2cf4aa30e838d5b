//! # Event Bus System
//!
//! Broadcasts cache and download lifecycle events using `tokio::sync::broadcast`
//! so hosts can render progress without polling the store.
//!
//! ## Overview
//!
//! The event bus system consists of:
//! - **Event Types**: `CoreEvent` wrapping per-domain enums (`CacheEvent`, `DownloadEvent`)
//! - **EventBus**: Central broadcast channel for publishing events
//! - **EventStream**: Wrapper for consuming events with filtering
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{CoreEvent, DownloadEvent, EventBus, EventStream};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let event_bus = EventBus::new(100);
//! let mut progress = EventStream::new(event_bus.subscribe())
//!     .filter(|event| matches!(event, CoreEvent::Download(DownloadEvent::Progress { .. })));
//!
//! event_bus
//!     .emit(CoreEvent::Download(DownloadEvent::Progress {
//!         course_id: "42".to_string(),
//!         bytes_downloaded: 10,
//!         bytes_total: 60,
//!         status: "inProgress".to_string(),
//!     }))
//!     .ok();
//!
//! let event = progress.recv().await.unwrap();
//! assert_eq!(event.severity(), core_runtime::events::EventSeverity::Debug);
//! # }
//! ```
//!
//! ## Error Handling
//!
//! - **`RecvError::Lagged(n)`**: Subscriber was too slow and missed `n` events.
//!   Progress events are cumulative, so a lagging subscriber only loses
//!   intermediate ticks.
//! - **`RecvError::Closed`**: All senders have been dropped. This indicates shutdown.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

// Re-export commonly used types
pub use tokio::sync::broadcast::error::{RecvError, SendError};
pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
///
/// Subscribers that can't keep up will receive `RecvError::Lagged`.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

// ============================================================================
// Core Event Types
// ============================================================================

/// Top-level event enum published through the event bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    /// Cache freshness and invalidation events
    Cache(CacheEvent),
    /// Offline course download events
    Download(DownloadEvent),
}

impl CoreEvent {
    /// Returns a human-readable description of the event.
    pub fn description(&self) -> &str {
        match self {
            CoreEvent::Cache(e) => e.description(),
            CoreEvent::Download(e) => e.description(),
        }
    }

    /// Returns the severity level of the event.
    pub fn severity(&self) -> EventSeverity {
        match self {
            CoreEvent::Cache(CacheEvent::RefreshFailed { .. }) => EventSeverity::Warning,
            CoreEvent::Download(DownloadEvent::Paused { .. }) => EventSeverity::Warning,
            CoreEvent::Download(DownloadEvent::ItemStatusChanged { status, .. })
                if status == "failed" =>
            {
                EventSeverity::Error
            }
            CoreEvent::Download(DownloadEvent::Finished { failed_files, .. })
                if *failed_files > 0 =>
            {
                EventSeverity::Error
            }
            CoreEvent::Download(DownloadEvent::Finished { .. }) => EventSeverity::Info,
            CoreEvent::Download(DownloadEvent::Admitted { .. }) => EventSeverity::Info,
            _ => EventSeverity::Debug,
        }
    }
}

/// Event severity levels for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    /// Debug-level events (verbose)
    Debug,
    /// Informational events
    Info,
    /// Warning events
    Warning,
    /// Error events
    Error,
}

// ============================================================================
// Cache Events
// ============================================================================

/// Events emitted by the cache policy engine and the reactive store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum CacheEvent {
    /// A use case fetched from the network and wrote through to the store.
    Refreshed {
        /// Cache key recorded for the fetch, if the use case has one.
        cache_key: Option<String>,
        /// Number of pages written.
        pages: u32,
    },
    /// Cache entries were deleted by prefix.
    Invalidated {
        /// Key prefix that was invalidated.
        prefix: String,
        /// Number of entries removed.
        removed: u64,
    },
    /// A refresh failed; the store still holds the last known good data.
    RefreshFailed {
        cache_key: Option<String>,
        message: String,
    },
}

impl CacheEvent {
    fn description(&self) -> &str {
        match self {
            CacheEvent::Refreshed { .. } => "Cache refreshed",
            CacheEvent::Invalidated { .. } => "Cache invalidated",
            CacheEvent::RefreshFailed { .. } => "Cache refresh failed",
        }
    }
}

// ============================================================================
// Download Events
// ============================================================================

/// Events emitted by the offline course download pipeline.
///
/// Statuses are carried as their wire strings (`notStarted`, `inProgress`,
/// `completed`, `failed`, `cancelled`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum DownloadEvent {
    /// A batch of courses passed the disk budget check.
    Admitted {
        course_ids: Vec<String>,
        reserved_bytes: u64,
    },
    /// Aggregate progress for one course.
    Progress {
        course_id: String,
        bytes_downloaded: u64,
        bytes_total: u64,
        status: String,
    },
    /// A single download item changed status.
    ItemStatusChanged {
        course_id: String,
        item_key: String,
        status: String,
    },
    /// Remaining queued items were held back after a disk-write failure.
    Paused {
        course_id: String,
        reason: String,
    },
    /// A course run ended (completed, failed, cancelled, or paused).
    Finished {
        course_id: String,
        status: String,
        completed_files: u64,
        failed_files: u64,
    },
    /// A downloaded course was removed from disk.
    Removed {
        course_id: String,
        freed_bytes: u64,
    },
}

impl DownloadEvent {
    fn description(&self) -> &str {
        match self {
            DownloadEvent::Admitted { .. } => "Download admitted",
            DownloadEvent::Progress { .. } => "Download in progress",
            DownloadEvent::ItemStatusChanged { .. } => "Download item changed",
            DownloadEvent::Paused { .. } => "Download paused",
            DownloadEvent::Finished { .. } => "Download finished",
            DownloadEvent::Removed { .. } => "Download removed",
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Central event bus for publishing and subscribing to events.
///
/// Uses `tokio::sync::broadcast` internally, which provides:
/// - Multiple producers (clone the `EventBus`)
/// - Multiple consumers (each `subscribe()` creates a new receiver)
/// - Non-blocking sends (events are cloned for each subscriber)
/// - Lagging detection (slow subscribers get `RecvError::Lagged`)
///
/// # Example
///
/// ```rust
/// use core_runtime::events::{EventBus, CoreEvent, DownloadEvent};
///
/// # #[tokio::main]
/// # async fn main() {
/// let event_bus = EventBus::new(100);
///
/// // Subscribe to events
/// let mut subscriber1 = event_bus.subscribe();
/// let mut subscriber2 = event_bus.subscribe();
///
/// // Emit an event
/// let event = CoreEvent::Download(DownloadEvent::Removed {
///     course_id: "42".to_string(),
///     freed_bytes: 1024,
/// });
/// event_bus.emit(event).ok();
///
/// // Both subscribers receive the event
/// # tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
/// # }
/// ```
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// Creates a new event bus with the specified buffer size.
    ///
    /// # Arguments
    ///
    /// * `capacity` - Maximum number of events to buffer per subscriber.
    ///   When a subscriber falls behind by more than this amount, it will
    ///   receive a `RecvError::Lagged` error.
    ///
    /// # Example
    ///
    /// ```rust
    /// use core_runtime::events::EventBus;
    ///
    /// let event_bus = EventBus::new(100);
    /// ```
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Creates a new event bus with the default buffer size.
    ///
    /// # Example
    ///
    /// ```rust
    /// use core_runtime::events::EventBus;
    ///
    /// let event_bus = EventBus::default();
    /// ```
    #[allow(clippy::should_implement_trait)]
    pub fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event.
    /// Returns an error if there are no active subscribers.
    ///
    /// # Example
    ///
    /// ```rust
    /// use core_runtime::events::{EventBus, CoreEvent, CacheEvent};
    ///
    /// let event_bus = EventBus::new(100);
    /// let event = CoreEvent::Cache(CacheEvent::Invalidated {
    ///     prefix: "inbox/".to_string(),
    ///     removed: 2,
    /// });
    ///
    /// match event_bus.emit(event) {
    ///     Ok(n) => println!("Event sent to {} subscribers", n),
    ///     Err(_) => println!("No active subscribers"),
    /// }
    /// ```
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        self.sender.send(event)
    }

    /// Creates a new subscriber to receive events.
    ///
    /// Each call creates an independent receiver that will receive all future events.
    /// Past events are not replayed.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use core_runtime::events::EventBus;
    ///
    /// # #[tokio::main]
    /// # async fn main() {
    /// let event_bus = EventBus::new(100);
    /// let mut subscriber = event_bus.subscribe();
    ///
    /// tokio::spawn(async move {
    ///     while let Ok(event) = subscriber.recv().await {
    ///         println!("Received: {:?}", event);
    ///     }
    /// });
    /// # }
    /// ```
    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    /// Returns the number of active subscribers.
    ///
    /// # Example
    ///
    /// ```rust
    /// use core_runtime::events::EventBus;
    ///
    /// let event_bus = EventBus::new(100);
    /// assert_eq!(event_bus.subscriber_count(), 0);
    ///
    /// let _subscriber = event_bus.subscribe();
    /// assert_eq!(event_bus.subscriber_count(), 1);
    /// ```
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
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

/// Type alias for event filter functions.
type EventFilter = Box<dyn Fn(&CoreEvent) -> bool + Send + Sync>;

/// A wrapper around `broadcast::Receiver` with additional filtering capabilities.
///
/// This provides a more ergonomic API for consuming events with optional filtering
/// by event type or severity.
///
/// # Example
///
/// ```rust
/// use core_runtime::events::{EventBus, EventStream, CoreEvent};
///
/// # #[tokio::main]
/// # async fn main() {
/// let event_bus = EventBus::new(100);
/// let stream = EventStream::new(event_bus.subscribe());
///
/// // Filter for download events only
/// let mut downloads = stream.filter(|event| {
///     matches!(event, CoreEvent::Download(_))
/// });
/// # }
/// ```
pub struct EventStream {
    receiver: Receiver<CoreEvent>,
    filter: Option<EventFilter>,
}

impl EventStream {
    /// Creates a new event stream from a receiver.
    pub fn new(receiver: Receiver<CoreEvent>) -> Self {
        Self {
            receiver,
            filter: None,
        }
    }

    /// Adds a filter function to this stream.
    ///
    /// Only events that match the filter will be returned by `recv()`.
    ///
    /// # Example
    ///
    /// ```rust
    /// use core_runtime::events::{EventBus, EventStream, CoreEvent};
    ///
    /// let event_bus = EventBus::new(100);
    /// let stream = EventStream::new(event_bus.subscribe());
    ///
    /// let downloads = stream.filter(|event| {
    ///     matches!(event, CoreEvent::Download(_))
    /// });
    /// ```
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CoreEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }

    /// Receives the next event that passes the filter (if any).
    ///
    /// This will skip events that don't match the filter and return the next matching event.
    ///
    /// # Errors
    ///
    /// Returns `RecvError::Lagged(n)` if the subscriber fell behind by `n` events.
    /// Returns `RecvError::Closed` if all senders have been dropped.
    pub async fn recv(&mut self) -> Result<CoreEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;

            // If no filter, return immediately
            let Some(filter) = &self.filter else {
                return Ok(event);
            };

            // Apply filter
            if filter(&event) {
                return Ok(event);
            }

            // Event didn't match filter, continue to next event
        }
    }

    /// Attempts to receive an event without blocking.
    ///
    /// Returns `None` if no events are currently available.
    pub fn try_recv(&mut self) -> Option<Result<CoreEvent, RecvError>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    // If no filter, return immediately
                    let Some(filter) = &self.filter else {
                        return Some(Ok(event));
                    };

                    // Apply filter
                    if filter(&event) {
                        return Some(Ok(event));
                    }

                    // Event didn't match filter, continue
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
