//! # Host Bridge Traits
//!
//! Platform abstraction traits that each host platform implements.
//!
//! ## Overview
//!
//! This crate defines the contract between the offline core and the host.
//! Each trait represents a capability the core needs but that is implemented
//! differently per platform (desktop, iOS, Android).
//!
//! ## Traits
//!
//! ### Networking & I/O
//! - [`HttpClient`](http::HttpClient) - Async HTTP requests and streaming downloads
//! - [`FileSystemAccess`](storage::FileSystemAccess) - File I/O, free-space queries, offline storage
//!
//! ### Utilities
//! - [`Clock`](time::Clock) - Time source for deterministic testing
//! - [`LoggerSink`](time::LoggerSink) - Forward structured logs to host logging
//!
//! ## Platform Requirements
//!
//! | Platform | Implementation Crate |
//! |----------|---------------------|
//! | Desktop  | `bridge-desktop`    |
//! | iOS      | host-provided       |
//! | Android  | host-provided       |
//!
//! ## Error Handling
//!
//! All bridge traits use [`BridgeError`](error::BridgeError). The download
//! pipeline relies on one distinction: `BridgeError::Io` means local storage
//! failed (never retried), anything else is a transport problem.
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync` so implementations can be shared
//! across tokio tasks behind an `Arc`.

pub mod error;
pub mod http;
pub mod storage;
pub mod time;

pub use error::BridgeError;

pub use http::{
    ByteStream, DownloadStream, HttpClient, HttpMethod, HttpRequest, HttpResponse, RetryPolicy,
};
pub use storage::{FileMetadata, FileSystemAccess, ProgressFn};
pub use time::{Clock, ConsoleLogger, LogEntry, LogLevel, LoggerSink, ManualClock, SystemClock};
