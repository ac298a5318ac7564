//! # Host Bridge Traits
//!
//! Capability traits the media index pipeline requires from its host.
//!
//! ## Overview
//!
//! This crate defines the contract between the scan pipeline and the
//! environment it runs in. Each trait represents a capability the core needs
//! but that is implemented differently per host (desktop process, test
//! harness, embedded service).
//!
//! ## Traits
//!
//! ### Storage
//! - [`RemoteStore`](storage::RemoteStore) - Key-path JSON blob store holding the content tree and its metadata
//! - [`LocalCache`](storage::LocalCache) - Embedded key-value cache surviving restarts
//!
//! ### Networking
//! - [`HttpClient`](http::HttpClient) - Async HTTP with retry and `retry-after` support
//!
//! ### Utilities
//! - [`Clock`](time::Clock) - Time source for deterministic testing
//! - [`LoggerSink`](time::LoggerSink) - Forward structured logs to host logging
//!
//! ## Error Handling
//!
//! All bridge traits use the [`BridgeError`](error::BridgeError) type. Implementations
//! should convert backend-specific errors to `BridgeError`, report a missing
//! record as `Ok(None)` rather than an error, and keep rate limiting internal.
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync` so they can be shared across async
//! tasks and scan workers behind an `Arc`.

pub mod error;
pub mod http;
pub mod storage;
pub mod time;

pub use error::BridgeError;

// Re-export commonly used types
pub use http::{HttpClient, HttpMethod, HttpRequest, HttpResponse, RetryPolicy};
pub use storage::{CacheCollection, LocalCache, RemoteEntry, RemoteStore};
pub use time::{Clock, LogEntry, LogLevel, LoggerSink, ManualClock, SystemClock};
