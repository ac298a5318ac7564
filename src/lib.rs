//! Workspace facade crate.
//!
//! Re-exports the scan pipeline together with the runtime and bridge crates it
//! is wired from, so host applications can depend on `media-index-workspace`
//! alone. The `desktop-shims` feature (on by default) adds the native
//! `bridge-desktop` implementations of the storage contracts.

pub use bridge_traits as bridge;
pub use core_runtime as runtime;
pub use core_scan as scan;

#[cfg(feature = "desktop-shims")]
pub use bridge_desktop as desktop;

pub use core_scan::{QueueOrchestrator, ScanConfig, ScanError, ScanOptions, ScanReport};
