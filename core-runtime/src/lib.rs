//! # Core Runtime Module
//!
//! Provides foundational runtime infrastructure for the media index pipeline:
//! - Logging and tracing infrastructure
//! - Configuration management
//! - Event bus system
//!
//! ## Overview
//!
//! This crate contains the runtime utilities the scan pipeline depends on.
//! It establishes the logging conventions, the fail-fast configuration
//! builder, and the typed event broadcasting used throughout the system.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use config::{ContentContext, CoreConfig, CoreConfigBuilder, Identity};
pub use error::{Error, Result};
pub use events::{CoreEvent, EventBus, EventStream};
