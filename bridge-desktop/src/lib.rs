//! # Desktop Bridge Implementations
//!
//! Default implementations of bridge traits for desktop and server hosts.
//!
//! ## Overview
//!
//! - `HttpClient` using `reqwest`
//! - `RemoteStore` over HTTP (`HttpRemoteStore`) or in memory (`MemoryRemoteStore`)
//! - `LocalCache` using an SQLite-backed key-value table
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_desktop::{HttpRemoteStore, ReqwestHttpClient, SqliteLocalCache};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> bridge_traits::error::Result<()> {
//!     let http_client = Arc::new(ReqwestHttpClient::new()?);
//!     let remote = HttpRemoteStore::new(http_client, "https://content.example.com")
//!         .with_token(std::env::var("CONTENT_TOKEN").unwrap_or_default());
//!     let cache = SqliteLocalCache::new("cache/media-index.db".into()).await?;
//!
//!     // Hand both to the core configuration
//!     Ok(())
//! }
//! ```

mod cache;
mod http;
mod memory;
mod remote_store;

pub use cache::SqliteLocalCache;
pub use http::ReqwestHttpClient;
pub use memory::MemoryRemoteStore;
pub use remote_store::HttpRemoteStore;
