//! Cohort Core Library
//!
//! Core types, configuration and the cache invalidation seam shared by the
//! Cohort cluster broadcast layer.

pub mod cache;
pub mod config;
pub mod error;
pub mod types;

pub use cache::{CacheInvalidator, MemoryCache};
pub use config::CohortConfig;
pub use error::{Error, Result};

/// Cohort version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default cluster listening port
pub const DEFAULT_CLUSTER_PORT: u16 = 9301;

/// Current wire protocol version
pub const WIRE_VERSION: u8 = 1;

/// Default maximum frame size (16 MiB)
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;
