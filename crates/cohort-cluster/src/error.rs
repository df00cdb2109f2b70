//! Cluster error types

use thiserror::Error;

use cohort_core::types::ManagerState;

/// Result type for cluster operations
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Cluster-related errors
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Failed to bind cluster listener on {address}: {source}")]
    Startup {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Operation not allowed in state {0}")]
    InvalidState(ManagerState),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Send to {member} failed: {reason}")]
    SendFailure { member: String, reason: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection to {0} closed before acknowledgement")]
    ConnectionClosed(String),

    #[error("Frame rejected by {member}: {reason}")]
    Rejected { member: String, reason: String },

    #[error("Transport is not listening")]
    NotListening,

    #[error("Frame of {size} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Unsupported wire version {0}")]
    UnsupportedVersion(u8),

    #[error("Core error: {0}")]
    Core(#[from] cohort_core::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClusterError {
    /// Errors raised while decoding inbound data
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            ClusterError::MalformedFrame(_) | ClusterError::UnsupportedVersion(_)
        )
    }

    /// Errors raised on this side before anything reached the peer. These
    /// say nothing about the peer's reachability.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            ClusterError::FrameTooLarge { .. } | ClusterError::NotListening
        )
    }

    /// Errors after which resending on a fresh connection may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClusterError::Io(_)
                | ClusterError::ConnectionClosed(_)
                | ClusterError::Transport(_)
                | ClusterError::SendFailure { .. }
        )
    }
}
