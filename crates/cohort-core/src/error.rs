//! Error types for Cohort

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Cache invalidation failed for table {table}: {reason}")]
    Cache { table: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn cache(table: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Cache {
            table: table.into(),
            reason: reason.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidConfig(_) => "InvalidConfig",
            Error::InvalidArgument(_) => "InvalidArgument",
            Error::Cache { .. } => "CacheError",
            Error::Io(_) => "IoError",
            Error::Other(_) => "InternalError",
        }
    }
}
