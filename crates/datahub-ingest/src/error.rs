//! Error types for the ingestion pipeline
//!
//! One enum per pipeline stage. [`IngestError`] wraps them so a group run can
//! report any stage's failure through a single type.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for ingestion operations
pub type Result<T> = std::result::Result<T, IngestError>;

/// Failure to map a logical series onto its dataset location
#[derive(Error, Debug, Clone)]
pub enum ResolutionError {
    #[error("Metadata request for series {series_id} failed: {message}")]
    Request { series_id: String, message: String },

    #[error("Metadata request for series {series_id} timed out after {timeout_secs}s")]
    Timeout { series_id: String, timeout_secs: u64 },

    #[error("Metadata request for series {series_id} returned HTTP {status}")]
    Status { series_id: String, status: u16 },

    #[error("No metadata entry returned for series {0}")]
    NotFound(String),

    #[error("Metadata for series {series_id} has a missing or malformed '{field}'")]
    MissingField {
        series_id: String,
        field: &'static str,
    },
}

/// Failure to retrieve or decode one series' data
#[derive(Error, Debug, Clone)]
pub enum FetchError {
    #[error("Request to {url} failed: {message}")]
    Request { url: String, message: String },

    #[error("Request to {url} timed out after {timeout_secs}s")]
    Timeout { url: String, timeout_secs: u64 },

    #[error("Request to {url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("Malformed JSON-stat payload: {0}")]
    Malformed(String),

    #[error("Dataset has no time dimension")]
    NoTimeDimension,

    #[error("Unparsable date '{0}' in time dimension")]
    InvalidDate(String),

    #[error("No observations left for {0} after filtering")]
    Empty(String),
}

impl FetchError {
    /// Create a malformed payload error
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed(message.into())
    }
}

/// Failure at the join barrier
#[derive(Error, Debug)]
pub enum MergeError {
    #[error("Group '{0}' produced no rows to merge")]
    Empty(String),

    #[error("Group '{group}' is strict and is missing series: {}", .series.join(", "))]
    MissingSeries { group: String, series: Vec<String> },
}

/// Failure while writing or reading the relational store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Refusing to reconcile an empty batch for series '{0}'")]
    EmptyBatch(String),

    #[error("Stored row is invalid: {0}")]
    InvalidRow(String),
}

/// Failure to write the daily snapshot document
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("Failed to write snapshot {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize snapshot: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to read indicators for snapshot: {0}")]
    Store(#[from] StoreError),
}

impl SnapshotError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Any failure of the ingestion pipeline
#[derive(Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error("Invalid catalog: {0}")]
    Catalog(String),

    #[error(transparent)]
    Config(#[from] datahub_common::DatahubError),

    #[error("Failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

impl IngestError {
    /// Create a catalog error
    pub fn catalog(message: impl Into<String>) -> Self {
        Self::Catalog(message.into())
    }
}

impl From<sqlx::Error> for IngestError {
    fn from(err: sqlx::Error) -> Self {
        Self::Store(StoreError::Database(err))
    }
}
