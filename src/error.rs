//! Application error types for property-sync
//!
//! This module defines the error taxonomy used by the sync engine.
//! All error types use `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Errors raised while turning an upstream record into a canonical row
/// or while persisting it
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MapperError {
    /// A required field is absent or null
    #[error("{entity}: missing required field '{field}'")]
    MissingField { entity: String, field: String },

    /// A field is present but has the wrong shape
    #[error("{entity}: invalid field '{field}': {reason}")]
    InvalidField {
        entity: String,
        field: String,
        reason: String,
    },

    /// The upsert into local storage failed
    #[error("{entity}: upsert failed: {reason}")]
    Upsert { entity: String, reason: String },
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DbError {
    /// SQLite error
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Record not found
    #[error("Record not found")]
    NotFound,

    /// Stored value could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The background connection thread is gone or refused the call
    #[error("Connection error: {0}")]
    Connection(String),
}

impl From<tokio_rusqlite::Error> for DbError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        match err {
            tokio_rusqlite::Error::Rusqlite(e) => DbError::Sqlite(e),
            other => DbError::Connection(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::Serialization(err.to_string())
    }
}

/// Synchronization-related errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SyncError {
    /// Request exceeded its timeout
    #[error("Network timeout")]
    Timeout,

    /// Connection refused, reset or otherwise broken in transit
    #[error("Network error: {0}")]
    Network(String),

    /// Rate limited by upstream (HTTP 429)
    #[error("Rate limited by upstream")]
    RateLimited {
        /// Seconds from the Retry-After header, when present
        retry_after_secs: Option<u64>,
    },

    /// Upstream rejected the request (4xx other than 429)
    #[error("Client error: HTTP {status}: {message}")]
    ClientError { status: u16, message: String },

    /// Upstream failed (5xx)
    #[error("Server error: HTTP {0}")]
    ServerError(u16),

    /// Circuit breaker refused the call without touching the network
    #[error("Circuit open, retry in {retry_in_ms} ms")]
    CircuitOpen { retry_in_ms: u64 },

    /// Response body could not be understood
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Mapping or upsert of a record failed
    #[error("Mapper error: {0}")]
    Mapper(#[from] MapperError),

    /// Local persistence failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// The run was asked to stop before this entity started
    #[error("Run stopped before {0}")]
    Stopped(String),

    /// No run could be started (scheduler down or upstream not configured)
    #[error("Sync unavailable: {0}")]
    Unavailable(String),
}

impl From<DbError> for SyncError {
    fn from(err: DbError) -> Self {
        SyncError::Storage(err.to_string())
    }
}

/// Dead letter queue errors
#[derive(Debug, Error)]
pub enum DlqError {
    /// No item with the given id
    #[error("DLQ item not found: {0}")]
    NotFound(String),

    /// The item already used up its retry budget
    #[error("DLQ item {id} exhausted its retries ({retry_count}/{max_retries})")]
    RetriesExhausted {
        id: String,
        retry_count: u32,
        max_retries: u32,
    },

    /// Storage failure
    #[error("DLQ storage error: {0}")]
    Database(#[from] DbError),
}

/// OpenTelemetry-related errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum OtelError {
    /// Failed to initialize tracer
    #[error("Failed to initialize tracer: {0}")]
    TracerInit(String),

    /// Failed to initialize meter
    #[error("Failed to initialize meter: {0}")]
    MeterInit(String),

    /// Failed to shutdown
    #[error("Failed to shutdown: {0}")]
    Shutdown(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Trait for determining if an error is retryable
pub trait RetryableError {
    /// Returns true if the error is retryable
    fn is_retryable(&self) -> bool;

    /// Minimum wait the upstream asked for before the next attempt
    fn retry_after_secs(&self) -> Option<u64> {
        None
    }
}

impl RetryableError for SyncError {
    fn is_retryable(&self) -> bool {
        match self {
            // Transient
            SyncError::Timeout => true,
            SyncError::Network(_) => true,
            SyncError::RateLimited { .. } => true,
            SyncError::ServerError(_) => true,

            // Terminal
            SyncError::ClientError { .. } => false,
            SyncError::CircuitOpen { .. } => false,
            SyncError::InvalidData(_) => false,
            SyncError::Mapper(_) => false,
            SyncError::Storage(_) => false,
            SyncError::Stopped(_) => false,
            SyncError::Unavailable(_) => false,
        }
    }

    fn retry_after_secs(&self) -> Option<u64> {
        match self {
            SyncError::RateLimited { retry_after_secs } => *retry_after_secs,
            _ => None,
        }
    }
}
