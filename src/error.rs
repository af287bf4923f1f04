//! Error types for the indexing engine.
//!
//! This module provides a unified error type [`IndexerError`] that covers
//! every failure the engine can surface: configuration validation, the
//! connection lifecycle, retried requests, scan operations, and the
//! persistence store.
//!
//! # Design
//!
//! The error hierarchy is organized by layer:
//! - [`IndexerError::ConfigError`]: Rejected configuration (fatal, no retry)
//! - [`IndexerError::ConnectionError`]: Handshake, subscription and disconnect failures
//! - [`IndexerError::RequestError`]: A request that exhausted its retry budget
//! - [`IndexerError::ScanError`]: Failures raised by a scan operation
//! - [`IndexerError::DatabaseError`]: Persistence store I/O
//! - [`IndexerError::EncodingError`]: Event payload (de)serialization
//! - [`IndexerError::StateError`]: Persisted state that cannot be trusted
//!
//! # Example
//!
//! ```
//! use bloxer::error::{IndexerError, IndexerResult};
//!
//! fn check_range(start: u64, end: u64) -> IndexerResult<()> {
//!     if start > end {
//!         return Err(IndexerError::state("range is inverted", None));
//!     }
//!     Ok(())
//! }
//! ```

use std::fmt;

/// Result type alias using [`IndexerError`].
pub type IndexerResult<T> = Result<T, IndexerError>;

/// Boxed error source carried by most variants.
pub type BoxedSource = Box<dyn std::error::Error + Send + Sync>;

/// Unified error type for the indexing engine.
#[derive(Debug)]
pub enum IndexerError {
    /// Configuration errors.
    ///
    /// Raised synchronously while building an indexer:
    /// - Missing or malformed `wsUrl`
    /// - Negative or non-numeric numeric options
    /// - Merged configuration that does not deserialize
    ConfigError {
        /// Human-readable error message
        message: String,
        /// Optional underlying error
        source: Option<BoxedSource>,
    },

    /// Connection lifecycle errors.
    ///
    /// Variants include:
    /// - Handshake failures
    /// - Block subscription failures
    /// - Disconnect failures
    ConnectionError {
        /// Human-readable error message
        message: String,
        /// Optional underlying error
        source: Option<BoxedSource>,
    },

    /// A request to the connection failed after every retry.
    RequestError {
        /// Human-readable error message
        message: String,
        /// Optional underlying error
        source: Option<BoxedSource>,
    },

    /// Errors raised by a scan operation.
    ScanError {
        /// Human-readable error message
        message: String,
        /// Optional underlying error
        source: Option<BoxedSource>,
    },

    /// Persistence store errors.
    ///
    /// Variants include:
    /// - Open/connect failures
    /// - Migration failures
    /// - Query execution errors
    /// - Transaction errors
    DatabaseError {
        /// Human-readable error message
        message: String,
        /// Optional underlying error
        source: Option<BoxedSource>,
    },

    /// Event payload encoding or decoding errors.
    EncodingError {
        /// Human-readable error message
        message: String,
        /// Optional underlying error
        source: Option<BoxedSource>,
    },

    /// Persisted state is inconsistent with the chain.
    ///
    /// Never retried: the checkpoint cannot be trusted.
    StateError {
        /// Human-readable error message
        message: String,
        /// Optional underlying error
        source: Option<BoxedSource>,
    },

    /// The reconnection budget was exhausted.
    MaxReconnectAttemptsExceeded {
        /// Number of attempts made
        attempts: u32,
    },

    /// An operation needed a running indexer.
    NotRunning,
}

impl IndexerError {
    /// Create a new configuration error.
    ///
    /// # Example
    ///
    /// ```
    /// use bloxer::error::IndexerError;
    ///
    /// let err = IndexerError::config("wsUrl is required", None);
    /// assert!(matches!(err, IndexerError::ConfigError { .. }));
    /// ```
    #[must_use]
    pub fn config(message: impl Into<String>, source: Option<BoxedSource>) -> Self {
        Self::ConfigError {
            message: message.into(),
            source,
        }
    }

    /// Create a new connection error.
    #[must_use]
    pub fn connection(message: impl Into<String>, source: Option<BoxedSource>) -> Self {
        Self::ConnectionError {
            message: message.into(),
            source,
        }
    }

    /// Create a new request error.
    #[must_use]
    pub fn request(message: impl Into<String>, source: Option<BoxedSource>) -> Self {
        Self::RequestError {
            message: message.into(),
            source,
        }
    }

    /// Create a new scan error.
    ///
    /// # Example
    ///
    /// ```
    /// use bloxer::error::IndexerError;
    ///
    /// let err = IndexerError::scan("ledger 42 not validated", None);
    /// assert_eq!(err.to_string(), "Scan error: ledger 42 not validated");
    /// ```
    #[must_use]
    pub fn scan(message: impl Into<String>, source: Option<BoxedSource>) -> Self {
        Self::ScanError {
            message: message.into(),
            source,
        }
    }

    /// Create a new database error.
    #[must_use]
    pub fn database(message: impl Into<String>, source: Option<BoxedSource>) -> Self {
        Self::DatabaseError {
            message: message.into(),
            source,
        }
    }

    /// Create a new encoding error.
    #[must_use]
    pub fn encoding(message: impl Into<String>, source: Option<BoxedSource>) -> Self {
        Self::EncodingError {
            message: message.into(),
            source,
        }
    }

    /// Create a new state error.
    #[must_use]
    pub fn state(message: impl Into<String>, source: Option<BoxedSource>) -> Self {
        Self::StateError {
            message: message.into(),
            source,
        }
    }

    /// Create a reconnection-exhausted error.
    #[must_use]
    pub const fn max_reconnect_exceeded(attempts: u32) -> Self {
        Self::MaxReconnectAttemptsExceeded { attempts }
    }

    /// Returns `true` if the error is a configuration error.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(self, Self::ConfigError { .. })
    }

    /// Returns `true` if the error signals untrustworthy persisted state.
    #[must_use]
    pub const fn is_state(&self) -> bool {
        matches!(self, Self::StateError { .. })
    }
}

impl fmt::Display for IndexerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConfigError { message, .. } => write!(f, "Configuration error: {message}"),
            Self::ConnectionError { message, .. } => write!(f, "Connection error: {message}"),
            Self::RequestError { message, .. } => write!(f, "Request error: {message}"),
            Self::ScanError { message, .. } => write!(f, "Scan error: {message}"),
            Self::DatabaseError { message, .. } => write!(f, "Database error: {message}"),
            Self::EncodingError { message, .. } => write!(f, "Encoding error: {message}"),
            Self::StateError { message, .. } => write!(f, "State error: {message}"),
            Self::MaxReconnectAttemptsExceeded { attempts } => {
                write!(f, "Max reconnection attempts ({attempts}) exceeded")
            }
            Self::NotRunning => write!(f, "Indexer is not running"),
        }
    }
}

impl std::error::Error for IndexerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ConfigError { source, .. }
            | Self::ConnectionError { source, .. }
            | Self::RequestError { source, .. }
            | Self::ScanError { source, .. }
            | Self::DatabaseError { source, .. }
            | Self::EncodingError { source, .. }
            | Self::StateError { source, .. } => source
                .as_ref()
                .map(|e| e.as_ref() as &dyn std::error::Error),
            Self::MaxReconnectAttemptsExceeded { .. } | Self::NotRunning => None,
        }
    }
}

/// Convert from `eyre::Report` to `IndexerError`.
///
/// Scan operations are commonly written against `eyre`; a report that
/// escapes one is categorized as a scan error.
impl From<eyre::Report> for IndexerError {
    fn from(err: eyre::Report) -> Self {
        Self::ScanError {
            message: format!("{err:#}"),
            source: None,
        }
    }
}

impl From<serde_json::Error> for IndexerError {
    fn from(err: serde_json::Error) -> Self {
        Self::encoding(err.to_string(), Some(Box::new(err)))
    }
}
