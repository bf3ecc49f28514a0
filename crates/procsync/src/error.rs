//! Error types for procsync
//!
//! One variant per failure class the engine distinguishes:
//! configuration, connecting, querying, row decoding, JSON handling,
//! and cooperative cancellation.

use thiserror::Error;

/// Result type for procsync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for procsync
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or incomplete configuration
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Opening a database connection failed
    #[error("connect error: {message}")]
    Connect {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A source call, target call, or sync-table statement failed
    #[error("query error: {message}")]
    Query {
        message: String,
        sql: Option<String>,
    },

    /// A fetched row could not be decoded
    #[error("scan error: {message}")]
    Scan { message: String },

    /// JSON marshalling or JSONPath evaluation failed
    #[error("json error: {message}")]
    Json { message: String },

    /// The run was cancelled by shutdown
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a connect error
    pub fn connect(message: impl Into<String>) -> Self {
        Self::Connect {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connect error with source
    pub fn connect_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connect {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a query error
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: None,
        }
    }

    /// Create a query error carrying the failing statement
    pub fn query_with_sql(message: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: Some(sql.into()),
        }
    }

    /// Create a scan error
    pub fn scan(message: impl Into<String>) -> Self {
        Self::Scan {
            message: message.into(),
        }
    }

    /// Create a JSON error
    pub fn json(message: impl Into<String>) -> Self {
        Self::Json {
            message: message.into(),
        }
    }

    /// Whether this error was caused by shutdown cancellation
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Json {
            message: e.to_string(),
        }
    }
}
