//! Error types for the physical replication client
//!
//! This module provides the error kinds shared by the base-backup and WAL
//! streaming engines: configuration problems found before any connection is
//! made, protocol violations, filesystem failures, and server-reported
//! errors.

use thiserror::Error;

/// Error kinds for base-backup and WAL streaming operations
#[derive(Error, Debug)]
pub enum StreamError {
    /// Missing or conflicting options, bad target directories, unsupported
    /// compression configuration. Detected before any connection is made.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed frames, unexpected message types, offset mismatches,
    /// unknown tar entries, truncated archives.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Server-reported failure in a result or COPY stream.
    #[error("Server error: {0}")]
    Server(String),

    /// Connection establishment failures other than bad credentials.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Rejected credentials. Kept apart from other connection errors so
    /// callers never re-prompt or re-drive a session that can only fail
    /// the same way.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Operation was cancelled by the caller.
    #[error("Operation was cancelled: {0}")]
    Cancelled(String),

    /// Read deadline elapsed twice without any traffic from the server.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// File and directory I/O failures.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// String conversion errors (from CString operations)
    #[error("String conversion error: {0}")]
    StringConversion(#[from] std::ffi::NulError),
}

impl StreamError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        StreamError::Config(msg.into())
    }

    /// Create a new protocol error
    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        StreamError::Protocol(msg.into())
    }

    /// Create a new server error
    pub fn server<S: Into<String>>(msg: S) -> Self {
        StreamError::Server(msg.into())
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(msg: S) -> Self {
        StreamError::Connection(msg.into())
    }

    /// Create a new authentication error
    pub fn authentication<S: Into<String>>(msg: S) -> Self {
        StreamError::Authentication(msg.into())
    }

    /// Create a new cancellation error
    pub fn cancelled<S: Into<String>>(msg: S) -> Self {
        StreamError::Cancelled(msg.into())
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        StreamError::Timeout(msg.into())
    }

    /// Check if the error is a configuration error (surfaced before any
    /// connection is made)
    pub fn is_config(&self) -> bool {
        matches!(self, StreamError::Config(_))
    }

    /// Check if the error is due to cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StreamError::Cancelled(_))
    }

    /// Check if the error is an authentication failure (retrying the same
    /// credentials cannot succeed)
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, StreamError::Authentication(_))
    }

    /// Check if the error was reported by the server rather than produced
    /// locally
    pub fn is_server(&self) -> bool {
        matches!(self, StreamError::Server(_))
    }
}

/// Result type for replication client operations
pub type Result<T> = std::result::Result<T, StreamError>;
