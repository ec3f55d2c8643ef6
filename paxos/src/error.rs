//! Error contexts used with [`error_stack::Report`].
//!
//! Stale or duplicate protocol messages are not errors: they are dropped and
//! logged. Only storage and configuration failures surface here.

use core::fmt;

use crate::types::Value;

/// A storage backend failed to open, read, write or commit.
#[derive(Debug)]
pub struct StorageError;

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("storage operation failed")
    }
}

impl std::error::Error for StorageError {}

/// An acceptor could not complete a request. Its state is unchanged.
#[derive(Debug)]
pub struct AcceptorError;

impl fmt::Display for AcceptorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("acceptor operation failed")
    }
}

impl std::error::Error for AcceptorError {}

/// Invalid configuration or unavailable backend.
#[derive(Debug)]
pub struct ConfigError;

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("invalid configuration")
    }
}

impl std::error::Error for ConfigError {}

/// The proposer's pending queue is full. Carries the rejected value back.
#[derive(Debug, PartialEq, Eq)]
pub struct PendingFull(pub Value);

impl PendingFull {
    #[must_use]
    pub fn into_value(self) -> Value {
        self.0
    }
}

impl fmt::Display for PendingFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("pending value queue is full")
    }
}

impl std::error::Error for PendingFull {}
