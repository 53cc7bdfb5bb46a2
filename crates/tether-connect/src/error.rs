//! Error types for the tether-connect crate
//!
//! Transport-level failures are collected in [`ConnectError`] and turned into
//! the shared [`tether_core::Error`] taxonomy once the location they happened
//! at is known.

use tether_core::{ConnectionErrorKind, Error};
use thiserror::Error;
use tonic::Code;

#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("gRPC transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("gRPC status error: {0}")]
    Status(#[from] tonic::Status),

    #[error("Invalid endpoint {uri}: {reason}")]
    InvalidEndpoint { uri: String, reason: String },

    #[error("Invalid request metadata value: {0}")]
    InvalidMetadata(#[from] tonic::metadata::errors::InvalidMetadataValue),

    #[error("Invalid request metadata key: {0}")]
    InvalidMetadataKey(#[from] tonic::metadata::errors::InvalidMetadataKey),

    #[error("Failed to spawn worker {executable}: {source}")]
    Spawn {
        executable: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConnectError {
    /// Classify this failure as seen from the named location
    pub fn at(self, location: &str) -> Error {
        match self {
            ConnectError::Transport(e) => {
                Error::connection(location, ConnectionErrorKind::Unreachable, e.to_string())
            }
            ConnectError::Status(status) => from_status(location, status),
            ConnectError::InvalidEndpoint { .. }
            | ConnectError::InvalidMetadata(_)
            | ConnectError::InvalidMetadataKey(_) => {
                Error::connection(location, ConnectionErrorKind::Handshake, self.to_string())
            }
            ConnectError::Spawn { .. } | ConnectError::Io(_) => {
                Error::connection(location, ConnectionErrorKind::Unreachable, self.to_string())
            }
        }
    }
}

/// Map a gRPC status returned mid-request
///
/// Unavailable means the worker went away; everything else the transport
/// reports is a failed fetch.
pub fn from_status(location: &str, status: tonic::Status) -> Error {
    match status.code() {
        Code::Unavailable => Error::connection(
            location,
            ConnectionErrorKind::Unreachable,
            status.message().to_string(),
        ),
        Code::DeadlineExceeded => Error::connection(
            location,
            ConnectionErrorKind::Timeout,
            status.message().to_string(),
        ),
        code => Error::fetch(location, format!("{:?}: {}", code, status.message())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let err = from_status("etl", tonic::Status::unavailable("connection refused"));
        assert!(matches!(
            err,
            Error::Connection(ref c) if c.kind == ConnectionErrorKind::Unreachable
        ));
        assert!(err.is_retryable());

        let err = from_status("etl", tonic::Status::deadline_exceeded("slow"));
        assert!(err.is_timeout());

        let err = from_status("etl", tonic::Status::internal("boom"));
        assert_eq!(err, Error::fetch("etl", "Internal: boom"));
    }

    #[test]
    fn test_spawn_failure_is_connection_error() {
        let err = ConnectError::Spawn {
            executable: "/nonexistent/worker".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        }
        .at("etl");
        match err {
            Error::Connection(c) => {
                assert_eq!(c.location, "etl");
                assert_eq!(c.kind, ConnectionErrorKind::Unreachable);
                assert!(c.message.contains("/nonexistent/worker"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
