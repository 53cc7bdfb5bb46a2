/*!
 * Error types for the tether binary
 */

use std::fmt;
use std::io;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, TetherError>;

/// Exit code constants for structured process exit
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_FATAL: i32 = 2;
pub const EXIT_UNREACHABLE: i32 = 3;

#[derive(Debug)]
pub enum TetherError {
    /// Configuration file missing, unreadable or invalid
    Config(String),

    /// Workspace file could not be read
    ConfigNotFound(PathBuf),

    /// I/O error
    Io(io::Error),

    /// Failure reported by a code location or the snapshot layer
    Location(tether_core::Error),

    /// Generic error with message
    Other(String),
}

impl TetherError {
    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            TetherError::Config(_) | TetherError::ConfigNotFound(_) => EXIT_FATAL,
            TetherError::Location(tether_core::Error::Connection(_)) => EXIT_UNREACHABLE,
            TetherError::Location(e) if e.is_fatal() || e.is_not_found() => EXIT_FATAL,
            _ => EXIT_FAILURE,
        }
    }

    /// Check if this error is fatal (should not retry)
    pub fn is_fatal(&self) -> bool {
        match self {
            TetherError::Config(_) => true,
            TetherError::ConfigNotFound(_) => true,
            TetherError::Location(e) => !e.is_retryable(),

            TetherError::Io(_) => false,
            TetherError::Other(_) => false,
        }
    }

    /// Hint printed under the error message, if there is a useful one
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            TetherError::ConfigNotFound(_) => Some("Pass --config or create tether.toml"),
            TetherError::Location(tether_core::Error::Connection(_)) => {
                Some("Check that the code server is running and reachable")
            }
            TetherError::Location(tether_core::Error::SnapshotDeserialization(_)) => {
                Some("Host and worker may be running different tether versions")
            }
            _ => None,
        }
    }
}

impl fmt::Display for TetherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TetherError::Config(msg) => {
                write!(f, "Configuration error: {}", msg)
            }
            TetherError::ConfigNotFound(path) => {
                write!(f, "Configuration file not found: {}", path.display())
            }
            TetherError::Io(err) => {
                write!(f, "I/O error: {}", err)
            }
            TetherError::Location(err) => {
                write!(f, "{}", err)
            }
            TetherError::Other(msg) => {
                write!(f, "{}", msg)
            }
        }
    }
}

impl std::error::Error for TetherError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TetherError::Io(err) => Some(err),
            TetherError::Location(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for TetherError {
    fn from(err: io::Error) -> Self {
        TetherError::Io(err)
    }
}

impl From<tether_core::Error> for TetherError {
    fn from(err: tether_core::Error) -> Self {
        TetherError::Location(err)
    }
}

impl From<serde_json::Error> for TetherError {
    fn from(err: serde_json::Error) -> Self {
        TetherError::Config(format!("JSON parse error: {}", err))
    }
}

impl From<toml::de::Error> for TetherError {
    fn from(err: toml::de::Error) -> Self {
        TetherError::Config(format!("TOML parse error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::{ConnectionErrorKind, EntityKind, Error};

    #[test]
    fn test_fatal_errors() {
        assert!(TetherError::Config("test".to_string()).is_fatal());
        assert!(TetherError::ConfigNotFound(PathBuf::from("tether.toml")).is_fatal());
        assert!(TetherError::Location(Error::plan("etl_job", "cycle")).is_fatal());
        assert!(TetherError::Location(Error::not_found(EntityKind::Job, "etl_job")).is_fatal());
    }

    #[test]
    fn test_non_fatal_errors() {
        assert!(!TetherError::Io(io::Error::other("test")).is_fatal());
        assert!(!TetherError::Other("test".to_string()).is_fatal());
        assert!(!TetherError::Location(Error::fetch("etl", "reset")).is_fatal());
        assert!(!TetherError::Location(Error::connection(
            "etl",
            ConnectionErrorKind::Unreachable,
            "refused"
        ))
        .is_fatal());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(TetherError::Config("bad".to_string()).exit_code(), EXIT_FATAL);
        assert_eq!(
            TetherError::Location(Error::connection(
                "etl",
                ConnectionErrorKind::Timeout,
                "slow"
            ))
            .exit_code(),
            EXIT_UNREACHABLE
        );
        assert_eq!(
            TetherError::Location(Error::not_found(EntityKind::Repository, "x")).exit_code(),
            EXIT_FATAL
        );
        assert_eq!(
            TetherError::Location(Error::fetch("etl", "reset")).exit_code(),
            EXIT_FAILURE
        );
        assert_eq!(TetherError::Other("x".to_string()).exit_code(), EXIT_FAILURE);
    }

    #[test]
    fn test_error_display() {
        let err = TetherError::ConfigNotFound(PathBuf::from("/etc/tether.toml"));
        assert_eq!(
            err.to_string(),
            "Configuration file not found: /etc/tether.toml"
        );

        let err = TetherError::Location(Error::not_found(EntityKind::Job, "etl_job"));
        assert_eq!(err.to_string(), Error::not_found(EntityKind::Job, "etl_job").to_string());
    }

    #[test]
    fn test_suggestions() {
        assert!(TetherError::ConfigNotFound(PathBuf::from("x")).suggestion().is_some());
        assert!(TetherError::Other("x".to_string()).suggestion().is_none());
    }
}
