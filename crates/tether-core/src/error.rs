//! Error taxonomy for the remote representation layer
//!
//! Every failure a caller can observe falls into exactly one variant of
//! [`Error`]. Transport failures carry enough detail for the caller to pick a
//! retry policy; nothing in this layer retries on its own.

use crate::snapshot::SerializableErrorInfo;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type for remote representation operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by origins, snapshots, wrappers, plans and code locations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Worker unreachable, handshake failed, or timed out while connecting
    #[error("{0}")]
    Connection(ConnectionError),

    /// Transport failure in the middle of a request
    #[error("Failed to fetch from code location {location}: {message}")]
    SnapshotFetch { location: String, message: String },

    /// Payload does not match a supported schema or is corrupt
    #[error("{0}")]
    SnapshotDeserialization(DeserializationError),

    /// A name is absent from an otherwise valid snapshot
    #[error("{kind} not found: {name}")]
    NotFound { kind: EntityKind, name: String },

    /// Worker-side failure while resolving definitions
    #[error("Error in user code: {}", .0.to_string_with_stack())]
    UserCode(SerializableErrorInfo),

    /// Run configuration does not satisfy the job's declared schema
    #[error("Invalid run config for job {job_name}: {}", format_violations(.violations))]
    InvalidConfig {
        job_name: String,
        violations: Vec<ConfigViolation>,
    },

    /// Definition bug discovered while building an execution plan
    #[error("Could not build execution plan for job {job_name}: {message}")]
    PlanConstruction { job_name: String, message: String },
}

impl Error {
    /// Create a not-found error
    pub fn not_found<S: Into<String>>(kind: EntityKind, name: S) -> Self {
        Error::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Create a snapshot fetch error
    pub fn fetch<L: Into<String>, M: Into<String>>(location: L, message: M) -> Self {
        Error::SnapshotFetch {
            location: location.into(),
            message: message.into(),
        }
    }

    /// Create a connection error
    pub fn connection<L: Into<String>, M: Into<String>>(
        location: L,
        kind: ConnectionErrorKind,
        message: M,
    ) -> Self {
        Error::Connection(ConnectionError {
            location: location.into(),
            kind,
            message: message.into(),
        })
    }

    /// Create a timeout error for the named location
    pub fn timeout<L: Into<String>>(location: L, operation: &str, after: std::time::Duration) -> Self {
        Error::connection(
            location,
            ConnectionErrorKind::Timeout,
            format!("{} timed out after {:?}", operation, after),
        )
    }

    /// Create a plan construction error
    pub fn plan<J: Into<String>, M: Into<String>>(job_name: J, message: M) -> Self {
        Error::PlanConstruction {
            job_name: job_name.into(),
            message: message.into(),
        }
    }

    /// Create a corrupt payload error
    pub fn corrupt<M: Into<String>>(message: M) -> Self {
        Error::SnapshotDeserialization(DeserializationError::Corrupt(message.into()))
    }

    /// Check if the caller may retry the same request against the same worker
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Connection(err) => err.kind != ConnectionErrorKind::VersionMismatch,
            Error::SnapshotFetch { .. } => true,

            Error::SnapshotDeserialization(_)
            | Error::NotFound { .. }
            | Error::UserCode(_)
            | Error::InvalidConfig { .. }
            | Error::PlanConstruction { .. } => false,
        }
    }

    /// Check if this error was produced by a caller-supplied timeout expiring
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Timeout,
                ..
            })
        )
    }

    /// Check if this error reflects a definition or config bug
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::InvalidConfig { .. } | Error::PlanConstruction { .. }
        )
    }

    /// Check if this error means the requested name is absent
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}

/// Details of a failed connection attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionError {
    /// Name of the code location
    pub location: String,

    /// Failure category
    pub kind: ConnectionErrorKind,

    /// Human readable detail
    pub message: String,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Could not reach code location {} ({}): {}",
            self.location,
            self.kind.as_str(),
            self.message
        )
    }
}

/// Why a connection could not be established or kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionErrorKind {
    /// Address refused or process not found
    Unreachable,
    /// A caller-supplied timeout expired
    Timeout,
    /// The worker answered but rejected or garbled the handshake
    Handshake,
    /// Host and worker speak incompatible protocol versions
    VersionMismatch,
    /// A managed worker process exited
    ProcessExited,
}

impl ConnectionErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionErrorKind::Unreachable => "unreachable",
            ConnectionErrorKind::Timeout => "timeout",
            ConnectionErrorKind::Handshake => "handshake",
            ConnectionErrorKind::VersionMismatch => "version mismatch",
            ConnectionErrorKind::ProcessExited => "process exited",
        }
    }
}

/// Why a payload could not be turned back into a snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeserializationError {
    /// Payload was written with a schema version outside the readable range
    IncompatibleVersion {
        found: u32,
        min_supported: u32,
        max_supported: u32,
    },

    /// Payload holds a different kind of snapshot than requested
    KindMismatch { expected: String, found: String },

    /// Malformed JSON or fields that do not match the schema
    Corrupt(String),
}

impl fmt::Display for DeserializationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeserializationError::IncompatibleVersion {
                found,
                min_supported,
                max_supported,
            } => write!(
                f,
                "Snapshot schema version {} is not supported (supported: {}..={})",
                found, min_supported, max_supported
            ),
            DeserializationError::KindMismatch { expected, found } => write!(
                f,
                "Snapshot kind mismatch: expected {}, found {}",
                expected, found
            ),
            DeserializationError::Corrupt(msg) => write!(f, "Corrupt snapshot payload: {}", msg),
        }
    }
}

/// The kind of entity a lookup was looking for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    CodeLocation,
    Repository,
    Job,
    Op,
    Asset,
    Resource,
    Preset,
    Schedule,
    Sensor,
    PartitionSet,
    Partition,
    Step,
    Run,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::CodeLocation => "Code location",
            EntityKind::Repository => "Repository",
            EntityKind::Job => "Job",
            EntityKind::Op => "Op",
            EntityKind::Asset => "Asset",
            EntityKind::Resource => "Resource",
            EntityKind::Preset => "Preset",
            EntityKind::Schedule => "Schedule",
            EntityKind::Sensor => "Sensor",
            EntityKind::PartitionSet => "Partition set",
            EntityKind::Partition => "Partition",
            EntityKind::Step => "Step",
            EntityKind::Run => "Run",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single way a run config fails its schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigViolation {
    /// Dotted path to the offending value (`ops.extract.config`)
    pub path: String,

    /// What is wrong at that path
    pub message: String,
}

impl ConfigViolation {
    pub fn new<P: Into<String>, M: Into<String>>(path: P, message: M) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "<root>: {}", self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

/// The definition errors of [`Error`], in a form that crosses process
/// boundaries
///
/// A worker reports these in its reply so the host raises the same variant,
/// with the same entity kind and violations, that a local lookup would.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum DefinitionError {
    NotFound {
        kind: EntityKind,
        name: String,
    },
    InvalidConfig {
        job_name: String,
        violations: Vec<ConfigViolation>,
    },
    PlanConstruction {
        job_name: String,
        message: String,
    },
}

impl DefinitionError {
    /// The transferable form of `err`, if it is a definition error
    pub fn from_error(err: &Error) -> Option<Self> {
        match err {
            Error::NotFound { kind, name } => Some(DefinitionError::NotFound {
                kind: *kind,
                name: name.clone(),
            }),
            Error::InvalidConfig {
                job_name,
                violations,
            } => Some(DefinitionError::InvalidConfig {
                job_name: job_name.clone(),
                violations: violations.clone(),
            }),
            Error::PlanConstruction { job_name, message } => {
                Some(DefinitionError::PlanConstruction {
                    job_name: job_name.clone(),
                    message: message.clone(),
                })
            }
            _ => None,
        }
    }
}

impl From<DefinitionError> for Error {
    fn from(err: DefinitionError) -> Self {
        match err {
            DefinitionError::NotFound { kind, name } => Error::NotFound { kind, name },
            DefinitionError::InvalidConfig {
                job_name,
                violations,
            } => Error::InvalidConfig {
                job_name,
                violations,
            },
            DefinitionError::PlanConstruction { job_name, message } => {
                Error::PlanConstruction { job_name, message }
            }
        }
    }
}

fn format_violations(violations: &[ConfigViolation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_retry_classification() {
        let err = Error::connection("loc", ConnectionErrorKind::Unreachable, "refused");
        assert!(err.is_retryable());
        assert!(!err.is_timeout());

        let err = Error::connection("loc", ConnectionErrorKind::VersionMismatch, "v2 vs v1");
        assert!(!err.is_retryable());

        let err = Error::fetch("loc", "stream reset");
        assert!(err.is_retryable());

        let err = Error::SnapshotDeserialization(DeserializationError::IncompatibleVersion {
            found: 9,
            min_supported: 1,
            max_supported: 1,
        });
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_timeout_is_distinguishable() {
        let err = Error::timeout("loc", "GetRepositories", Duration::from_millis(50));
        assert!(err.is_timeout());
        assert!(err.is_retryable());
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn test_not_found_message() {
        let err = Error::not_found(EntityKind::Job, "etl_job");
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "Job not found: etl_job");
    }

    #[test]
    fn test_user_code_error_keeps_stack() {
        let info = SerializableErrorInfo {
            message: "boom".to_string(),
            cls_name: Some("ValueError".to_string()),
            stack: vec!["  at build_graph\n".to_string()],
            cause: None,
        };
        let err = Error::UserCode(info);
        let msg = err.to_string();
        assert!(msg.contains("boom"));
        assert!(msg.contains("build_graph"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_invalid_config_lists_violations() {
        let err = Error::InvalidConfig {
            job_name: "etl_job".to_string(),
            violations: vec![
                ConfigViolation::new("ops.extract.config", "missing required field"),
                ConfigViolation::new("", "expected object"),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("ops.extract.config: missing required field"));
        assert!(msg.contains("<root>: expected object"));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_definition_errors_survive_transfer() {
        let errors = vec![
            Error::not_found(EntityKind::PartitionSet, "weekly"),
            Error::InvalidConfig {
                job_name: "etl_job".to_string(),
                violations: vec![
                    ConfigViolation::new("ops.extract.config.limit", "expected int"),
                    ConfigViolation::new("resources", "unexpected field"),
                ],
            },
            Error::plan("etl_job", "op load reads missing output"),
        ];
        for err in errors {
            let transferable = DefinitionError::from_error(&err).unwrap();
            let json = serde_json::to_string(&transferable).unwrap();
            let back: DefinitionError = serde_json::from_str(&json).unwrap();
            assert_eq!(Error::from(back), err);
        }

        assert!(DefinitionError::from_error(&Error::fetch("loc", "reset")).is_none());
        assert!(DefinitionError::from_error(&Error::UserCode(SerializableErrorInfo::new("x"))).is_none());
    }
}
