//! Snapshot replies on the wire
//!
//! Both ends of the CodeServer service agree on one envelope: a
//! [`SnapshotReply`] carrying a serialized snapshot, the serialized user code
//! error raised while producing it, or the definition error that made the
//! request unanswerable.

use tether_core::serdes::{
    check_schema_version, deserialize_snapshot, serialize_snapshot, Snapshot,
    SNAPSHOT_SCHEMA_VERSION,
};
use tether_core::snapshot::SerializableErrorInfo;
use tether_core::{DefinitionError, Error, Result};
use tether_proto::SnapshotReply;

/// Wrap a snapshot for sending
pub fn snapshot_reply<T: Snapshot>(value: &T) -> Result<SnapshotReply> {
    Ok(SnapshotReply {
        schema_version: SNAPSHOT_SCHEMA_VERSION,
        serialized_payload: serialize_snapshot(value)?,
        ..SnapshotReply::default()
    })
}

/// Wrap a user code failure for sending
pub fn error_reply(info: &SerializableErrorInfo) -> Result<SnapshotReply> {
    Ok(SnapshotReply {
        schema_version: SNAPSHOT_SCHEMA_VERSION,
        serialized_error: serialize_snapshot(info)?,
        ..SnapshotReply::default()
    })
}

/// Wrap an unknown name, invalid run config or broken graph for sending
pub fn definition_error_reply(err: &DefinitionError) -> Result<SnapshotReply> {
    Ok(SnapshotReply {
        schema_version: SNAPSHOT_SCHEMA_VERSION,
        serialized_definition_error: serialize_snapshot(err)?,
        ..SnapshotReply::default()
    })
}

/// Unwrap a received reply
///
/// The schema version is checked before anything else is read. A definition
/// error comes back as the [`Error`] variant the worker raised. A user code
/// error becomes [`Error::UserCode`]; if it cannot be decoded its raw text is
/// kept as the message.
pub fn decode_reply<T: Snapshot>(reply: SnapshotReply) -> Result<T> {
    check_schema_version(reply.schema_version)?;

    if !reply.serialized_definition_error.is_empty() {
        let err: DefinitionError = deserialize_snapshot(&reply.serialized_definition_error)?;
        return Err(err.into());
    }

    if !reply.serialized_error.is_empty() {
        let info = deserialize_snapshot::<SerializableErrorInfo>(&reply.serialized_error)
            .unwrap_or_else(|_| SerializableErrorInfo::new(reply.serialized_error.clone()));
        return Err(Error::UserCode(info));
    }

    deserialize_snapshot(&reply.serialized_payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::serdes::RepositorySnapshots;
    use tether_core::testing::etl_repository;
    use tether_core::{ConfigViolation, DeserializationError, EntityKind};

    #[test]
    fn test_snapshot_reply_decodes() {
        let mut repos = RepositorySnapshots::new();
        repos.insert("analytics".to_string(), etl_repository("analytics"));

        let decoded: RepositorySnapshots = decode_reply(snapshot_reply(&repos).unwrap()).unwrap();
        assert_eq!(decoded, repos);
    }

    #[test]
    fn test_error_reply_is_user_code() {
        let mut info = SerializableErrorInfo::new("division by zero");
        info.cls_name = Some("ZeroDivisionError".to_string());
        info.stack = vec!["  File \"defs.py\", line 3, in load".to_string()];

        let err = decode_reply::<RepositorySnapshots>(error_reply(&info).unwrap()).unwrap_err();
        assert_eq!(err, Error::UserCode(info));
        assert!(err.to_string().contains("defs.py"));
    }

    #[test]
    fn test_definition_error_keeps_variant() {
        let raised = Error::InvalidConfig {
            job_name: "etl_job".to_string(),
            violations: vec![
                ConfigViolation::new("ops.extract.config.limit", "expected int"),
                ConfigViolation::new("ops.load", "unexpected field"),
            ],
        };
        let reply =
            definition_error_reply(&DefinitionError::from_error(&raised).unwrap()).unwrap();
        assert_eq!(decode_reply::<RepositorySnapshots>(reply).unwrap_err(), raised);

        let raised = Error::not_found(EntityKind::PartitionSet, "weekly");
        let reply =
            definition_error_reply(&DefinitionError::from_error(&raised).unwrap()).unwrap();
        assert_eq!(decode_reply::<Vec<String>>(reply).unwrap_err(), raised);
    }

    #[test]
    fn test_undecodable_error_keeps_text() {
        let reply = SnapshotReply {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            serialized_error: "Traceback: worker crashed".to_string(),
            ..SnapshotReply::default()
        };
        match decode_reply::<RepositorySnapshots>(reply).unwrap_err() {
            Error::UserCode(info) => assert_eq!(info.message, "Traceback: worker crashed"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_newer_reply_version_rejected_before_payload() {
        let reply = SnapshotReply {
            schema_version: SNAPSHOT_SCHEMA_VERSION + 1,
            serialized_payload: "not even json".to_string(),
            ..SnapshotReply::default()
        };
        let err = decode_reply::<RepositorySnapshots>(reply).unwrap_err();
        assert!(matches!(
            err,
            Error::SnapshotDeserialization(DeserializationError::IncompatibleVersion { found, .. })
                if found == SNAPSHOT_SCHEMA_VERSION + 1
        ));
        assert!(!err.is_retryable());
    }
}
