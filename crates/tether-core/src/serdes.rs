//! Versioned serialization of snapshots
//!
//! Every payload that crosses a process boundary or lands in run storage is
//! wrapped in a [`SnapshotEnvelope`]:
//!
//! ```json
//! { "schema_version": 1, "kind": "repository_snapshots", "payload": { ... } }
//! ```
//!
//! The version is checked before the payload is touched, so a payload from a
//! newer worker fails with an incompatible-version error instead of parsing
//! partially.

use crate::error::{DefinitionError, DeserializationError, Error, Result};
use crate::origin::hash_key;
use crate::snapshot::{
    ExecutionPlanSnapshot, ExternalJobSubsetResult, ExternalPartitionConfigData,
    ExternalPartitionTagsData, ExternalRepositoryData, JobSnapshot, SerializableErrorInfo,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Schema version written by this build
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

/// Oldest schema version this build can still read
pub const MIN_SUPPORTED_SCHEMA_VERSION: u32 = 1;

/// A snapshot type that can be enveloped
pub trait Snapshot: Serialize + DeserializeOwned {
    /// Stable tag written into the envelope
    const KIND: &'static str;
}

/// Repository snapshots keyed by repository name, as returned by a worker
pub type RepositorySnapshots = BTreeMap<String, ExternalRepositoryData>;

impl Snapshot for RepositorySnapshots {
    const KIND: &'static str = "repository_snapshots";
}

impl Snapshot for ExternalRepositoryData {
    const KIND: &'static str = "repository";
}

impl Snapshot for JobSnapshot {
    const KIND: &'static str = "job";
}

impl Snapshot for ExecutionPlanSnapshot {
    const KIND: &'static str = "execution_plan";
}

impl Snapshot for SerializableErrorInfo {
    const KIND: &'static str = "error";
}

impl Snapshot for Vec<String> {
    const KIND: &'static str = "names";
}

impl Snapshot for ExternalJobSubsetResult {
    const KIND: &'static str = "job_subset";
}

impl Snapshot for ExternalPartitionConfigData {
    const KIND: &'static str = "partition_config";
}

impl Snapshot for ExternalPartitionTagsData {
    const KIND: &'static str = "partition_tags";
}

impl Snapshot for DefinitionError {
    const KIND: &'static str = "definition_error";
}

#[derive(Debug, Serialize)]
struct SnapshotEnvelope<'a, T> {
    schema_version: u32,
    kind: &'a str,
    payload: &'a T,
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    schema_version: Option<u32>,
    kind: Option<String>,
    payload: Option<serde_json::Value>,
}

/// Serialize a snapshot into an envelope at the current schema version
pub fn serialize_snapshot<T: Snapshot>(value: &T) -> Result<String> {
    let envelope = SnapshotEnvelope {
        schema_version: SNAPSHOT_SCHEMA_VERSION,
        kind: T::KIND,
        payload: value,
    };
    serde_json::to_string(&envelope).map_err(|e| Error::corrupt(e.to_string()))
}

/// Deserialize an enveloped snapshot, checking version and kind first
pub fn deserialize_snapshot<T: Snapshot>(payload: &str) -> Result<T> {
    let raw: RawEnvelope = serde_json::from_str(payload)
        .map_err(|e| Error::corrupt(format!("invalid envelope: {}", e)))?;

    let version = raw
        .schema_version
        .ok_or_else(|| Error::corrupt("envelope has no schema_version"))?;
    check_schema_version(version)?;

    let kind = raw
        .kind
        .ok_or_else(|| Error::corrupt("envelope has no kind"))?;
    if kind != T::KIND {
        return Err(Error::SnapshotDeserialization(
            DeserializationError::KindMismatch {
                expected: T::KIND.to_string(),
                found: kind,
            },
        ));
    }

    let body = raw
        .payload
        .ok_or_else(|| Error::corrupt("envelope has no payload"))?;
    serde_json::from_value(body).map_err(|e| Error::corrupt(format!("{} payload: {}", T::KIND, e)))
}

/// Check a schema version reported by a worker or found in storage
pub fn check_schema_version(version: u32) -> Result<()> {
    if !(MIN_SUPPORTED_SCHEMA_VERSION..=SNAPSHOT_SCHEMA_VERSION).contains(&version) {
        return Err(Error::SnapshotDeserialization(
            DeserializationError::IncompatibleVersion {
                found: version,
                min_supported: MIN_SUPPORTED_SCHEMA_VERSION,
                max_supported: SNAPSHOT_SCHEMA_VERSION,
            },
        ));
    }
    Ok(())
}

/// Content hash identifying a job snapshot
///
/// Computed over the canonical JSON form, so equal snapshots always share an
/// id regardless of where they were produced.
pub fn snapshot_id(job_snapshot: &JobSnapshot) -> String {
    // All maps in the snapshot are BTreeMaps, so field order is canonical.
    let canonical = serde_json::to_string(job_snapshot).unwrap_or_default();
    hash_key(&canonical)
}
