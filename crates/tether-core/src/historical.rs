//! HistoricalJob: a job reconstructed from run history
//!
//! When a run starts, the host persists the job snapshot it planned against.
//! [`HistoricalJob`] rebuilds a [`RepresentedJob`] from that stored payload
//! without touching any code location, so a run stays queryable after its
//! definitions change or its location disappears.

use crate::error::{EntityKind, Error, Result};
use crate::external::ExternalJob;
use crate::job_index::JobIndex;
use crate::represented::RepresentedJob;
use crate::serdes::{deserialize_snapshot, serialize_snapshot, Snapshot};
use crate::snapshot::{JobSnapshot, PartitionSetSnap};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// What a run persists about the job it executes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HistoricalJobSnapshot {
    pub job_snapshot: JobSnapshot,

    #[serde(default)]
    pub parent_job_snapshot: Option<JobSnapshot>,

    #[serde(default)]
    pub partition_sets: Vec<PartitionSetSnap>,
}

impl Snapshot for HistoricalJobSnapshot {
    const KIND: &'static str = "historical_job";
}

impl HistoricalJobSnapshot {
    /// Capture a live job for storage alongside a run
    pub fn for_job(job: &ExternalJob) -> Self {
        let index = job.job_index();
        Self {
            job_snapshot: index.job_snapshot().as_ref().clone(),
            parent_job_snapshot: index.parent_job_snapshot().map(|p| p.as_ref().clone()),
            partition_sets: index.partition_sets().cloned().collect(),
        }
    }

    pub fn to_payload(&self) -> Result<String> {
        serialize_snapshot(self)
    }
}

/// Run-history storage, keyed by run id
pub trait RunSnapshotStore: Send + Sync {
    /// Stored payload for a run; `NotFound` when the run is unknown
    fn get_snapshot(&self, run_id: &str) -> Result<String>;

    fn put_snapshot(&self, run_id: &str, payload: String) -> Result<()>;
}

/// Store backed by a map, for embedding and tests
#[derive(Debug, Default)]
pub struct InMemoryRunSnapshotStore {
    snapshots: RwLock<HashMap<String, String>>,
}

impl InMemoryRunSnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RunSnapshotStore for InMemoryRunSnapshotStore {
    fn get_snapshot(&self, run_id: &str) -> Result<String> {
        let snapshots = self.snapshots.read().unwrap_or_else(|e| e.into_inner());
        snapshots
            .get(run_id)
            .cloned()
            .ok_or_else(|| Error::not_found(EntityKind::Run, run_id))
    }

    fn put_snapshot(&self, run_id: &str, payload: String) -> Result<()> {
        let mut snapshots = self.snapshots.write().unwrap_or_else(|e| e.into_inner());
        snapshots.insert(run_id.to_string(), payload);
        Ok(())
    }
}

/// A job as it was when a past run was planned
#[derive(Debug, Clone)]
pub struct HistoricalJob {
    run_id: String,
    index: Arc<JobIndex>,
}

impl HistoricalJob {
    /// Rebuild from a stored payload
    ///
    /// A corrupt payload fails with `SnapshotDeserialization`, never with
    /// `NotFound`.
    pub fn reconstruct(run_id: &str, stored_payload: &str) -> Result<Self> {
        let stored: HistoricalJobSnapshot = deserialize_snapshot(stored_payload)?;
        debug!(
            "Reconstructed job {} for run {}",
            stored.job_snapshot.name, run_id
        );
        Ok(Self::from_snapshot(run_id, stored))
    }

    /// Load from run storage, then rebuild
    pub fn from_store(store: &dyn RunSnapshotStore, run_id: &str) -> Result<Self> {
        let payload = store.get_snapshot(run_id)?;
        Self::reconstruct(run_id, &payload)
    }

    pub fn from_snapshot(run_id: &str, stored: HistoricalJobSnapshot) -> Self {
        let index = JobIndex::new(
            Arc::new(stored.job_snapshot),
            stored.parent_job_snapshot.map(Arc::new),
            stored.partition_sets,
        );
        Self {
            run_id: run_id.to_string(),
            index: Arc::new(index),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn identifying_job_snapshot_id(&self) -> &str {
        self.index
            .parent_job_snapshot_id()
            .unwrap_or_else(|| self.index.job_snapshot_id())
    }
}

impl RepresentedJob for HistoricalJob {
    fn name(&self) -> &str {
        self.index.name()
    }

    fn job_index(&self) -> &JobIndex {
        &self.index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeserializationError;
    use crate::external::ExternalRepository;
    use crate::origin::{CodeLocationOrigin, InProcessOrigin};
    use crate::testing::etl_repository;

    fn live_job() -> Arc<ExternalJob> {
        let repo = ExternalRepository::from_location(
            Arc::new(etl_repository("analytics")),
            CodeLocationOrigin::InProcess(InProcessOrigin::new("defs")),
        );
        repo.get_job("etl_job").unwrap()
    }

    #[test]
    fn test_historical_matches_live() {
        let live = live_job();
        let payload = HistoricalJobSnapshot::for_job(&live).to_payload().unwrap();
        let historical = HistoricalJob::reconstruct("run-1", &payload).unwrap();

        assert_eq!(historical.run_id(), "run-1");
        assert_eq!(historical.name(), live.name());
        assert_eq!(historical.get_graph_structure(), live.get_graph_structure());
        assert_eq!(historical.job_snapshot_id(), live.job_snapshot_id());
        assert_eq!(
            historical.get_op("transform").unwrap(),
            live.get_op("transform").unwrap()
        );
        assert_eq!(historical.get_resource_defs(), live.get_resource_defs());
        assert!(historical.get_partition_set("etl_job_partition_set").is_ok());
    }

    #[test]
    fn test_corrupt_payload_is_not_not_found() {
        let err = HistoricalJob::reconstruct("run-1", "{\"schema_version\": 1").unwrap_err();
        assert!(matches!(
            err,
            Error::SnapshotDeserialization(DeserializationError::Corrupt(_))
        ));
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_store_round_trip() {
        let store = InMemoryRunSnapshotStore::new();
        let payload = HistoricalJobSnapshot::for_job(&live_job()).to_payload().unwrap();
        store.put_snapshot("run-7", payload).unwrap();

        let job = HistoricalJob::from_store(&store, "run-7").unwrap();
        assert_eq!(job.name(), "etl_job");
    }

    #[test]
    fn test_unknown_run() {
        let store = InMemoryRunSnapshotStore::new();
        let err = HistoricalJob::from_store(&store, "missing-run").unwrap_err();
        assert_eq!(err, Error::not_found(EntityKind::Run, "missing-run"));
    }

    #[test]
    fn test_survives_redefinition() {
        let store = InMemoryRunSnapshotStore::new();
        let before = live_job();
        store
            .put_snapshot("run-1", HistoricalJobSnapshot::for_job(&before).to_payload().unwrap())
            .unwrap();

        // The location now serves a job with an extra op.
        let mut changed = etl_repository("analytics");
        changed.jobs[0].job_snapshot.ops.push(
            crate::testing::OpBuilder::new("audit")
                .input_from("loaded", "load")
                .build(),
        );
        let repo = ExternalRepository::from_location(
            Arc::new(changed),
            CodeLocationOrigin::InProcess(InProcessOrigin::new("defs")),
        );
        let after = repo.get_job("etl_job").unwrap();
        assert!(after.get_op("audit").is_ok());

        let historical = HistoricalJob::from_store(&store, "run-1").unwrap();
        assert!(historical.get_op("audit").unwrap_err().is_not_found());
        assert_eq!(historical.get_graph_structure(), before.get_graph_structure());
        assert_ne!(historical.job_snapshot_id(), after.job_snapshot_id());
    }
}
