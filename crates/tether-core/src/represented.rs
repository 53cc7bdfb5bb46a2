//! RepresentedJob: the read contract shared by live and historical jobs
//!
//! Execution plan construction depends only on this trait, so it cannot tell
//! whether a job came from a live code location or from run history.

use crate::error::Result;
use crate::job_index::JobIndex;
use crate::snapshot::{ConfigFieldSnap, OpSnap, PartitionSetSnap, ResourceSnap};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Op names plus `(upstream, downstream)` dependency edges
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GraphStructure {
    pub ops: BTreeSet<String>,
    pub edges: BTreeSet<(String, String)>,
}

/// Read-only view of a job's structure
///
/// Implementors supply the job name and its index; every query is answered
/// from the index.
pub trait RepresentedJob: Send + Sync {
    fn name(&self) -> &str;

    fn job_index(&self) -> &JobIndex;

    fn get_graph_structure(&self) -> GraphStructure {
        self.job_index().graph_structure()
    }

    fn get_op(&self, name: &str) -> Result<&OpSnap> {
        self.job_index().get_op(name)
    }

    fn get_resource_defs(&self) -> &[ResourceSnap] {
        self.job_index().get_resource_defs()
    }

    fn get_partition_set(&self, name: &str) -> Result<&PartitionSetSnap> {
        self.job_index().get_partition_set(name)
    }

    fn config_schema(&self) -> &ConfigFieldSnap {
        self.job_index().config_schema()
    }

    fn job_snapshot_id(&self) -> &str {
        self.job_index().job_snapshot_id()
    }

    fn parent_job_snapshot_id(&self) -> Option<&str> {
        self.job_index().parent_job_snapshot_id()
    }

    fn op_selection(&self) -> Option<&[String]> {
        self.job_index().job_snapshot().op_selection.as_deref()
    }

    fn op_names_in_topological_order(&self) -> Vec<String> {
        self.job_index().op_names_in_topological_order()
    }
}
