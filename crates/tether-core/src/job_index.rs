//! JobIndex: derived lookup structures over one job snapshot
//!
//! Built once when a job is wrapped and never mutated afterwards. Lookups are
//! map based, and every ordered answer (asset ops, topological order) is
//! sorted by name so it does not depend on how the snapshot was traversed.

use crate::error::{EntityKind, Error, Result};
use crate::represented::GraphStructure;
use crate::serdes::snapshot_id;
use crate::snapshot::{AssetKey, ConfigFieldSnap, JobSnapshot, OpSnap, PartitionSetSnap, ResourceSnap};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct JobIndex {
    job_snapshot: Arc<JobSnapshot>,
    parent_job_snapshot: Option<Arc<JobSnapshot>>,
    job_snapshot_id: String,
    parent_job_snapshot_id: Option<String>,

    /// Op name -> position in `job_snapshot.ops`
    ops_by_name: HashMap<String, usize>,

    /// Asset key -> sorted names of the ops producing it
    ops_by_asset: BTreeMap<AssetKey, Vec<String>>,

    resources_by_key: HashMap<String, usize>,

    partition_sets: BTreeMap<String, PartitionSetSnap>,

    upstream: BTreeMap<String, BTreeSet<String>>,
    downstream: BTreeMap<String, BTreeSet<String>>,
}

impl JobIndex {
    /// Index a job snapshot and the partition sets that target it
    pub fn new(
        job_snapshot: Arc<JobSnapshot>,
        parent_job_snapshot: Option<Arc<JobSnapshot>>,
        partition_sets: Vec<PartitionSetSnap>,
    ) -> Self {
        let job_snapshot_id = snapshot_id(&job_snapshot);
        let parent_job_snapshot_id = parent_job_snapshot
            .as_deref()
            .map(snapshot_id)
            .or_else(|| job_snapshot.parent_snapshot_id.clone());

        let mut ops_by_name = HashMap::with_capacity(job_snapshot.ops.len());
        let mut ops_by_asset: BTreeMap<AssetKey, Vec<String>> = BTreeMap::new();
        let mut upstream: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut downstream: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

        for (pos, op) in job_snapshot.ops.iter().enumerate() {
            ops_by_name.insert(op.name.clone(), pos);
            upstream.entry(op.name.clone()).or_default();
            downstream.entry(op.name.clone()).or_default();
            for key in &op.asset_keys {
                ops_by_asset.entry(key.clone()).or_default().push(op.name.clone());
            }
        }

        for op in &job_snapshot.ops {
            for up in op.upstream_op_names() {
                if !ops_by_name.contains_key(up) {
                    continue;
                }
                upstream.entry(op.name.clone()).or_default().insert(up.to_string());
                downstream.entry(up.to_string()).or_default().insert(op.name.clone());
            }
        }

        for names in ops_by_asset.values_mut() {
            names.sort();
            names.dedup();
        }

        let resources_by_key = job_snapshot
            .resources
            .iter()
            .enumerate()
            .map(|(pos, r)| (r.key.clone(), pos))
            .collect();

        let partition_sets = partition_sets
            .into_iter()
            .map(|p| (p.name.clone(), p))
            .collect();

        Self {
            job_snapshot,
            parent_job_snapshot,
            job_snapshot_id,
            parent_job_snapshot_id,
            ops_by_name,
            ops_by_asset,
            resources_by_key,
            partition_sets,
            upstream,
            downstream,
        }
    }

    pub fn name(&self) -> &str {
        &self.job_snapshot.name
    }

    pub fn job_snapshot(&self) -> &Arc<JobSnapshot> {
        &self.job_snapshot
    }

    pub fn parent_job_snapshot(&self) -> Option<&Arc<JobSnapshot>> {
        self.parent_job_snapshot.as_ref()
    }

    pub fn job_snapshot_id(&self) -> &str {
        &self.job_snapshot_id
    }

    pub fn parent_job_snapshot_id(&self) -> Option<&str> {
        self.parent_job_snapshot_id.as_deref()
    }

    pub fn get_op(&self, name: &str) -> Result<&OpSnap> {
        self.ops_by_name
            .get(name)
            .and_then(|&pos| self.job_snapshot.ops.get(pos))
            .ok_or_else(|| Error::not_found(EntityKind::Op, name))
    }

    pub fn has_op(&self, name: &str) -> bool {
        self.ops_by_name.contains_key(name)
    }

    pub fn ops(&self) -> &[OpSnap] {
        &self.job_snapshot.ops
    }

    pub fn ops_for_asset(&self, key: &AssetKey) -> Result<&[String]> {
        self.ops_by_asset
            .get(key)
            .map(Vec::as_slice)
            .ok_or_else(|| Error::not_found(EntityKind::Asset, key.to_user_string()))
    }

    pub fn asset_keys(&self) -> impl Iterator<Item = &AssetKey> {
        self.ops_by_asset.keys()
    }

    pub fn get_resource(&self, key: &str) -> Result<&ResourceSnap> {
        self.resources_by_key
            .get(key)
            .and_then(|&pos| self.job_snapshot.resources.get(pos))
            .ok_or_else(|| Error::not_found(EntityKind::Resource, key))
    }

    pub fn get_resource_defs(&self) -> &[ResourceSnap] {
        &self.job_snapshot.resources
    }

    pub fn get_partition_set(&self, name: &str) -> Result<&PartitionSetSnap> {
        self.partition_sets
            .get(name)
            .ok_or_else(|| Error::not_found(EntityKind::PartitionSet, name))
    }

    pub fn partition_sets(&self) -> impl Iterator<Item = &PartitionSetSnap> {
        self.partition_sets.values()
    }

    pub fn config_schema(&self) -> &ConfigFieldSnap {
        &self.job_snapshot.run_config_schema
    }

    /// Names of the ops feeding `name`, sorted
    pub fn upstream_ops(&self, name: &str) -> Result<&BTreeSet<String>> {
        self.upstream
            .get(name)
            .ok_or_else(|| Error::not_found(EntityKind::Op, name))
    }

    /// Names of the ops reading from `name`, sorted
    pub fn downstream_ops(&self, name: &str) -> Result<&BTreeSet<String>> {
        self.downstream
            .get(name)
            .ok_or_else(|| Error::not_found(EntityKind::Op, name))
    }

    /// Kahn's algorithm, ready ops taken in name order
    ///
    /// Ops caught in a cycle cannot be ordered and are appended by name.
    pub fn op_names_in_topological_order(&self) -> Vec<String> {
        let mut in_degree: BTreeMap<&str, usize> = self
            .upstream
            .iter()
            .map(|(name, ups)| (name.as_str(), ups.len()))
            .collect();

        let mut ready: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(&name, _)| name)
            .collect();

        let mut order = Vec::with_capacity(in_degree.len());
        while let Some(name) = ready.pop_first() {
            order.push(name.to_string());
            in_degree.remove(name);
            if let Some(children) = self.downstream.get(name) {
                for child in children {
                    if let Some(deg) = in_degree.get_mut(child.as_str()) {
                        *deg -= 1;
                        if *deg == 0 {
                            ready.insert(child.as_str());
                        }
                    }
                }
            }
        }

        order.extend(in_degree.keys().map(|name| name.to_string()));
        order
    }

    /// Ops and declared dependency edges, as plain sets
    pub fn graph_structure(&self) -> GraphStructure {
        let ops = self.job_snapshot.ops.iter().map(|op| op.name.clone()).collect();
        let edges = self
            .job_snapshot
            .ops
            .iter()
            .flat_map(|op| {
                op.upstream_op_names()
                    .map(move |up| (up.to_string(), op.name.clone()))
            })
            .collect();
        GraphStructure { ops, edges }
    }
}
