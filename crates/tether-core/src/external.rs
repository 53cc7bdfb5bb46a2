//! Host-side query wrappers over a fetched snapshot
//!
//! These types never fetch: everything they answer was already retrieved by
//! the code location. Lookups of absent names fail with
//! [`Error::NotFound`], keeping "absent" distinct from "malformed".

use crate::error::{EntityKind, Error, Result};
use crate::handle::{JobHandle, RepositoryHandle};
use crate::job_index::JobIndex;
use crate::origin::{CodeLocationOrigin, RemoteInstigatorOrigin, RemoteJobOrigin, RemoteRepositoryOrigin};
use crate::represented::RepresentedJob;
use crate::snapshot::{
    ExternalJobData, ExternalRepositoryData, InstigatorStatus, PartitionSetSnap, PartitionsSnap,
    PresetSnap, ScheduleSnap, SensorSnap, SensorType, TargetSnap,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock};

/// One repository of a code location
#[derive(Debug)]
pub struct ExternalRepository {
    handle: RepositoryHandle,
    data: Arc<ExternalRepositoryData>,

    job_positions: HashMap<String, usize>,
    /// Wrapped lazily; each job is indexed at most once
    jobs: Vec<OnceLock<Arc<ExternalJob>>>,

    schedule_positions: HashMap<String, usize>,
    sensor_positions: HashMap<String, usize>,
    partition_set_positions: HashMap<String, usize>,
}

impl ExternalRepository {
    pub fn new(data: Arc<ExternalRepositoryData>, handle: RepositoryHandle) -> Self {
        fn positions<'a>(names: impl Iterator<Item = &'a str>) -> HashMap<String, usize> {
            names
                .enumerate()
                .map(|(pos, name)| (name.to_string(), pos))
                .collect()
        }

        Self {
            job_positions: positions(data.jobs.iter().map(|j| j.name.as_str())),
            jobs: (0..data.jobs.len()).map(|_| OnceLock::new()).collect(),
            schedule_positions: positions(data.schedules.iter().map(|s| s.name.as_str())),
            sensor_positions: positions(data.sensors.iter().map(|s| s.name.as_str())),
            partition_set_positions: positions(data.partition_sets.iter().map(|p| p.name.as_str())),
            handle,
            data,
        }
    }

    /// Wrap a repository fetched from the given location
    pub fn from_location(data: Arc<ExternalRepositoryData>, origin: CodeLocationOrigin) -> Self {
        let handle = RepositoryHandle::new(data.name.clone(), origin)
            .with_display_metadata(data.metadata.clone());
        Self::new(data, handle)
    }

    pub fn name(&self) -> &str {
        &self.data.name
    }

    pub fn handle(&self) -> &RepositoryHandle {
        &self.handle
    }

    pub fn data(&self) -> &Arc<ExternalRepositoryData> {
        &self.data
    }

    pub fn get_remote_origin(&self) -> RemoteRepositoryOrigin {
        self.handle.to_remote_origin()
    }

    pub fn get_display_metadata(&self) -> &BTreeMap<String, String> {
        &self.data.metadata
    }

    pub fn get_utilized_env_vars(&self) -> &BTreeMap<String, Vec<String>> {
        &self.data.utilized_env_vars
    }

    pub fn has_job(&self, name: &str) -> bool {
        self.job_positions.contains_key(name)
    }

    pub fn get_job(&self, name: &str) -> Result<Arc<ExternalJob>> {
        let pos = *self
            .job_positions
            .get(name)
            .ok_or_else(|| Error::not_found(EntityKind::Job, name))?;
        Ok(self.job_at(pos))
    }

    pub fn get_all_jobs(&self) -> Vec<Arc<ExternalJob>> {
        (0..self.data.jobs.len()).map(|pos| self.job_at(pos)).collect()
    }

    pub fn job_names(&self) -> Vec<&str> {
        self.data.jobs.iter().map(|j| j.name.as_str()).collect()
    }

    fn job_at(&self, pos: usize) -> Arc<ExternalJob> {
        self.jobs[pos]
            .get_or_init(|| Arc::new(self.wrap_job(&self.data.jobs[pos])))
            .clone()
    }

    /// Wrap job data fetched for this repository outside its snapshot
    ///
    /// Used for op subsets, which the location builds on request. The job
    /// must exist in the repository under the same name.
    pub fn wrap_job(&self, data: &ExternalJobData) -> ExternalJob {
        let partition_sets = self
            .data
            .partition_sets
            .iter()
            .filter(|p| p.job_name == data.name)
            .cloned()
            .collect();
        ExternalJob::new(data, self.handle.for_job(data.name.clone()), partition_sets)
    }

    pub fn has_schedule(&self, name: &str) -> bool {
        self.schedule_positions.contains_key(name)
    }

    pub fn get_schedule(&self, name: &str) -> Result<ExternalSchedule> {
        let pos = self
            .schedule_positions
            .get(name)
            .ok_or_else(|| Error::not_found(EntityKind::Schedule, name))?;
        Ok(ExternalSchedule::new(self.data.schedules[*pos].clone(), self.handle.clone()))
    }

    pub fn get_schedules(&self) -> Vec<ExternalSchedule> {
        self.data
            .schedules
            .iter()
            .map(|s| ExternalSchedule::new(s.clone(), self.handle.clone()))
            .collect()
    }

    pub fn schedules_for_job(&self, job_name: &str) -> Vec<ExternalSchedule> {
        self.get_schedules()
            .into_iter()
            .filter(|s| s.job_name() == job_name)
            .collect()
    }

    pub fn has_sensor(&self, name: &str) -> bool {
        self.sensor_positions.contains_key(name)
    }

    pub fn get_sensor(&self, name: &str) -> Result<ExternalSensor> {
        let pos = self
            .sensor_positions
            .get(name)
            .ok_or_else(|| Error::not_found(EntityKind::Sensor, name))?;
        Ok(ExternalSensor::new(self.data.sensors[*pos].clone(), self.handle.clone()))
    }

    pub fn get_sensors(&self) -> Vec<ExternalSensor> {
        self.data
            .sensors
            .iter()
            .map(|s| ExternalSensor::new(s.clone(), self.handle.clone()))
            .collect()
    }

    pub fn sensors_for_job(&self, job_name: &str) -> Vec<ExternalSensor> {
        self.get_sensors()
            .into_iter()
            .filter(|s| s.get_target(job_name).is_some())
            .collect()
    }

    pub fn has_partition_set(&self, name: &str) -> bool {
        self.partition_set_positions.contains_key(name)
    }

    pub fn get_partition_set(&self, name: &str) -> Result<ExternalPartitionSet> {
        let pos = self
            .partition_set_positions
            .get(name)
            .ok_or_else(|| Error::not_found(EntityKind::PartitionSet, name))?;
        Ok(ExternalPartitionSet::new(
            self.data.partition_sets[*pos].clone(),
            self.handle.clone(),
        ))
    }

    pub fn get_partition_sets(&self) -> Vec<ExternalPartitionSet> {
        self.data
            .partition_sets
            .iter()
            .map(|p| ExternalPartitionSet::new(p.clone(), self.handle.clone()))
            .collect()
    }
}

/// A live job, backed by a snapshot fetched from its code location
#[derive(Debug)]
pub struct ExternalJob {
    handle: JobHandle,
    index: JobIndex,
    active_presets: Vec<PresetSnap>,
}

impl ExternalJob {
    pub fn new(data: &ExternalJobData, handle: JobHandle, partition_sets: Vec<PartitionSetSnap>) -> Self {
        let index = JobIndex::new(
            Arc::new(data.job_snapshot.clone()),
            data.parent_job_snapshot.clone().map(Arc::new),
            partition_sets,
        );
        Self {
            handle,
            index,
            active_presets: data.active_presets.clone(),
        }
    }

    pub fn handle(&self) -> &JobHandle {
        &self.handle
    }

    pub fn description(&self) -> Option<&str> {
        self.index.job_snapshot().description.as_deref()
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.index.job_snapshot().tags
    }

    pub fn active_presets(&self) -> &[PresetSnap] {
        &self.active_presets
    }

    pub fn get_preset(&self, name: &str) -> Result<&PresetSnap> {
        self.active_presets
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| Error::not_found(EntityKind::Preset, name))
    }

    pub fn is_subset(&self) -> bool {
        self.op_selection().is_some()
    }

    pub fn computed_job_snapshot_id(&self) -> &str {
        self.index.job_snapshot_id()
    }

    /// Snapshot id of the full job this one was subset from, else its own
    pub fn identifying_job_snapshot_id(&self) -> &str {
        self.index
            .parent_job_snapshot_id()
            .unwrap_or_else(|| self.index.job_snapshot_id())
    }

    pub fn get_remote_origin(&self) -> RemoteJobOrigin {
        self.handle.to_remote_origin()
    }

    pub fn location_name(&self) -> &str {
        self.handle.location_name()
    }

    pub fn repository_name(&self) -> &str {
        self.handle.repository_name()
    }
}

impl RepresentedJob for ExternalJob {
    fn name(&self) -> &str {
        &self.handle.job_name
    }

    fn job_index(&self) -> &JobIndex {
        &self.index
    }
}

#[derive(Debug, Clone)]
pub struct ExternalSchedule {
    data: ScheduleSnap,
    handle: RepositoryHandle,
}

impl ExternalSchedule {
    pub fn new(data: ScheduleSnap, handle: RepositoryHandle) -> Self {
        Self { data, handle }
    }

    pub fn name(&self) -> &str {
        &self.data.name
    }

    pub fn cron_schedule(&self) -> &str {
        &self.data.cron_schedule
    }

    pub fn execution_timezone(&self) -> Option<&str> {
        self.data.execution_timezone.as_deref()
    }

    pub fn job_name(&self) -> &str {
        &self.data.job_name
    }

    pub fn mode(&self) -> &str {
        &self.data.mode
    }

    pub fn partition_set_name(&self) -> Option<&str> {
        self.data.partition_set_name.as_deref()
    }

    pub fn default_status(&self) -> InstigatorStatus {
        self.data.default_status
    }

    pub fn description(&self) -> Option<&str> {
        self.data.description.as_deref()
    }

    pub fn handle(&self) -> &RepositoryHandle {
        &self.handle
    }

    pub fn data(&self) -> &ScheduleSnap {
        &self.data
    }

    pub fn get_remote_origin(&self) -> RemoteInstigatorOrigin {
        self.handle.to_remote_origin().get_instigator_origin(self.data.name.clone())
    }

    pub fn get_remote_origin_id(&self) -> String {
        self.get_remote_origin().get_id()
    }

    pub fn selector_id(&self) -> String {
        self.get_remote_origin().selector_id()
    }
}

#[derive(Debug, Clone)]
pub struct ExternalSensor {
    data: SensorSnap,
    handle: RepositoryHandle,
}

impl ExternalSensor {
    pub fn new(data: SensorSnap, handle: RepositoryHandle) -> Self {
        Self { data, handle }
    }

    pub fn name(&self) -> &str {
        &self.data.name
    }

    pub fn job_name(&self) -> Option<&str> {
        self.data.job_name.as_deref()
    }

    pub fn targets(&self) -> &[TargetSnap] {
        &self.data.targets
    }

    pub fn get_target(&self, job_name: &str) -> Option<&TargetSnap> {
        self.data.targets.iter().find(|t| t.job_name == job_name)
    }

    /// Every job this sensor may request runs of, deduplicated in target order
    pub fn job_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::with_capacity(self.data.targets.len());
        for target in &self.data.targets {
            if !names.contains(&target.job_name.as_str()) {
                names.push(&target.job_name);
            }
        }
        names
    }

    pub fn min_interval_secs(&self) -> Option<u64> {
        self.data.min_interval_secs
    }

    pub fn default_status(&self) -> InstigatorStatus {
        self.data.default_status
    }

    pub fn sensor_type(&self) -> SensorType {
        self.data.sensor_type
    }

    pub fn description(&self) -> Option<&str> {
        self.data.description.as_deref()
    }

    pub fn handle(&self) -> &RepositoryHandle {
        &self.handle
    }

    pub fn data(&self) -> &SensorSnap {
        &self.data
    }

    pub fn get_remote_origin(&self) -> RemoteInstigatorOrigin {
        self.handle.to_remote_origin().get_instigator_origin(self.data.name.clone())
    }

    pub fn get_remote_origin_id(&self) -> String {
        self.get_remote_origin().get_id()
    }

    pub fn selector_id(&self) -> String {
        self.get_remote_origin().selector_id()
    }
}

#[derive(Debug, Clone)]
pub struct ExternalPartitionSet {
    data: PartitionSetSnap,
    handle: RepositoryHandle,
}

impl ExternalPartitionSet {
    pub fn new(data: PartitionSetSnap, handle: RepositoryHandle) -> Self {
        Self { data, handle }
    }

    pub fn name(&self) -> &str {
        &self.data.name
    }

    pub fn job_name(&self) -> &str {
        &self.data.job_name
    }

    pub fn mode(&self) -> &str {
        &self.data.mode
    }

    pub fn handle(&self) -> &RepositoryHandle {
        &self.handle
    }

    pub fn data(&self) -> &PartitionSetSnap {
        &self.data
    }

    /// Partition names known at snapshot time; `None` when the worker must
    /// be asked
    pub fn static_partition_names(&self) -> Option<&[String]> {
        match &self.data.partitions {
            PartitionsSnap::Static { partition_keys } => Some(partition_keys),
            PartitionsSnap::Dynamic { .. } => None,
        }
    }

    pub fn has_dynamic_partitions(&self) -> bool {
        matches!(self.data.partitions, PartitionsSnap::Dynamic { .. })
    }

    pub fn get_remote_origin(&self) -> RemoteRepositoryOrigin {
        self.handle.to_remote_origin()
    }
}
