//! Snapshot data model
//!
//! Immutable structural description of one repository's contents at one
//! point in time:
//!
//! ```text
//! ExternalRepositoryData
//! ├── jobs: ExternalJobData
//! │   └── job_snapshot: JobSnapshot
//! │       ├── ops: OpSnap (inputs → upstream outputs)
//! │       ├── resources: ResourceSnap
//! │       └── run_config_schema: ConfigFieldSnap
//! ├── schedules: ScheduleSnap
//! ├── sensors: SensorSnap (targets: TargetSnap)
//! └── partition_sets: PartitionSetSnap
//! ```
//!
//! These types carry no behavior beyond traversal and serialization. A
//! snapshot is never updated in place; a refresh produces a new tree.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Everything one repository defines
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExternalRepositoryData {
    pub name: String,

    #[serde(default)]
    pub jobs: Vec<ExternalJobData>,

    #[serde(default)]
    pub schedules: Vec<ScheduleSnap>,

    #[serde(default)]
    pub sensors: Vec<SensorSnap>,

    #[serde(default)]
    pub partition_sets: Vec<PartitionSetSnap>,

    /// Display metadata reported by the worker
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,

    /// Environment variable name -> names of the jobs that read it
    #[serde(default)]
    pub utilized_env_vars: BTreeMap<String, Vec<String>>,
}

impl ExternalRepositoryData {
    pub fn new<N: Into<String>>(name: N) -> Self {
        Self {
            name: name.into(),
            jobs: Vec::new(),
            schedules: Vec::new(),
            sensors: Vec::new(),
            partition_sets: Vec::new(),
            metadata: BTreeMap::new(),
            utilized_env_vars: BTreeMap::new(),
        }
    }

    /// Lightweight references to every job
    pub fn job_refs(&self) -> Vec<ExternalJobRef> {
        self.jobs.iter().map(ExternalJobData::to_ref).collect()
    }
}

/// One job as seen by the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExternalJobData {
    pub name: String,

    pub job_snapshot: JobSnapshot,

    /// Full job snapshot when `job_snapshot` is an op subset of it
    #[serde(default)]
    pub parent_job_snapshot: Option<JobSnapshot>,

    #[serde(default)]
    pub active_presets: Vec<PresetSnap>,
}

impl ExternalJobData {
    pub fn new(job_snapshot: JobSnapshot) -> Self {
        Self {
            name: job_snapshot.name.clone(),
            job_snapshot,
            parent_job_snapshot: None,
            active_presets: Vec::new(),
        }
    }

    pub fn to_ref(&self) -> ExternalJobRef {
        ExternalJobRef {
            name: self.name.clone(),
            snapshot_id: crate::serdes::snapshot_id(&self.job_snapshot),
            parent_snapshot_id: self
                .parent_job_snapshot
                .as_ref()
                .map(crate::serdes::snapshot_id),
        }
    }
}

/// Identity of a job without its structure
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExternalJobRef {
    pub name: String,
    pub snapshot_id: String,
    #[serde(default)]
    pub parent_snapshot_id: Option<String>,
}

/// Answer to an op selection request
///
/// A selection the job cannot satisfy is reported here rather than as a
/// transport failure, so the host can show it next to the job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExternalJobSubsetResult {
    pub success: bool,

    #[serde(default)]
    pub error: Option<SerializableErrorInfo>,

    /// Subset job, with the full job as its parent snapshot
    #[serde(default)]
    pub job_data: Option<ExternalJobData>,
}

impl ExternalJobSubsetResult {
    pub fn subset(job_data: ExternalJobData) -> Self {
        Self {
            success: true,
            error: None,
            job_data: Some(job_data),
        }
    }

    pub fn failed(error: SerializableErrorInfo) -> Self {
        Self {
            success: false,
            error: Some(error),
            job_data: None,
        }
    }
}

/// Run config a partition set produces for one partition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExternalPartitionConfigData {
    /// Partition name
    pub name: String,

    #[serde(default)]
    pub run_config: Value,
}

/// Run tags a partition set produces for one partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExternalPartitionTagsData {
    /// Partition name
    pub name: String,

    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Structure of a job: ops, their wiring, resources and config schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobSnapshot {
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub tags: BTreeMap<String, String>,

    #[serde(default)]
    pub ops: Vec<OpSnap>,

    #[serde(default)]
    pub resources: Vec<ResourceSnap>,

    /// Schema of the run config accepted by this job
    #[serde(default = "ConfigFieldSnap::empty_shape")]
    pub run_config_schema: ConfigFieldSnap,

    /// Ops selected when this snapshot is a subset
    #[serde(default)]
    pub op_selection: Option<Vec<String>>,

    /// Snapshot id of the job this one was subset from
    #[serde(default)]
    pub parent_snapshot_id: Option<String>,
}

impl JobSnapshot {
    pub fn new<N: Into<String>>(name: N) -> Self {
        Self {
            name: name.into(),
            description: None,
            tags: BTreeMap::new(),
            ops: Vec::new(),
            resources: Vec::new(),
            run_config_schema: ConfigFieldSnap::empty_shape(),
            op_selection: None,
            parent_snapshot_id: None,
        }
    }
}

/// An op invocation inside a job graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpSnap {
    pub name: String,

    /// Name of the op definition (differs from `name` for aliased ops)
    pub definition_name: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub inputs: Vec<InputSnap>,

    #[serde(default)]
    pub outputs: Vec<OutputSnap>,

    #[serde(default)]
    pub required_resource_keys: Vec<String>,

    #[serde(default)]
    pub asset_keys: Vec<AssetKey>,

    #[serde(default)]
    pub tags: BTreeMap<String, String>,

    #[serde(default)]
    pub config_field: Option<ConfigFieldSnap>,
}

impl OpSnap {
    pub fn upstream_op_names(&self) -> impl Iterator<Item = &str> {
        self.inputs
            .iter()
            .flat_map(|input| input.upstream.iter().map(|h| h.op_name.as_str()))
    }

    pub fn get_output(&self, name: &str) -> Option<&OutputSnap> {
        self.outputs.iter().find(|o| o.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputSnap {
    pub name: String,

    /// Outputs feeding this input; more than one means fan-in
    #[serde(default)]
    pub upstream: Vec<OutputHandle>,

    /// Gathers every value of a mapped upstream instead of mapping over it
    #[serde(default)]
    pub collects: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutputHandle {
    pub op_name: String,
    pub output_name: String,
}

impl OutputHandle {
    pub fn new<O: Into<String>, N: Into<String>>(op_name: O, output_name: N) -> Self {
        Self {
            op_name: op_name.into(),
            output_name: output_name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputSnap {
    pub name: String,

    /// Produces a variable number of mapped values at run time
    #[serde(default)]
    pub is_dynamic: bool,

    /// Optional outputs model conditional branches
    #[serde(default = "default_true")]
    pub is_required: bool,
}

fn default_true() -> bool {
    true
}

/// Asset key, a path of segments
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssetKey(pub Vec<String>);

impl AssetKey {
    pub fn new<I, S>(path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        AssetKey(path.into_iter().map(Into::into).collect())
    }

    /// Parse a slash separated key (`warehouse/orders`)
    pub fn from_user_string(s: &str) -> Self {
        AssetKey(s.split('/').map(str::to_string).collect())
    }

    pub fn to_user_string(&self) -> String {
        self.0.join("/")
    }
}

impl fmt::Display for AssetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_user_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceSnap {
    pub key: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub config_field: Option<ConfigFieldSnap>,
}

/// Named run config bundled with a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PresetSnap {
    pub name: String,

    #[serde(default)]
    pub run_config: Value,

    #[serde(default)]
    pub op_selection: Option<Vec<String>>,

    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstigatorStatus {
    Running,
    #[default]
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScheduleSnap {
    pub name: String,

    pub cron_schedule: String,

    pub job_name: String,

    #[serde(default)]
    pub execution_timezone: Option<String>,

    #[serde(default = "default_mode")]
    pub mode: String,

    #[serde(default)]
    pub partition_set_name: Option<String>,

    #[serde(default)]
    pub default_status: InstigatorStatus,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

fn default_mode() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorType {
    #[default]
    Standard,
    RunStatus,
    Asset,
    MultiAsset,
    FreshnessPolicy,
    AutoMaterialize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SensorSnap {
    pub name: String,

    /// Primary target, when the sensor targets exactly one job
    #[serde(default)]
    pub job_name: Option<String>,

    #[serde(default)]
    pub targets: Vec<TargetSnap>,

    #[serde(default)]
    pub min_interval_secs: Option<u64>,

    #[serde(default)]
    pub default_status: InstigatorStatus,

    #[serde(default)]
    pub sensor_type: SensorType,

    #[serde(default)]
    pub description: Option<String>,
}

/// A job a sensor can request runs of
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetSnap {
    pub job_name: String,

    #[serde(default = "default_mode")]
    pub mode: String,

    #[serde(default)]
    pub op_selection: Option<Vec<String>>,
}

impl TargetSnap {
    pub fn new<N: Into<String>>(job_name: N) -> Self {
        Self {
            job_name: job_name.into(),
            mode: default_mode(),
            op_selection: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartitionSetSnap {
    pub name: String,

    pub job_name: String,

    #[serde(default = "default_mode")]
    pub mode: String,

    pub partitions: PartitionsSnap,
}

/// How a partition set enumerates its partitions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PartitionsSnap {
    /// Keys known when the snapshot was taken
    Static { partition_keys: Vec<String> },

    /// Keys held by the worker; fetched on demand
    Dynamic { name: String },
}

/// A config field: type plus requiredness and default
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFieldSnap {
    pub config_type: ConfigTypeSnap,

    #[serde(default)]
    pub is_required: bool,

    #[serde(default)]
    pub default_value: Option<Value>,

    #[serde(default)]
    pub description: Option<String>,
}

impl ConfigFieldSnap {
    pub fn required(config_type: ConfigTypeSnap) -> Self {
        Self {
            config_type,
            is_required: true,
            default_value: None,
            description: None,
        }
    }

    pub fn optional(config_type: ConfigTypeSnap) -> Self {
        Self {
            config_type,
            is_required: false,
            default_value: None,
            description: None,
        }
    }

    /// Strict shape with no fields
    pub fn empty_shape() -> Self {
        Self::optional(ConfigTypeSnap::Shape {
            fields: BTreeMap::new(),
            permissive: false,
        })
    }
}

/// Config schema type tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConfigTypeSnap {
    Any,
    Bool,
    Int,
    Float,
    String,
    Array {
        of: Box<ConfigTypeSnap>,
    },
    Noneable {
        of: Box<ConfigTypeSnap>,
    },
    Enum {
        values: Vec<String>,
    },
    Shape {
        fields: BTreeMap<String, ConfigFieldSnap>,
        #[serde(default)]
        permissive: bool,
    },
    /// Exactly one of the fields must be given
    Selector {
        fields: BTreeMap<String, ConfigFieldSnap>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// One execution of an op
    Compute,
    /// Fans out once per dynamic output value, resolved at run time
    UnresolvedMapped,
    /// Collects every value of an upstream dynamic output
    UnresolvedCollect,
}

/// A step in a structural execution plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutionStepSnap {
    pub key: String,

    pub op_name: String,

    pub kind: StepKind,

    #[serde(default)]
    pub inputs: Vec<StepInputSnap>,

    #[serde(default)]
    pub outputs: Vec<StepOutputSnap>,

    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl ExecutionStepSnap {
    /// Keys of every step this one reads from
    pub fn upstream_step_keys(&self) -> impl Iterator<Item = &str> {
        self.inputs
            .iter()
            .flat_map(|i| i.upstream.iter().map(|u| u.step_key.as_str()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepInputSnap {
    pub name: String,

    #[serde(default)]
    pub upstream: Vec<StepOutputHandle>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepOutputHandle {
    pub step_key: String,
    pub output_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepOutputSnap {
    pub name: String,

    #[serde(default)]
    pub is_dynamic: bool,

    #[serde(default = "default_true")]
    pub is_required: bool,
}

/// Structural plan: every step plus which of them will run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutionPlanSnapshot {
    pub job_name: String,

    pub steps: Vec<ExecutionStepSnap>,

    pub step_keys_to_execute: Vec<String>,

    #[serde(default)]
    pub artifacts_persisted: bool,

    /// Snapshot id of the job the plan was built from
    #[serde(default)]
    pub job_snapshot_id: Option<String>,
}

/// A worker-side failure, carried across process boundaries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializableErrorInfo {
    pub message: String,

    #[serde(default)]
    pub cls_name: Option<String>,

    /// Traceback lines as reported by the worker
    #[serde(default)]
    pub stack: Vec<String>,

    #[serde(default)]
    pub cause: Option<Box<SerializableErrorInfo>>,
}

impl SerializableErrorInfo {
    pub fn new<M: Into<String>>(message: M) -> Self {
        Self {
            message: message.into(),
            cls_name: None,
            stack: Vec::new(),
            cause: None,
        }
    }

    /// Message followed by traceback, then each cause in turn
    pub fn to_string_with_stack(&self) -> String {
        let mut out = String::new();
        if let Some(cls) = &self.cls_name {
            out.push_str(cls);
            out.push_str(": ");
        }
        out.push_str(&self.message);
        for line in &self.stack {
            if !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(line);
        }
        if let Some(cause) = &self.cause {
            if !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str("The above exception was caused by the following exception:\n");
            out.push_str(&cause.to_string_with_stack());
        }
        out
    }
}

impl fmt::Display for SerializableErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_with_stack())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serdes::snapshot_id;
    use crate::subset::subset_job;
    use crate::testing::etl_repository;

    #[test]
    fn test_asset_key_user_string() {
        let key = AssetKey::from_user_string("warehouse/orders");
        assert_eq!(key, AssetKey::new(["warehouse", "orders"]));
        assert_eq!(key.to_string(), "warehouse/orders");
    }

    #[test]
    fn test_job_refs_identify_jobs() {
        let mut repo = etl_repository("analytics");
        let subset = subset_job(&repo.jobs[0], &["load".to_string()])
            .into_job_data()
            .unwrap();
        repo.jobs.push(ExternalJobData {
            name: "etl_job_load".to_string(),
            ..subset
        });

        let refs = repo.job_refs();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].name, "etl_job");
        assert_eq!(refs[0].snapshot_id, snapshot_id(&repo.jobs[0].job_snapshot));
        assert_eq!(refs[0].parent_snapshot_id, None);
        assert_eq!(
            refs[1].parent_snapshot_id.as_deref(),
            Some(refs[0].snapshot_id.as_str())
        );
        assert_ne!(refs[1].snapshot_id, refs[0].snapshot_id);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let json = r#"{"name": "repo", "jobs": [], "surprise": 1}"#;
        let parsed: Result<ExternalRepositoryData, _> = serde_json::from_str(json);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_defaults_fill_optional_fields() {
        let json = r#"{"name": "daily", "cron_schedule": "0 0 * * *", "job_name": "etl_job"}"#;
        let snap: ScheduleSnap = serde_json::from_str(json).unwrap();
        assert_eq!(snap.mode, "default");
        assert_eq!(snap.default_status, InstigatorStatus::Stopped);
    }

    #[test]
    fn test_error_info_with_cause() {
        let info = SerializableErrorInfo {
            message: "outer".to_string(),
            cls_name: Some("RuntimeError".to_string()),
            stack: vec!["  line 1\n".to_string()],
            cause: Some(Box::new(SerializableErrorInfo::new("inner"))),
        };
        let text = info.to_string_with_stack();
        assert!(text.starts_with("RuntimeError: outer\n  line 1\n"));
        assert!(text.ends_with("inner"));
    }

    #[test]
    fn test_partitions_tagged() {
        let json = r#"{"kind": "static", "partition_keys": ["2024-01-01"]}"#;
        let parts: PartitionsSnap = serde_json::from_str(json).unwrap();
        assert_eq!(
            parts,
            PartitionsSnap::Static {
                partition_keys: vec!["2024-01-01".to_string()]
            }
        );
    }
}
