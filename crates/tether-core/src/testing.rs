//! Snapshot fixtures for tests
//!
//! Small builders for the snapshot tree plus a canned `etl_job` repository
//! (`extract -> transform -> load`) used across the workspace's tests.

use crate::snapshot::{
    AssetKey, ConfigFieldSnap, ConfigTypeSnap, ExternalJobData, ExternalRepositoryData,
    InputSnap, InstigatorStatus, JobSnapshot, OpSnap, OutputHandle, OutputSnap,
    PartitionSetSnap, PartitionsSnap, PresetSnap, ResourceSnap, ScheduleSnap, SensorSnap,
    SensorType, TargetSnap,
};
use std::collections::BTreeMap;

/// Builder for an [`OpSnap`]
#[derive(Debug, Clone)]
pub struct OpBuilder {
    op: OpSnap,
}

impl OpBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            op: OpSnap {
                name: name.to_string(),
                definition_name: name.to_string(),
                description: None,
                inputs: Vec::new(),
                outputs: vec![OutputSnap {
                    name: "result".to_string(),
                    is_dynamic: false,
                    is_required: true,
                }],
                required_resource_keys: Vec::new(),
                asset_keys: Vec::new(),
                tags: BTreeMap::new(),
                config_field: None,
            },
        }
    }

    /// Add an input wired to `upstream_op`'s `result` output
    pub fn input_from(self, input: &str, upstream_op: &str) -> Self {
        self.input_from_output(input, upstream_op, "result")
    }

    pub fn input_from_output(mut self, input: &str, upstream_op: &str, output: &str) -> Self {
        self.op.inputs.push(InputSnap {
            name: input.to_string(),
            upstream: vec![OutputHandle::new(upstream_op, output)],
            collects: false,
        });
        self
    }

    /// Add an input that gathers every mapped value of `upstream_op`'s output
    pub fn collect_from(mut self, input: &str, upstream_op: &str, output: &str) -> Self {
        self.op.inputs.push(InputSnap {
            name: input.to_string(),
            upstream: vec![OutputHandle::new(upstream_op, output)],
            collects: true,
        });
        self
    }

    /// Replace the default output with a dynamic one
    pub fn dynamic_output(mut self, name: &str) -> Self {
        self.op.outputs = vec![OutputSnap {
            name: name.to_string(),
            is_dynamic: true,
            is_required: true,
        }];
        self
    }

    pub fn optional_output(mut self, name: &str) -> Self {
        self.op.outputs.push(OutputSnap {
            name: name.to_string(),
            is_dynamic: false,
            is_required: false,
        });
        self
    }

    pub fn asset(mut self, key: &str) -> Self {
        self.op.asset_keys.push(AssetKey::from_user_string(key));
        self
    }

    pub fn resource(mut self, key: &str) -> Self {
        self.op.required_resource_keys.push(key.to_string());
        self
    }

    pub fn config(mut self, field: ConfigFieldSnap) -> Self {
        self.op.config_field = Some(field);
        self
    }

    pub fn build(self) -> OpSnap {
        self.op
    }
}

/// Build a job snapshot whose run config schema has an `ops` section with one
/// entry per op that declares config
pub fn job_snapshot(name: &str, ops: Vec<OpSnap>) -> JobSnapshot {
    let mut op_fields = BTreeMap::new();
    for op in &ops {
        if let Some(field) = &op.config_field {
            let mut fields = BTreeMap::new();
            fields.insert("config".to_string(), field.clone());
            let is_required = field.is_required;
            op_fields.insert(
                op.name.clone(),
                ConfigFieldSnap {
                    config_type: ConfigTypeSnap::Shape {
                        fields,
                        permissive: false,
                    },
                    is_required,
                    default_value: None,
                    description: None,
                },
            );
        }
    }
    let ops_required = op_fields.values().any(|f| f.is_required);

    let mut root_fields = BTreeMap::new();
    root_fields.insert(
        "ops".to_string(),
        ConfigFieldSnap {
            config_type: ConfigTypeSnap::Shape {
                fields: op_fields,
                permissive: false,
            },
            is_required: ops_required,
            default_value: None,
            description: None,
        },
    );
    root_fields.insert(
        "resources".to_string(),
        ConfigFieldSnap::optional(ConfigTypeSnap::Shape {
            fields: BTreeMap::new(),
            permissive: true,
        }),
    );

    let mut snapshot = JobSnapshot::new(name);
    snapshot.ops = ops;
    snapshot.run_config_schema = ConfigFieldSnap::optional(ConfigTypeSnap::Shape {
        fields: root_fields,
        permissive: false,
    });
    snapshot
}

/// `extract -> transform -> load`
pub fn etl_job_snapshot() -> JobSnapshot {
    let mut snapshot = job_snapshot(
        "etl_job",
        vec![
            OpBuilder::new("extract")
                .asset("raw/orders")
                .resource("warehouse")
                .build(),
            OpBuilder::new("transform")
                .input_from("raw", "extract")
                .asset("clean/orders")
                .build(),
            OpBuilder::new("load")
                .input_from("clean", "transform")
                .asset("warehouse/orders")
                .resource("warehouse")
                .build(),
        ],
    );
    snapshot.description = Some("Nightly orders ETL".to_string());
    snapshot.tags.insert("team".to_string(), "data".to_string());
    snapshot.resources = vec![ResourceSnap {
        key: "warehouse".to_string(),
        description: Some("Warehouse connection".to_string()),
        config_field: None,
    }];
    snapshot
}

/// `split` emits dynamic chunks, `process` maps over them, `merge` collects
pub fn fanout_job_snapshot() -> JobSnapshot {
    job_snapshot(
        "fanout_job",
        vec![
            OpBuilder::new("split").dynamic_output("chunk").build(),
            OpBuilder::new("process")
                .input_from_output("chunk", "split", "chunk")
                .build(),
            OpBuilder::new("merge")
                .collect_from("results", "process", "result")
                .build(),
        ],
    )
}

/// Repository holding `etl_job` with a schedule, a sensor and a partition set
pub fn etl_repository(name: &str) -> ExternalRepositoryData {
    let mut etl = ExternalJobData::new(etl_job_snapshot());
    etl.active_presets.push(PresetSnap {
        name: "default".to_string(),
        run_config: serde_json::json!({}),
        op_selection: None,
        tags: BTreeMap::new(),
    });

    let mut repo = ExternalRepositoryData::new(name);
    repo.jobs.push(etl);
    repo.schedules.push(ScheduleSnap {
        name: "daily_etl".to_string(),
        cron_schedule: "0 2 * * *".to_string(),
        job_name: "etl_job".to_string(),
        execution_timezone: Some("UTC".to_string()),
        mode: "default".to_string(),
        partition_set_name: Some("etl_job_partition_set".to_string()),
        default_status: InstigatorStatus::Running,
        description: None,
        tags: BTreeMap::new(),
    });
    repo.sensors.push(SensorSnap {
        name: "new_files".to_string(),
        job_name: Some("etl_job".to_string()),
        targets: vec![TargetSnap::new("etl_job")],
        min_interval_secs: Some(30),
        default_status: InstigatorStatus::Stopped,
        sensor_type: SensorType::Standard,
        description: None,
    });
    repo.partition_sets.push(PartitionSetSnap {
        name: "etl_job_partition_set".to_string(),
        job_name: "etl_job".to_string(),
        mode: "default".to_string(),
        partitions: PartitionsSnap::Static {
            partition_keys: vec!["2024-01-01".to_string(), "2024-01-02".to_string()],
        },
    });
    repo.metadata
        .insert("owner".to_string(), "data-platform".to_string());
    repo
}
