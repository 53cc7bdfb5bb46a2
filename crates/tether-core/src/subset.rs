//! Op subsets of a job
//!
//! A subset keeps the selected ops, drops wiring to ops outside the
//! selection and narrows the `ops` section of the run config schema to
//! match. The full job travels along as the parent snapshot, so runs of the
//! subset still identify with the job they were cut from.

use crate::error::{Error, Result};
use crate::serdes::snapshot_id;
use crate::snapshot::{
    ConfigTypeSnap, ExternalJobData, ExternalJobSubsetResult, JobSnapshot, SerializableErrorInfo,
};
use std::collections::BTreeSet;

/// Error class reported for selections a job cannot satisfy
pub const INVALID_SUBSET_ERROR: &str = "InvalidSubsetError";

/// Cut `op_selection` out of a job
///
/// A job that is already a subset is cut from its parent, never from the
/// subset itself. Selections naming no op or an unknown op fail inside the
/// result.
pub fn subset_job(data: &ExternalJobData, op_selection: &[String]) -> ExternalJobSubsetResult {
    let parent = data
        .parent_job_snapshot
        .as_ref()
        .unwrap_or(&data.job_snapshot);

    match subset_snapshot(parent, op_selection) {
        Ok(job_snapshot) => ExternalJobSubsetResult::subset(ExternalJobData {
            name: data.name.clone(),
            job_snapshot,
            parent_job_snapshot: Some(parent.clone()),
            active_presets: data.active_presets.clone(),
        }),
        Err(message) => {
            let mut info = SerializableErrorInfo::new(message);
            info.cls_name = Some(INVALID_SUBSET_ERROR.to_string());
            ExternalJobSubsetResult::failed(info)
        }
    }
}

fn subset_snapshot(
    parent: &JobSnapshot,
    op_selection: &[String],
) -> std::result::Result<JobSnapshot, String> {
    if op_selection.is_empty() {
        return Err(format!("op selection for job {} is empty", parent.name));
    }

    let known: BTreeSet<&str> = parent.ops.iter().map(|op| op.name.as_str()).collect();
    let unknown: Vec<&str> = op_selection
        .iter()
        .map(String::as_str)
        .filter(|name| !known.contains(name))
        .collect();
    if !unknown.is_empty() {
        return Err(format!(
            "ops not found in job {}: {}",
            parent.name,
            unknown.join(", ")
        ));
    }

    let selected: BTreeSet<&str> = op_selection.iter().map(String::as_str).collect();
    let mut subset = parent.clone();

    subset.ops.retain(|op| selected.contains(op.name.as_str()));
    for op in &mut subset.ops {
        for input in &mut op.inputs {
            input
                .upstream
                .retain(|handle| selected.contains(handle.op_name.as_str()));
        }
    }

    if let ConfigTypeSnap::Shape { fields, .. } = &mut subset.run_config_schema.config_type {
        if let Some(ops_field) = fields.get_mut("ops") {
            if let ConfigTypeSnap::Shape { fields: op_fields, .. } = &mut ops_field.config_type {
                op_fields.retain(|name, _| selected.contains(name.as_str()));
                ops_field.is_required = op_fields.values().any(|f| f.is_required);
            }
        }
    }

    // Parent order, not selection order, so equal selections hash equally.
    subset.op_selection = Some(subset.ops.iter().map(|op| op.name.clone()).collect());
    subset.parent_snapshot_id = Some(snapshot_id(parent));
    Ok(subset)
}

impl ExternalJobSubsetResult {
    /// The subset job, or the reason the selection was refused
    pub fn into_job_data(self) -> Result<ExternalJobData> {
        match (self.success, self.job_data, self.error) {
            (true, Some(data), _) => Ok(data),
            (_, _, Some(error)) => Err(Error::UserCode(error)),
            _ => Err(Error::corrupt("job subset result carries neither a job nor an error")),
        }
    }
}
