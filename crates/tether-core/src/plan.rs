//! ExternalExecutionPlan: the host-side structural plan for a job
//!
//! Steps are derived from ops without running user code. Ops that consume a
//! dynamic output cannot be expanded until run time, so they are kept as
//! unresolved steps (`op[?]`) alongside the concrete ones.

use crate::error::{EntityKind, Error, Result};
use crate::represented::RepresentedJob;
use crate::run_config::{validate_run_config, RunConfig};
use crate::snapshot::{
    ExecutionPlanSnapshot, ExecutionStepSnap, OpSnap, StepInputSnap, StepKind, StepOutputHandle,
    StepOutputSnap,
};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

/// Suffix marking a step whose mapping keys are only known at run time
pub const UNRESOLVED_SUFFIX: &str = "[?]";

#[derive(Debug, Clone)]
pub struct ExternalExecutionPlan {
    snapshot: ExecutionPlanSnapshot,

    /// Step key -> position in `snapshot.steps`
    positions: HashMap<String, usize>,

    /// Edges point from upstream to downstream; node weights are positions
    graph: DiGraph<usize, ()>,

    /// Steps grouped by depth, keys sorted within a level
    levels: Vec<Vec<String>>,
}

/// How an op relates to the dynamic outputs upstream of it
#[derive(Debug, Clone, PartialEq, Eq)]
enum Mapping {
    None,
    /// Mapped over the dynamic output of the named op
    Mapped(String),
    Collect,
}

impl ExternalExecutionPlan {
    /// Build a plan from a job and run config
    ///
    /// With `step_keys_to_execute` unset every step executes.
    pub fn build(
        job: &dyn RepresentedJob,
        run_config: &RunConfig,
        step_keys_to_execute: Option<&[String]>,
    ) -> Result<Self> {
        let job_name = job.name();

        let violations = validate_run_config(job.config_schema(), run_config.as_value());
        if !violations.is_empty() {
            return Err(Error::InvalidConfig {
                job_name: job_name.to_string(),
                violations,
            });
        }

        let mut mappings: BTreeMap<String, Mapping> = BTreeMap::new();
        let mut steps = Vec::new();
        for op_name in job.op_names_in_topological_order() {
            let op = job.get_op(&op_name)?;
            let mapping = classify(job, op, &mappings)?;
            steps.push(step_for_op(op, &mapping, &mappings));
            mappings.insert(op_name, mapping);
        }

        let all_keys: Vec<String> = steps.iter().map(|s| s.key.clone()).collect();
        let snapshot = ExecutionPlanSnapshot {
            job_name: job_name.to_string(),
            steps,
            step_keys_to_execute: match step_keys_to_execute {
                Some(keys) => keys.to_vec(),
                None => all_keys,
            },
            artifacts_persisted: false,
            job_snapshot_id: Some(job.job_snapshot_id().to_string()),
        };

        let plan = Self::from_snapshot(snapshot)?;
        debug!(
            "Built execution plan for {} with {} steps ({} to execute)",
            job_name,
            plan.snapshot.steps.len(),
            plan.snapshot.step_keys_to_execute.len()
        );
        Ok(plan)
    }

    /// Wrap a plan built elsewhere, checking it the same way as a local build
    pub fn from_snapshot(mut snapshot: ExecutionPlanSnapshot) -> Result<Self> {
        let job_name = snapshot.job_name.clone();

        let mut positions = HashMap::with_capacity(snapshot.steps.len());
        let mut graph = DiGraph::with_capacity(snapshot.steps.len(), snapshot.steps.len());
        let mut nodes: Vec<NodeIndex> = Vec::with_capacity(snapshot.steps.len());
        for (pos, step) in snapshot.steps.iter().enumerate() {
            if positions.insert(step.key.clone(), pos).is_some() {
                return Err(Error::plan(
                    &job_name,
                    format!("duplicate step key {}", step.key),
                ));
            }
            nodes.push(graph.add_node(pos));
        }

        for (pos, step) in snapshot.steps.iter().enumerate() {
            for input in &step.inputs {
                for handle in &input.upstream {
                    let up = positions.get(&handle.step_key).ok_or_else(|| {
                        Error::plan(
                            &job_name,
                            format!(
                                "step {} input {} depends on unknown step {}",
                                step.key, input.name, handle.step_key
                            ),
                        )
                    })?;
                    let produces = snapshot.steps[*up]
                        .outputs
                        .iter()
                        .any(|o| o.name == handle.output_name);
                    if !produces {
                        return Err(Error::plan(
                            &job_name,
                            format!(
                                "step {} input {} depends on unknown output {}.{}",
                                step.key, input.name, handle.step_key, handle.output_name
                            ),
                        ));
                    }
                    graph.update_edge(nodes[*up], nodes[pos], ());
                }
            }
        }

        if let Err(cycle) = petgraph::algo::toposort(&graph, None) {
            let key = &snapshot.steps[graph[cycle.node_id()]].key;
            return Err(Error::plan(
                &job_name,
                format!("dependency cycle through step {}", key),
            ));
        }

        let levels = step_levels(&snapshot.steps, &graph, &nodes);

        let mut unknown: Vec<&str> = snapshot
            .step_keys_to_execute
            .iter()
            .filter(|k| !positions.contains_key(k.as_str()))
            .map(String::as_str)
            .collect();
        if !unknown.is_empty() {
            unknown.sort_unstable();
            return Err(Error::plan(
                &job_name,
                format!("unknown step keys to execute: {}", unknown.join(", ")),
            ));
        }

        // Keep the subset in plan order so equal subsets compare equal.
        let selected: BTreeSet<String> = snapshot.step_keys_to_execute.drain(..).collect();
        snapshot.step_keys_to_execute = levels
            .iter()
            .flatten()
            .filter(|k| selected.contains(*k))
            .cloned()
            .collect();

        Ok(Self {
            snapshot,
            positions,
            graph,
            levels,
        })
    }

    pub fn job_name(&self) -> &str {
        &self.snapshot.job_name
    }

    pub fn steps(&self) -> &[ExecutionStepSnap] {
        &self.snapshot.steps
    }

    pub fn get_step_by_key(&self, key: &str) -> Result<&ExecutionStepSnap> {
        self.positions
            .get(key)
            .map(|&pos| &self.snapshot.steps[pos])
            .ok_or_else(|| Error::not_found(EntityKind::Step, key))
    }

    pub fn has_step(&self, key: &str) -> bool {
        self.positions.contains_key(key)
    }

    /// Every step key, in the order the steps were declared
    pub fn step_keys_in_plan(&self) -> Vec<&str> {
        self.snapshot.steps.iter().map(|s| s.key.as_str()).collect()
    }

    pub fn step_keys_to_execute(&self) -> &[String] {
        &self.snapshot.step_keys_to_execute
    }

    /// Keys of the steps `key` directly depends on
    pub fn dependencies_of(&self, key: &str) -> Result<BTreeSet<String>> {
        let pos = *self
            .positions
            .get(key)
            .ok_or_else(|| Error::not_found(EntityKind::Step, key))?;
        Ok(self
            .graph
            .neighbors_directed(NodeIndex::new(pos), Direction::Incoming)
            .map(|n| self.snapshot.steps[self.graph[n]].key.clone())
            .collect())
    }

    /// `(upstream, downstream)` step key pairs
    pub fn dependency_edges(&self) -> BTreeSet<(String, String)> {
        self.graph
            .raw_edges()
            .iter()
            .map(|e| {
                (
                    self.snapshot.steps[self.graph[e.source()]].key.clone(),
                    self.snapshot.steps[self.graph[e.target()]].key.clone(),
                )
            })
            .collect()
    }

    /// Steps ordered so every step follows its dependencies
    pub fn topological_steps(&self) -> Vec<&ExecutionStepSnap> {
        self.levels
            .iter()
            .flatten()
            .map(|key| &self.snapshot.steps[self.positions[key]])
            .collect()
    }

    /// Steps grouped into levels that can run concurrently
    pub fn topological_step_levels(&self) -> &[Vec<String>] {
        &self.levels
    }

    pub fn snapshot(&self) -> &ExecutionPlanSnapshot {
        &self.snapshot
    }

    pub fn into_snapshot(self) -> ExecutionPlanSnapshot {
        self.snapshot
    }
}

fn step_key(op_name: &str, mapping: &Mapping) -> String {
    match mapping {
        Mapping::Mapped(_) => format!("{}{}", op_name, UNRESOLVED_SUFFIX),
        Mapping::None | Mapping::Collect => op_name.to_string(),
    }
}

/// Work out whether `op` maps over or collects a dynamic output
///
/// Upstream ops must already be in `mappings`; an upstream missing from the
/// job is a definition error.
fn classify(
    job: &dyn RepresentedJob,
    op: &OpSnap,
    mappings: &BTreeMap<String, Mapping>,
) -> Result<Mapping> {
    let mut mapped_over: Option<String> = None;
    let mut collects = false;

    for input in &op.inputs {
        for handle in &input.upstream {
            let upstream = job.get_op(&handle.op_name).map_err(|_| {
                Error::plan(
                    job.name(),
                    format!(
                        "op {} input {} depends on unknown op {}",
                        op.name, input.name, handle.op_name
                    ),
                )
            })?;
            let output = upstream.get_output(&handle.output_name).ok_or_else(|| {
                Error::plan(
                    job.name(),
                    format!(
                        "op {} input {} depends on unknown output {}.{}",
                        op.name, input.name, handle.op_name, handle.output_name
                    ),
                )
            })?;

            let source = match mappings.get(&handle.op_name) {
                Some(Mapping::Mapped(source)) => Some(source.clone()),
                _ if output.is_dynamic => Some(handle.op_name.clone()),
                _ => None,
            };
            let Some(source) = source else { continue };

            if input.collects {
                collects = true;
                continue;
            }
            match &mapped_over {
                Some(existing) if existing != &source => {
                    return Err(Error::plan(
                        job.name(),
                        format!(
                            "op {} maps over dynamic outputs of both {} and {}",
                            op.name, existing, source
                        ),
                    ));
                }
                _ => mapped_over = Some(source),
            }
        }
    }

    match (mapped_over, collects) {
        (Some(_), true) => Err(Error::plan(
            job.name(),
            format!("op {} both maps over and collects dynamic outputs", op.name),
        )),
        (Some(source), false) => Ok(Mapping::Mapped(source)),
        (None, true) => Ok(Mapping::Collect),
        (None, false) => Ok(Mapping::None),
    }
}

fn step_for_op(
    op: &OpSnap,
    mapping: &Mapping,
    mappings: &BTreeMap<String, Mapping>,
) -> ExecutionStepSnap {
    let inputs = op
        .inputs
        .iter()
        .map(|input| StepInputSnap {
            name: input.name.clone(),
            upstream: input
                .upstream
                .iter()
                .map(|h| StepOutputHandle {
                    step_key: step_key(
                        &h.op_name,
                        mappings.get(&h.op_name).unwrap_or(&Mapping::None),
                    ),
                    output_name: h.output_name.clone(),
                })
                .collect(),
        })
        .collect();

    let outputs = op
        .outputs
        .iter()
        .map(|o| StepOutputSnap {
            name: o.name.clone(),
            is_dynamic: o.is_dynamic,
            is_required: o.is_required,
        })
        .collect();

    ExecutionStepSnap {
        key: step_key(&op.name, mapping),
        op_name: op.name.clone(),
        kind: match mapping {
            Mapping::None => StepKind::Compute,
            Mapping::Mapped(_) => StepKind::UnresolvedMapped,
            Mapping::Collect => StepKind::UnresolvedCollect,
        },
        inputs,
        outputs,
        tags: op.tags.clone(),
    }
}

/// Group an acyclic step graph by longest distance from a root step
fn step_levels(
    steps: &[ExecutionStepSnap],
    graph: &DiGraph<usize, ()>,
    nodes: &[NodeIndex],
) -> Vec<Vec<String>> {
    let mut depth = vec![0usize; steps.len()];
    let mut remaining: Vec<usize> = nodes
        .iter()
        .map(|&n| graph.neighbors_directed(n, Direction::Incoming).count())
        .collect();
    let mut ready: Vec<usize> = (0..steps.len()).filter(|&p| remaining[p] == 0).collect();

    while let Some(pos) = ready.pop() {
        for child in graph.neighbors_directed(nodes[pos], Direction::Outgoing) {
            let c = graph[child];
            depth[c] = depth[c].max(depth[pos] + 1);
            remaining[c] -= 1;
            if remaining[c] == 0 {
                ready.push(c);
            }
        }
    }

    let mut levels: BTreeMap<usize, Vec<String>> = BTreeMap::new();
    for (pos, step) in steps.iter().enumerate() {
        levels.entry(depth[pos]).or_default().push(step.key.clone());
    }
    levels
        .into_values()
        .map(|mut keys| {
            keys.sort();
            keys
        })
        .collect()
}
