/*!
 * A workspace: the code locations one configuration file describes
 *
 * Wraps a `CodeLocationRegistry` built from a `TetherConfig`. In-process
 * locations are backed by a `SnapshotFileProvider` registered under the
 * snapshot path, so the origin's target is the file it reads.
 */

use crate::config::{LocationConfig, TetherConfig};
use crate::error::Result;
use crate::output::LocationRow;
use crate::provider::{FileRunSnapshotStore, SnapshotFileProvider};
use std::sync::Arc;
use tether_connect::{CodeLocationRegistry, LocationStatus, Repositories};
use tether_core::{
    ExternalExecutionPlan, ExternalJob, HistoricalJob, HistoricalJobSnapshot, RepresentedJob,
    RunConfig, RunSnapshotStore,
};
use tracing::{debug, info};

pub struct Workspace {
    config: TetherConfig,
    registry: CodeLocationRegistry,
}

impl Workspace {
    /// Register every location in `config`; nothing is connected yet
    pub async fn from_config(config: TetherConfig) -> Self {
        let registry = CodeLocationRegistry::new(config.timeouts.to_location_config());

        for location in &config.locations {
            if let LocationConfig::InProcess { snapshot, .. } = location {
                registry
                    .register_target(
                        snapshot.to_string_lossy(),
                        Arc::new(SnapshotFileProvider::new(snapshot)),
                    )
                    .await;
            }
            debug!("Registering {} location {}", location.kind(), location.name());
            registry.register(location.to_origin()).await;
        }

        Self { config, registry }
    }

    pub fn config(&self) -> &TetherConfig {
        &self.config
    }

    pub fn registry(&self) -> &CodeLocationRegistry {
        &self.registry
    }

    /// Store named by `[history] dir`, if any
    pub fn run_store(&self) -> Option<FileRunSnapshotStore> {
        self.config.history.dir.as_ref().map(FileRunSnapshotStore::new)
    }

    /// Connect to every location and summarize it
    ///
    /// A location that fails shows up as a failed row; it does not stop the
    /// others from being listed.
    pub async fn location_rows(&self) -> Vec<LocationRow> {
        let mut rows = Vec::with_capacity(self.config.locations.len());

        for location in &self.config.locations {
            let name = location.name();
            let repositories = match self.repositories(name).await {
                Ok(repositories) => Some(repositories.len()),
                Err(_) => None,
            };

            let entry = self
                .registry
                .list_entries()
                .await
                .into_iter()
                .find(|(entry_name, _)| entry_name == name)
                .map(|(_, entry)| entry);

            rows.push(LocationRow {
                name: name.to_string(),
                kind: location.kind(),
                status: entry
                    .as_ref()
                    .map(|e| e.status)
                    .unwrap_or(LocationStatus::Registered),
                server_id: entry.as_ref().and_then(|e| e.server_id.clone()),
                repositories,
                error: entry.and_then(|e| e.last_error),
            });
        }
        rows
    }

    /// Fetch the repositories of one location
    pub async fn repositories(&self, location: &str) -> Result<Arc<Repositories>> {
        let location = self.registry.get_location(location).await?;
        Ok(location.get_repositories().await?)
    }

    /// Look up a job on a connected location
    pub async fn job(
        &self,
        location: &str,
        repository: &str,
        job: &str,
    ) -> Result<Arc<ExternalJob>> {
        let location = self.registry.get_location(location).await?;
        let repository = location.get_repository(repository).await?;
        Ok(repository.get_job(job)?)
    }

    /// Have a location build the execution plan for a job
    pub async fn plan(
        &self,
        job: &ExternalJob,
        run_config: &RunConfig,
        step_keys_to_execute: Option<&[String]>,
    ) -> Result<ExternalExecutionPlan> {
        let location = self.registry.get_location(job.location_name()).await?;
        let plan = location
            .get_execution_plan(job.handle(), run_config, step_keys_to_execute)
            .await?;
        info!(
            "Planned {} with {} steps",
            plan.job_name(),
            plan.steps().len()
        );
        Ok(plan)
    }

    pub async fn partition_names(
        &self,
        location: &str,
        repository: &str,
        partition_set: &str,
    ) -> Result<Vec<String>> {
        let location = self.registry.get_location(location).await?;
        let repository = location.get_repository(repository).await?;
        Ok(location
            .get_partition_names(repository.handle(), partition_set)
            .await?)
    }

    /// Store the job as it is now, keyed by `run_id`
    pub fn record_run(
        store: &dyn RunSnapshotStore,
        run_id: &str,
        job: &ExternalJob,
    ) -> Result<()> {
        let payload = HistoricalJobSnapshot::for_job(job).to_payload()?;
        store.put_snapshot(run_id, payload)?;
        info!("Recorded {} for run {}", job.name(), run_id);
        Ok(())
    }

    /// The job a past run was planned against
    pub fn history(store: &dyn RunSnapshotStore, run_id: &str) -> Result<HistoricalJob> {
        Ok(HistoricalJob::from_store(store, run_id)?)
    }

    /// Release every connection, stopping managed workers
    pub async fn shutdown(&self) {
        self.registry.disconnect_all().await;
    }
}
