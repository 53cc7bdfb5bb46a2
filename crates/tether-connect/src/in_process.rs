//! InProcessCodeLocation: definitions loaded inside the host process

use crate::location::{
    check_origin, wrap_subset, CodeLocation, CodeLocationConfig, DefinitionsProvider,
    Repositories, SnapshotCache,
};
use crate::worker::{panic_info, Worker};
use async_trait::async_trait;
use std::sync::Arc;
use tether_core::snapshot::{ExternalPartitionConfigData, ExternalPartitionTagsData};
use tether_core::{
    CodeLocationOrigin, Error, ExternalExecutionPlan, ExternalJob, JobHandle, RepositoryHandle,
    Result, RunConfig,
};
use tokio::task::JoinError;
use tracing::{debug, info, warn};

/// Code location backed by a [`DefinitionsProvider`] in this process
///
/// Provider calls run on the blocking pool under the request timeout. A call
/// that times out keeps running in the background, but its result is dropped
/// and the cached snapshot is left as it was.
pub struct InProcessCodeLocation {
    origin: CodeLocationOrigin,
    config: CodeLocationConfig,
    worker: Worker,
    server_id: String,
    cache: SnapshotCache,
}

impl InProcessCodeLocation {
    pub fn new(
        origin: CodeLocationOrigin,
        config: CodeLocationConfig,
        provider: Arc<dyn DefinitionsProvider>,
    ) -> Self {
        info!("Loading in-process code location {}", origin.location_name());
        Self {
            worker: Worker::new(origin.clone(), provider),
            origin,
            config,
            server_id: uuid::Uuid::new_v4().to_string(),
            cache: SnapshotCache::new(),
        }
    }

    async fn run<T, F>(&self, operation: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Worker) -> Result<T> + Send + 'static,
    {
        let worker = self.worker.clone();
        let task = tokio::task::spawn_blocking(move || f(&worker));

        match tokio::time::timeout(self.config.request_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(join_error(self.name(), operation, e)),
            Err(_) => {
                warn!(
                    "{} on {} timed out after {:?}",
                    operation,
                    self.name(),
                    self.config.request_timeout
                );
                Err(Error::timeout(
                    self.name(),
                    operation,
                    self.config.request_timeout,
                ))
            }
        }
    }
}

/// A panicking provider is a user code failure like any other
fn join_error(location: &str, operation: &str, err: JoinError) -> Error {
    if !err.is_panic() {
        return Error::fetch(location, format!("{} was cancelled", operation));
    }
    let context = format!("while running {} for {}", operation, location);
    Error::UserCode(panic_info(err.into_panic(), context))
}

#[async_trait]
impl CodeLocation for InProcessCodeLocation {
    fn origin(&self) -> &CodeLocationOrigin {
        &self.origin
    }

    async fn get_repositories(&self) -> Result<Arc<Repositories>> {
        let generation = self.cache.begin_fetch();
        let snapshots = self.run("get_repositories", |w| w.repositories()).await?;
        debug!("Fetched {} repositories from {}", snapshots.len(), self.name());
        Ok(self.cache.replace(generation, snapshots, &self.origin))
    }

    fn cached_repositories(&self) -> Option<Arc<Repositories>> {
        self.cache.get()
    }

    async fn get_execution_plan(
        &self,
        job_handle: &JobHandle,
        run_config: &RunConfig,
        step_keys_to_execute: Option<&[String]>,
    ) -> Result<ExternalExecutionPlan> {
        check_origin(&self.origin, &job_handle.repository_handle)?;
        let repository_name = job_handle.repository_name().to_string();
        let job_name = job_handle.job_name.clone();
        let run_config = run_config.clone();
        let step_keys = step_keys_to_execute.map(<[String]>::to_vec);

        let snapshot = self
            .run("get_execution_plan", move |w| {
                w.execution_plan(&repository_name, &job_name, &run_config, step_keys.as_deref())
            })
            .await?;
        ExternalExecutionPlan::from_snapshot(snapshot)
    }

    async fn get_subset_job(
        &self,
        job_handle: &JobHandle,
        op_selection: &[String],
    ) -> Result<Arc<ExternalJob>> {
        check_origin(&self.origin, &job_handle.repository_handle)?;
        let repository = self.get_repository(job_handle.repository_name()).await?;
        let repository_name = job_handle.repository_name().to_string();
        let job_name = job_handle.job_name.clone();
        let op_selection = op_selection.to_vec();

        let result = self
            .run("get_subset_job", move |w| {
                w.job_subset(&repository_name, &job_name, &op_selection)
            })
            .await?;
        wrap_subset(&repository, result)
    }

    async fn get_partition_names(
        &self,
        repository_handle: &RepositoryHandle,
        partition_set_name: &str,
    ) -> Result<Vec<String>> {
        check_origin(&self.origin, repository_handle)?;
        let repository_name = repository_handle.repository_name.clone();
        let partition_set_name = partition_set_name.to_string();
        self.run("get_partition_names", move |w| {
            w.partition_names(&repository_name, &partition_set_name)
        })
        .await
    }

    async fn get_partition_config(
        &self,
        repository_handle: &RepositoryHandle,
        partition_set_name: &str,
        partition_name: &str,
    ) -> Result<ExternalPartitionConfigData> {
        check_origin(&self.origin, repository_handle)?;
        let repository_name = repository_handle.repository_name.clone();
        let partition_set_name = partition_set_name.to_string();
        let partition_name = partition_name.to_string();
        self.run("get_partition_config", move |w| {
            w.partition_config(&repository_name, &partition_set_name, &partition_name)
        })
        .await
    }

    async fn get_partition_tags(
        &self,
        repository_handle: &RepositoryHandle,
        partition_set_name: &str,
        partition_name: &str,
    ) -> Result<ExternalPartitionTagsData> {
        check_origin(&self.origin, repository_handle)?;
        let repository_name = repository_handle.repository_name.clone();
        let partition_set_name = partition_set_name.to_string();
        let partition_name = partition_name.to_string();
        self.run("get_partition_tags", move |w| {
            w.partition_tags(&repository_name, &partition_set_name, &partition_name)
        })
        .await
    }

    async fn heartbeat(&self) -> Result<()> {
        Ok(())
    }

    fn server_id(&self) -> Option<String> {
        Some(self.server_id.clone())
    }

    async fn shutdown(&self) -> Result<()> {
        debug!("Releasing in-process code location {}", self.name());
        self.cache.clear();
        Ok(())
    }
}
