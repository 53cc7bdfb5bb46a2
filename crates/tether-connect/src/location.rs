//! CodeLocation: a live connection to the definitions of one code location
//!
//! A code location is the only thing allowed to fetch snapshots. Each variant
//! keeps the last successful fetch in a [`SnapshotCache`]; a failed, timed
//! out or cancelled fetch never touches it.

use crate::grpc::GrpcServerCodeLocation;
use crate::in_process::InProcessCodeLocation;
use crate::managed::ManagedGrpcEnvCodeLocation;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tether_core::serdes::RepositorySnapshots;
use tether_core::snapshot::{
    ExternalJobSubsetResult, ExternalPartitionConfigData, ExternalPartitionTagsData,
    ExternalRepositoryData, PartitionSetSnap, SerializableErrorInfo,
};
use tether_core::{
    CodeLocationOrigin, EntityKind, Error, ExternalExecutionPlan, ExternalJob, ExternalRepository,
    JobHandle, RepositoryHandle, Result, RunConfig,
};
use tracing::debug;

/// Repositories of one location, by name, from a single fetch
pub type Repositories = BTreeMap<String, Arc<ExternalRepository>>;

/// Definitions targets available to in-process locations, by name
pub type DefinitionTargets = HashMap<String, Arc<dyn DefinitionsProvider>>;

/// Caller-supplied timeouts for every blocking operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeLocationConfig {
    /// Dialing a server, including the handshake
    pub connect_timeout: Duration,

    /// Any single snapshot or plan request
    pub request_timeout: Duration,

    pub heartbeat_timeout: Duration,

    /// How long a spawned worker has to start answering
    pub startup_timeout: Duration,
}

impl Default for CodeLocationConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(60),
            heartbeat_timeout: Duration::from_secs(5),
            startup_timeout: Duration::from_secs(60),
        }
    }
}

/// User definitions loaded inside the current process
///
/// Calls run on the blocking thread pool. An `Err` is a failure in user code
/// and is surfaced as [`Error::UserCode`], as is a panic.
pub trait DefinitionsProvider: Send + Sync + 'static {
    fn load_repositories(&self) -> std::result::Result<Vec<ExternalRepositoryData>, SerializableErrorInfo>;

    /// Keys of a dynamic partitions definition; none by default
    fn dynamic_partition_names(
        &self,
        _partitions_def_name: &str,
    ) -> std::result::Result<Vec<String>, SerializableErrorInfo> {
        Ok(Vec::new())
    }

    /// Run config for one partition of a set; `{}` by default
    fn partition_config(
        &self,
        _partition_set: &PartitionSetSnap,
        _partition_name: &str,
    ) -> std::result::Result<Value, SerializableErrorInfo> {
        Ok(Value::Object(Default::default()))
    }

    /// Extra run tags for one partition of a set; none by default
    fn partition_tags(
        &self,
        _partition_set: &PartitionSetSnap,
        _partition_name: &str,
    ) -> std::result::Result<BTreeMap<String, String>, SerializableErrorInfo> {
        Ok(BTreeMap::new())
    }
}

/// A connection to one code location
#[async_trait]
pub trait CodeLocation: Send + Sync {
    fn origin(&self) -> &CodeLocationOrigin;

    fn name(&self) -> &str {
        self.origin().location_name()
    }

    /// Fetch every repository, replacing the cached snapshot on success
    async fn get_repositories(&self) -> Result<Arc<Repositories>>;

    /// Last successfully fetched repositories, if any
    fn cached_repositories(&self) -> Option<Arc<Repositories>>;

    /// Look up a repository, fetching once if nothing is cached yet
    async fn get_repository(&self, name: &str) -> Result<Arc<ExternalRepository>> {
        let repositories = match self.cached_repositories() {
            Some(cached) => cached,
            None => self.get_repositories().await?,
        };
        repositories
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(EntityKind::Repository, name))
    }

    /// Have the worker build the execution plan for a job
    async fn get_execution_plan(
        &self,
        job_handle: &JobHandle,
        run_config: &RunConfig,
        step_keys_to_execute: Option<&[String]>,
    ) -> Result<ExternalExecutionPlan>;

    /// Have the worker cut an op selection out of a job
    ///
    /// The subset keeps the job's handle and identifies with the full job.
    /// A selection the job cannot satisfy fails with [`Error::UserCode`].
    async fn get_subset_job(
        &self,
        job_handle: &JobHandle,
        op_selection: &[String],
    ) -> Result<Arc<ExternalJob>>;

    async fn get_partition_names(
        &self,
        repository_handle: &RepositoryHandle,
        partition_set_name: &str,
    ) -> Result<Vec<String>>;

    /// Run config the worker produces for one partition
    async fn get_partition_config(
        &self,
        repository_handle: &RepositoryHandle,
        partition_set_name: &str,
        partition_name: &str,
    ) -> Result<ExternalPartitionConfigData>;

    /// Run tags the worker produces for one partition
    async fn get_partition_tags(
        &self,
        repository_handle: &RepositoryHandle,
        partition_set_name: &str,
        partition_name: &str,
    ) -> Result<ExternalPartitionTagsData>;

    async fn heartbeat(&self) -> Result<()>;

    async fn is_reachable(&self) -> bool {
        self.heartbeat().await.is_ok()
    }

    /// Identity of the serving process; changes when it restarts
    fn server_id(&self) -> Option<String>;

    /// Release the connection, stopping the worker where this location owns it
    async fn shutdown(&self) -> Result<()>;
}

/// Connect to the location an origin describes
///
/// Fails immediately on the first error; retrying is up to the caller.
pub async fn connect(
    origin: &CodeLocationOrigin,
    config: &CodeLocationConfig,
    targets: &DefinitionTargets,
) -> Result<Arc<dyn CodeLocation>> {
    debug!("Connecting to code location {}", origin.location_name());
    let location: Arc<dyn CodeLocation> = match origin {
        CodeLocationOrigin::InProcess(o) => {
            let provider = targets
                .get(&o.target)
                .cloned()
                .ok_or_else(|| Error::not_found(EntityKind::CodeLocation, &o.target))?;
            Arc::new(InProcessCodeLocation::new(origin.clone(), *config, provider))
        }
        CodeLocationOrigin::GrpcServer(_) => {
            Arc::new(GrpcServerCodeLocation::connect(origin.clone(), *config).await?)
        }
        CodeLocationOrigin::ManagedGrpcEnv(_) => {
            Arc::new(ManagedGrpcEnvCodeLocation::start(origin.clone(), *config).await?)
        }
    };
    Ok(location)
}

/// Last good snapshot of a location
///
/// Replaced wholesale, so a reader sees either the old tree or the new one.
/// Each fetch takes a generation from [`SnapshotCache::begin_fetch`] before it
/// sends its request; a fetch that finishes after a later one was installed
/// is dropped, so overlapping fetches never roll the cache back.
#[derive(Debug, Default)]
pub struct SnapshotCache {
    last_generation: AtomicU64,
    current: RwLock<Installed>,
}

#[derive(Debug, Default)]
struct Installed {
    generation: u64,
    repositories: Option<Arc<Repositories>>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Arc<Repositories>> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .repositories
            .clone()
    }

    /// Generation for a fetch about to be sent
    pub fn begin_fetch(&self) -> u64 {
        self.last_generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Wrap a complete fetch and make it current
    ///
    /// Returns what is current afterwards: the fetched tree, or the newer
    /// one already installed by a fetch that began later.
    pub fn replace(
        &self,
        generation: u64,
        snapshots: RepositorySnapshots,
        origin: &CodeLocationOrigin,
    ) -> Arc<Repositories> {
        let repositories: Repositories = snapshots
            .into_iter()
            .map(|(name, data)| {
                let repo = ExternalRepository::from_location(Arc::new(data), origin.clone());
                (name, Arc::new(repo))
            })
            .collect();
        let repositories = Arc::new(repositories);

        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        if current.generation > generation {
            debug!(
                "Dropping fetch {} for {}, fetch {} is newer",
                generation,
                origin.location_name(),
                current.generation
            );
            return current.repositories.clone().unwrap_or(repositories);
        }
        *current = Installed {
            generation,
            repositories: Some(repositories.clone()),
        };
        repositories
    }

    /// Forget the snapshot; fetches already in flight will not restore it
    pub fn clear(&self) {
        let generation = self.begin_fetch();
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Installed {
            generation,
            repositories: None,
        };
    }
}

/// Wrap a subset answer as a job of the repository it was cut from
pub(crate) fn wrap_subset(
    repository: &ExternalRepository,
    result: ExternalJobSubsetResult,
) -> Result<Arc<ExternalJob>> {
    let data = result.into_job_data()?;
    Ok(Arc::new(repository.wrap_job(&data)))
}

/// Await `fut`, failing with a timeout error once `after` elapses
pub(crate) async fn with_timeout<T, F>(
    location: &str,
    operation: &str,
    after: Duration,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout(location, operation, after)),
    }
}

/// Check that a handle addresses the given location
pub(crate) fn check_origin(origin: &CodeLocationOrigin, handle: &RepositoryHandle) -> Result<()> {
    if &handle.code_location_origin != origin {
        return Err(Error::not_found(
            EntityKind::Repository,
            format!(
                "{} (handle points at location {})",
                handle.repository_name,
                handle.location_name()
            ),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::testing::etl_repository;
    use tether_core::InProcessOrigin;

    fn origin() -> CodeLocationOrigin {
        CodeLocationOrigin::InProcess(InProcessOrigin::named("defs", "defs"))
    }

    fn snapshots(names: &[&str]) -> RepositorySnapshots {
        names
            .iter()
            .map(|name| (name.to_string(), etl_repository(name)))
            .collect()
    }

    #[test]
    fn test_cache_replace_is_wholesale() {
        let cache = SnapshotCache::new();
        assert!(cache.get().is_none());

        let first = cache.replace(cache.begin_fetch(), snapshots(&["analytics"]), &origin());

        // A reader holding the old tree keeps it after replacement.
        let held = cache.get().unwrap();
        let second = cache.replace(
            cache.begin_fetch(),
            snapshots(&["analytics", "billing"]),
            &origin(),
        );

        assert!(Arc::ptr_eq(&held, &first));
        assert_eq!(held.len(), 1);
        assert_eq!(second.len(), 2);
        assert!(Arc::ptr_eq(&cache.get().unwrap(), &second));

        cache.clear();
        assert!(cache.get().is_none());
    }

    #[test]
    fn test_older_fetch_finishing_last_is_dropped() {
        let cache = SnapshotCache::new();
        let slow = cache.begin_fetch();
        let fast = cache.begin_fetch();

        let newer = cache.replace(fast, snapshots(&["new"]), &origin());
        let returned = cache.replace(slow, snapshots(&["old"]), &origin());

        assert!(Arc::ptr_eq(&returned, &newer));
        let current = cache.get().unwrap();
        assert_eq!(current.keys().collect::<Vec<_>>(), vec!["new"]);
    }

    #[test]
    fn test_fetch_in_flight_does_not_undo_clear() {
        let cache = SnapshotCache::new();
        let in_flight = cache.begin_fetch();
        cache.clear();

        let returned = cache.replace(in_flight, snapshots(&["analytics"]), &origin());
        assert_eq!(returned.len(), 1);
        assert!(cache.get().is_none());

        cache.replace(cache.begin_fetch(), snapshots(&["analytics"]), &origin());
        assert!(cache.get().is_some());
    }

    #[tokio::test]
    async fn test_with_timeout() {
        let err = with_timeout("defs", "fetch", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(err.is_timeout());

        let value = with_timeout("defs", "fetch", Duration::from_secs(1), async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_connect_unknown_target() {
        let err = connect(&origin(), &CodeLocationConfig::default(), &DefinitionTargets::new())
            .await
            .err()
            .unwrap();
        assert_eq!(err, Error::not_found(EntityKind::CodeLocation, "defs"));
    }

    #[test]
    fn test_check_origin() {
        let handle = RepositoryHandle::new("analytics", origin());
        assert!(check_origin(&origin(), &handle).is_ok());

        let other = CodeLocationOrigin::InProcess(InProcessOrigin::named("other", "other"));
        assert!(check_origin(&other, &handle).unwrap_err().is_not_found());
    }
}
