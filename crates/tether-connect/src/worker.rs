//! Worker-side resolution of definitions
//!
//! Answers the questions a code server answers (repositories, plans,
//! subsets, partitions) directly from a [`DefinitionsProvider`]. Used by the
//! in-process location and by [`crate::server::DefinitionsServer`].

use crate::location::DefinitionsProvider;
use std::any::Any;
use std::sync::Arc;
use tether_core::serdes::RepositorySnapshots;
use tether_core::snapshot::{
    ExecutionPlanSnapshot, ExternalJobSubsetResult, ExternalPartitionConfigData,
    ExternalPartitionTagsData, PartitionSetSnap, PartitionsSnap, SerializableErrorInfo,
};
use tether_core::{
    subset_job, CodeLocationOrigin, EntityKind, Error, ExternalExecutionPlan, ExternalRepository,
    Result, RunConfig,
};
use tracing::debug;

/// Run tag naming the partition a run targets
pub const PARTITION_TAG: &str = "tether/partition";

/// Run tag naming the partition set a run's partition belongs to
pub const PARTITION_SET_TAG: &str = "tether/partition_set";

#[derive(Clone)]
pub(crate) struct Worker {
    origin: CodeLocationOrigin,
    provider: Arc<dyn DefinitionsProvider>,
}

impl Worker {
    pub(crate) fn new(origin: CodeLocationOrigin, provider: Arc<dyn DefinitionsProvider>) -> Self {
        Self { origin, provider }
    }

    /// Load every repository the provider defines
    pub(crate) fn repositories(&self) -> Result<RepositorySnapshots> {
        let loaded = self.provider.load_repositories().map_err(Error::UserCode)?;
        let mut snapshots = RepositorySnapshots::new();
        for data in loaded {
            if snapshots.contains_key(&data.name) {
                return Err(Error::UserCode(SerializableErrorInfo::new(format!(
                    "repository {} is defined more than once",
                    data.name
                ))));
            }
            snapshots.insert(data.name.clone(), data);
        }
        debug!(
            "Loaded {} repositories for {}",
            snapshots.len(),
            self.origin.location_name()
        );
        Ok(snapshots)
    }

    /// Build a plan against freshly loaded definitions
    pub(crate) fn execution_plan(
        &self,
        repository_name: &str,
        job_name: &str,
        run_config: &RunConfig,
        step_keys_to_execute: Option<&[String]>,
    ) -> Result<ExecutionPlanSnapshot> {
        let repository = self.repository(repository_name)?;
        let job = repository.get_job(job_name)?;
        let plan = ExternalExecutionPlan::build(job.as_ref(), run_config, step_keys_to_execute)?;
        Ok(plan.into_snapshot())
    }

    /// Cut an op selection out of a job
    ///
    /// Unknown repositories and jobs fail outright; a selection the job
    /// cannot satisfy fails inside the result.
    pub(crate) fn job_subset(
        &self,
        repository_name: &str,
        job_name: &str,
        op_selection: &[String],
    ) -> Result<ExternalJobSubsetResult> {
        let repository = self.repository(repository_name)?;
        let data = repository
            .data()
            .jobs
            .iter()
            .find(|job| job.name == job_name)
            .ok_or_else(|| Error::not_found(EntityKind::Job, job_name))?;
        Ok(subset_job(data, op_selection))
    }

    pub(crate) fn partition_names(
        &self,
        repository_name: &str,
        partition_set_name: &str,
    ) -> Result<Vec<String>> {
        let repository = self.repository(repository_name)?;
        let partition_set = repository.get_partition_set(partition_set_name)?;
        self.names_of(partition_set.data())
    }

    pub(crate) fn partition_config(
        &self,
        repository_name: &str,
        partition_set_name: &str,
        partition_name: &str,
    ) -> Result<ExternalPartitionConfigData> {
        let partition_set = self.partition(repository_name, partition_set_name, partition_name)?;
        let run_config = self
            .provider
            .partition_config(&partition_set, partition_name)
            .map_err(Error::UserCode)?;
        Ok(ExternalPartitionConfigData {
            name: partition_name.to_string(),
            run_config,
        })
    }

    /// Provider tags plus the partition tags every partitioned run carries
    pub(crate) fn partition_tags(
        &self,
        repository_name: &str,
        partition_set_name: &str,
        partition_name: &str,
    ) -> Result<ExternalPartitionTagsData> {
        let partition_set = self.partition(repository_name, partition_set_name, partition_name)?;
        let mut tags = self
            .provider
            .partition_tags(&partition_set, partition_name)
            .map_err(Error::UserCode)?;
        tags.insert(PARTITION_TAG.to_string(), partition_name.to_string());
        tags.insert(PARTITION_SET_TAG.to_string(), partition_set.name.clone());
        Ok(ExternalPartitionTagsData {
            name: partition_name.to_string(),
            tags,
        })
    }

    fn names_of(&self, partition_set: &PartitionSetSnap) -> Result<Vec<String>> {
        match &partition_set.partitions {
            PartitionsSnap::Static { partition_keys } => Ok(partition_keys.clone()),
            PartitionsSnap::Dynamic { name } => self
                .provider
                .dynamic_partition_names(name)
                .map_err(Error::UserCode),
        }
    }

    /// The partition set holding `partition_name`
    fn partition(
        &self,
        repository_name: &str,
        partition_set_name: &str,
        partition_name: &str,
    ) -> Result<PartitionSetSnap> {
        let repository = self.repository(repository_name)?;
        let partition_set = repository.get_partition_set(partition_set_name)?;
        if !self
            .names_of(partition_set.data())?
            .iter()
            .any(|name| name == partition_name)
        {
            return Err(Error::not_found(
                EntityKind::Partition,
                format!("{} in {}", partition_name, partition_set_name),
            ));
        }
        Ok(partition_set.data().clone())
    }

    fn repository(&self, name: &str) -> Result<ExternalRepository> {
        let mut snapshots = self.repositories()?;
        let data = snapshots
            .remove(name)
            .ok_or_else(|| Error::not_found(EntityKind::Repository, name))?;
        Ok(ExternalRepository::from_location(
            Arc::new(data),
            self.origin.clone(),
        ))
    }
}

/// Describe a provider panic as a user code failure
pub(crate) fn panic_info(payload: Box<dyn Any + Send>, context: String) -> SerializableErrorInfo {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "provider panicked".to_string());

    let mut info = SerializableErrorInfo::new(message);
    info.cls_name = Some("panic".to_string());
    info.stack = vec![context];
    info
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::snapshot::ExternalRepositoryData;
    use tether_core::testing::etl_repository;
    use tether_core::InProcessOrigin;

    struct Fixed(Vec<ExternalRepositoryData>);

    impl DefinitionsProvider for Fixed {
        fn load_repositories(
            &self,
        ) -> std::result::Result<Vec<ExternalRepositoryData>, SerializableErrorInfo> {
            Ok(self.0.clone())
        }

        fn dynamic_partition_names(
            &self,
            name: &str,
        ) -> std::result::Result<Vec<String>, SerializableErrorInfo> {
            Ok(vec![format!("{}-a", name), format!("{}-b", name)])
        }

        fn partition_config(
            &self,
            _partition_set: &PartitionSetSnap,
            partition_name: &str,
        ) -> std::result::Result<serde_json::Value, SerializableErrorInfo> {
            Ok(serde_json::json!({
                "ops": { "extract": { "config": { "date": partition_name } } }
            }))
        }

        fn partition_tags(
            &self,
            _partition_set: &PartitionSetSnap,
            _partition_name: &str,
        ) -> std::result::Result<std::collections::BTreeMap<String, String>, SerializableErrorInfo>
        {
            let mut tags = std::collections::BTreeMap::new();
            tags.insert("team".to_string(), "data".to_string());
            tags.insert(PARTITION_TAG.to_string(), "overridden".to_string());
            Ok(tags)
        }
    }

    fn worker(repos: Vec<ExternalRepositoryData>) -> Worker {
        Worker::new(
            CodeLocationOrigin::InProcess(InProcessOrigin::named("defs", "defs")),
            Arc::new(Fixed(repos)),
        )
    }

    #[test]
    fn test_plan_from_provider() {
        let worker = worker(vec![etl_repository("analytics")]);
        let plan = worker
            .execution_plan("analytics", "etl_job", &RunConfig::empty(), None)
            .unwrap();
        assert_eq!(plan.steps.len(), 3);
        assert_eq!(plan.job_name, "etl_job");

        let err = worker
            .execution_plan("analytics", "missing_job", &RunConfig::empty(), None)
            .unwrap_err();
        assert_eq!(err, Error::not_found(EntityKind::Job, "missing_job"));
    }

    #[test]
    fn test_partition_names() {
        let mut repo = etl_repository("analytics");
        repo.partition_sets.push(PartitionSetSnap {
            name: "by_customer".to_string(),
            job_name: "etl_job".to_string(),
            mode: "default".to_string(),
            partitions: PartitionsSnap::Dynamic {
                name: "customers".to_string(),
            },
        });
        let worker = worker(vec![repo]);

        assert_eq!(
            worker
                .partition_names("analytics", "etl_job_partition_set")
                .unwrap(),
            vec!["2024-01-01", "2024-01-02"]
        );
        assert_eq!(
            worker.partition_names("analytics", "by_customer").unwrap(),
            vec!["customers-a", "customers-b"]
        );
        assert!(worker
            .partition_names("analytics", "nope")
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_job_subset() {
        let worker = worker(vec![etl_repository("analytics")]);
        let result = worker
            .job_subset("analytics", "etl_job", &["extract".to_string()])
            .unwrap();
        let data = result.into_job_data().unwrap();
        assert_eq!(data.job_snapshot.ops.len(), 1);
        assert_eq!(data.parent_job_snapshot.unwrap().ops.len(), 3);

        let result = worker
            .job_subset("analytics", "etl_job", &["publish".to_string()])
            .unwrap();
        assert!(!result.success);

        let err = worker
            .job_subset("analytics", "missing_job", &["extract".to_string()])
            .unwrap_err();
        assert_eq!(err, Error::not_found(EntityKind::Job, "missing_job"));
    }

    #[test]
    fn test_partition_config_and_tags() {
        let worker = worker(vec![etl_repository("analytics")]);

        let config = worker
            .partition_config("analytics", "etl_job_partition_set", "2024-01-02")
            .unwrap();
        assert_eq!(config.name, "2024-01-02");
        assert_eq!(config.run_config["ops"]["extract"]["config"]["date"], "2024-01-02");

        let tags = worker
            .partition_tags("analytics", "etl_job_partition_set", "2024-01-02")
            .unwrap();
        assert_eq!(tags.tags[PARTITION_TAG], "2024-01-02");
        assert_eq!(tags.tags[PARTITION_SET_TAG], "etl_job_partition_set");
        assert_eq!(tags.tags["team"], "data");

        let err = worker
            .partition_config("analytics", "etl_job_partition_set", "1999-12-31")
            .unwrap_err();
        assert!(matches!(
            err,
            Error::NotFound {
                kind: EntityKind::Partition,
                ..
            }
        ));
        assert!(worker
            .partition_tags("analytics", "weekly", "2024-01-02")
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_duplicate_repository_is_user_error() {
        let worker = worker(vec![etl_repository("analytics"), etl_repository("analytics")]);
        assert!(matches!(worker.repositories(), Err(Error::UserCode(_))));
    }

    #[test]
    fn test_panic_info_message() {
        let info = panic_info(Box::new("boom"), "while loading".to_string());
        assert_eq!(info.message, "boom");
        let info = panic_info(Box::new(String::from("owned boom")), String::new());
        assert_eq!(info.message, "owned boom");
        let info = panic_info(Box::new(42), String::new());
        assert_eq!(info.message, "provider panicked");
    }
}
