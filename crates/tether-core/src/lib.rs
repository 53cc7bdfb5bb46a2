//! Tether Core: the host-side model of remote code locations
//!
//! Everything here is pure data and lookups; no I/O happens in this crate.
//!
//! # Architecture
//!
//! - **Origins**: serializable recipes for reaching a code location
//! - **Snapshots**: immutable, versioned trees describing repositories and jobs
//! - **Handles**: stable references that survive snapshot reloads
//! - **External wrappers**: query objects over a snapshot (`ExternalRepository`, `ExternalJob`)
//! - **RepresentedJob**: the read contract shared by live and historical jobs
//! - **ExternalExecutionPlan**: structural step graph derived from a job
//! - **Subsets**: op selections cut from a job, keeping the full job as parent
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use tether_core::origin::{CodeLocationOrigin, InProcessOrigin};
//! use tether_core::{ExternalExecutionPlan, ExternalRepository, RunConfig};
//!
//! let data = tether_core::testing::etl_repository("analytics");
//! let origin = CodeLocationOrigin::InProcess(InProcessOrigin::new("defs"));
//! let repo = ExternalRepository::from_location(Arc::new(data), origin);
//!
//! let job = repo.get_job("etl_job").unwrap();
//! let plan = ExternalExecutionPlan::build(job.as_ref(), &RunConfig::empty(), None).unwrap();
//! assert_eq!(plan.steps().len(), 3);
//! ```

pub mod error;
pub mod external;
pub mod handle;
pub mod historical;
pub mod job_index;
pub mod origin;
pub mod plan;
pub mod represented;
pub mod run_config;
pub mod serdes;
pub mod snapshot;
pub mod subset;
pub mod testing;

pub use error::{
    ConfigViolation, ConnectionError, ConnectionErrorKind, DefinitionError, DeserializationError,
    EntityKind, Error, Result,
};
pub use external::{ExternalJob, ExternalPartitionSet, ExternalRepository, ExternalSchedule, ExternalSensor};
pub use handle::{JobHandle, JobSelector, RepositoryHandle};
pub use historical::{HistoricalJob, HistoricalJobSnapshot, InMemoryRunSnapshotStore, RunSnapshotStore};
pub use job_index::JobIndex;
pub use origin::{
    CodeLocationOrigin, GrpcServerOrigin, InProcessOrigin, ManagedGrpcEnvOrigin,
    RemoteInstigatorOrigin, RemoteJobOrigin, RemoteRepositoryOrigin,
};
pub use plan::ExternalExecutionPlan;
pub use represented::{GraphStructure, RepresentedJob};
pub use run_config::{FieldResolver, PassthroughResolver, ResolutionContext, ResolutionError, RunConfig};
pub use serdes::{RepositorySnapshots, SNAPSHOT_SCHEMA_VERSION};
pub use subset::subset_job;
