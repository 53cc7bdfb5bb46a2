//! Tether Connect: live connections to code locations
//!
//! A host never loads user definitions itself. It talks to a code location,
//! which fetches snapshots from wherever the definitions live and hands back
//! the host-side wrappers from `tether-core`.
//!
//! # Architecture
//!
//! - **CodeLocation**: the trait every connection implements
//! - **InProcessCodeLocation**: definitions provided by a [`DefinitionsProvider`] in this process
//! - **GrpcServerCodeLocation**: a code server reached over TCP or a Unix socket
//! - **ManagedGrpcEnvCodeLocation**: a code server process the host spawns and owns
//! - **CodeLocationRegistry**: named locations, connected lazily and reloadable
//! - **DefinitionsServer**: the worker side, serving a provider over gRPC
//!
//! # Example
//!
//! ```rust,no_run
//! use tether_connect::{connect, CodeLocationConfig, DefinitionTargets};
//! use tether_core::{CodeLocationOrigin, GrpcServerOrigin, RunConfig};
//!
//! async fn example() -> tether_core::Result<()> {
//!     let origin = CodeLocationOrigin::GrpcServer(GrpcServerOrigin::tcp("etl", "localhost", 4266));
//!     let location = connect(&origin, &CodeLocationConfig::default(), &DefinitionTargets::new()).await?;
//!
//!     let repo = location.get_repository("analytics").await?;
//!     let job = repo.get_job("etl_job")?;
//!     let plan = location.get_execution_plan(job.handle(), &RunConfig::empty(), None).await?;
//!     println!("{} steps", plan.steps().len());
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod grpc;
pub mod in_process;
pub mod location;
pub mod managed;
pub mod registry;
pub mod server;
pub mod wire;
mod worker;

pub use error::ConnectError;
pub use grpc::GrpcServerCodeLocation;
pub use in_process::InProcessCodeLocation;
pub use location::{
    connect, CodeLocation, CodeLocationConfig, DefinitionTargets, DefinitionsProvider,
    Repositories, SnapshotCache,
};
pub use managed::ManagedGrpcEnvCodeLocation;
pub use registry::{CodeLocationRegistry, LocationEntry, LocationStatus};
pub use server::DefinitionsServer;
pub use worker::{PARTITION_SET_TAG, PARTITION_TAG};
