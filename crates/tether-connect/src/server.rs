//! DefinitionsServer: serves a [`DefinitionsProvider`] over the CodeServer service
//!
//! This is the worker side of a gRPC code location. Provider calls run on the
//! blocking pool. A failure inside them, or a request naming something the
//! definitions lack, travels back to the host in the reply rather than as a
//! gRPC status.

use crate::location::DefinitionsProvider;
use crate::wire::{definition_error_reply, error_reply, snapshot_reply};
use crate::worker::{panic_info, Worker};
use std::sync::Arc;
use tether_core::serdes::{Snapshot, SNAPSHOT_SCHEMA_VERSION};
use tether_core::{
    CodeLocationOrigin, ConfigViolation, DefinitionError, Error, InProcessOrigin,
    Result as CoreResult, RunConfig,
};
use tether_proto::code_server_server::{CodeServer, CodeServerServer};
use tether_proto::{
    GetExecutionPlanRequest, GetJobSubsetRequest, GetPartitionNamesRequest, GetPartitionRequest,
    GetRepositoriesRequest, GetServerInfoRequest, HeartbeatReply, HeartbeatRequest, PingReply,
    PingRequest, ServerInfoReply, ShutdownReply, ShutdownRequest, SnapshotReply,
    PROTOCOL_VERSION,
};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

pub struct DefinitionsServer {
    worker: Worker,
    server_id: String,
    shutdown: Arc<Notify>,
}

impl DefinitionsServer {
    pub fn new<N: Into<String>>(location_name: N, provider: Arc<dyn DefinitionsProvider>) -> Self {
        let location_name = location_name.into();
        let origin = CodeLocationOrigin::InProcess(InProcessOrigin::named(
            location_name.clone(),
            location_name,
        ));
        Self {
            worker: Worker::new(origin, provider),
            server_id: uuid::Uuid::new_v4().to_string(),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Serve on `listener` until a client calls `Shutdown`
    pub async fn serve(self, listener: TcpListener) -> Result<(), tonic::transport::Error> {
        let shutdown = self.shutdown.clone();
        match listener.local_addr() {
            Ok(addr) => info!("Serving definitions on {} (server id {})", addr, self.server_id),
            Err(e) => warn!("Serving definitions on an unknown address: {}", e),
        }

        Server::builder()
            .add_service(CodeServerServer::new(self))
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                shutdown.notified().await;
            })
            .await
    }

    async fn run<T, F>(&self, f: F) -> Result<Response<SnapshotReply>, Status>
    where
        T: Snapshot + Send + 'static,
        F: FnOnce(&Worker) -> CoreResult<T> + Send + 'static,
    {
        let worker = self.worker.clone();
        let result = match tokio::task::spawn_blocking(move || f(&worker)).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(Error::UserCode(panic_info(
                e.into_panic(),
                format!("while serving {}", self.server_id),
            ))),
            Err(e) => return Err(Status::cancelled(e.to_string())),
        };

        let reply = match result {
            Ok(value) => snapshot_reply(&value),
            Err(Error::UserCode(info)) => error_reply(&info),
            Err(e) => match DefinitionError::from_error(&e) {
                Some(definition) => {
                    debug!("Answering with definition error: {}", e);
                    definition_error_reply(&definition)
                }
                None => return Err(Status::internal(e.to_string())),
            },
        };
        reply.map(Response::new).map_err(|e| Status::internal(e.to_string()))
    }
}

#[tonic::async_trait]
impl CodeServer for DefinitionsServer {
    async fn ping(&self, request: Request<PingRequest>) -> Result<Response<PingReply>, Status> {
        Ok(Response::new(PingReply {
            echo: request.into_inner().echo,
            server_id: self.server_id.clone(),
        }))
    }

    async fn get_server_info(
        &self,
        _request: Request<GetServerInfoRequest>,
    ) -> Result<Response<ServerInfoReply>, Status> {
        Ok(Response::new(ServerInfoReply {
            server_id: self.server_id.clone(),
            protocol_version: PROTOCOL_VERSION,
            max_schema_version: SNAPSHOT_SCHEMA_VERSION,
            server_version: env!("CARGO_PKG_VERSION").to_string(),
        }))
    }

    async fn heartbeat(
        &self,
        _request: Request<HeartbeatRequest>,
    ) -> Result<Response<HeartbeatReply>, Status> {
        Ok(Response::new(HeartbeatReply {
            server_id: self.server_id.clone(),
        }))
    }

    async fn get_repositories(
        &self,
        _request: Request<GetRepositoriesRequest>,
    ) -> Result<Response<SnapshotReply>, Status> {
        debug!("Serving repositories");
        self.run(|w| w.repositories()).await
    }

    async fn get_execution_plan(
        &self,
        request: Request<GetExecutionPlanRequest>,
    ) -> Result<Response<SnapshotReply>, Status> {
        let req = request.into_inner();
        let run_config = if req.run_config_json.is_empty() {
            RunConfig::empty()
        } else {
            match serde_json::from_str(&req.run_config_json) {
                Ok(value) => RunConfig::from_value(value),
                Err(e) => {
                    let err = DefinitionError::InvalidConfig {
                        job_name: req.job_name,
                        violations: vec![ConfigViolation::new(
                            "",
                            format!("run config is not JSON: {}", e),
                        )],
                    };
                    return definition_error_reply(&err)
                        .map(Response::new)
                        .map_err(|e| Status::internal(e.to_string()));
                }
            }
        };
        let step_keys = req.select_steps.then_some(req.step_keys_to_execute);

        debug!("Serving execution plan for {}", req.job_name);
        self.run(move |w| {
            w.execution_plan(
                &req.repository_name,
                &req.job_name,
                &run_config,
                step_keys.as_deref(),
            )
        })
        .await
    }

    async fn get_job_subset(
        &self,
        request: Request<GetJobSubsetRequest>,
    ) -> Result<Response<SnapshotReply>, Status> {
        let req = request.into_inner();
        debug!("Serving subset of {} ({:?})", req.job_name, req.op_selection);
        self.run(move |w| w.job_subset(&req.repository_name, &req.job_name, &req.op_selection))
            .await
    }

    async fn get_partition_names(
        &self,
        request: Request<GetPartitionNamesRequest>,
    ) -> Result<Response<SnapshotReply>, Status> {
        let req = request.into_inner();
        self.run(move |w| w.partition_names(&req.repository_name, &req.partition_set_name))
            .await
    }

    async fn get_partition_config(
        &self,
        request: Request<GetPartitionRequest>,
    ) -> Result<Response<SnapshotReply>, Status> {
        let req = request.into_inner();
        self.run(move |w| {
            w.partition_config(
                &req.repository_name,
                &req.partition_set_name,
                &req.partition_name,
            )
        })
        .await
    }

    async fn get_partition_tags(
        &self,
        request: Request<GetPartitionRequest>,
    ) -> Result<Response<SnapshotReply>, Status> {
        let req = request.into_inner();
        self.run(move |w| {
            w.partition_tags(
                &req.repository_name,
                &req.partition_set_name,
                &req.partition_name,
            )
        })
        .await
    }

    async fn shutdown(
        &self,
        _request: Request<ShutdownRequest>,
    ) -> Result<Response<ShutdownReply>, Status> {
        info!("Shutdown requested for server {}", self.server_id);
        self.shutdown.notify_one();
        Ok(Response::new(ShutdownReply {
            accepted: true,
            serialized_error: String::new(),
        }))
    }
}
