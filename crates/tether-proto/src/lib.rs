/// Generated gRPC protocol definitions for the tether CodeServer service.
///
/// A host talks to a code server (the worker process that loads user
/// definitions) through the unary RPCs in `proto/tether/v1/code_server.proto`.
/// Every snapshot-carrying reply is a [`SnapshotReply`] whose
/// `schema_version` the host checks before it reads the payload.
pub mod tether {
    pub mod v1 {
        tonic::include_proto!("tether.v1");

        /// Bumped whenever the set of RPCs or their messages change incompatibly
        pub const PROTOCOL_VERSION: u32 = 1;
    }
}

// Re-export commonly used types for convenience
pub use tether::v1::*;

#[cfg(test)]
mod tests {
    use super::code_server_client::CodeServerClient;
    use super::code_server_server::{CodeServer, CodeServerServer};
    use super::*;
    use prost::Message;
    use tokio_stream::wrappers::TcpListenerStream;
    use tonic::transport::{Channel, Server};
    use tonic::{Request, Response, Status};

    /// Answers with canned replies derived from the request
    struct EchoServer;

    fn payload_reply(payload: String) -> Result<Response<SnapshotReply>, Status> {
        Ok(Response::new(SnapshotReply {
            schema_version: 1,
            serialized_payload: payload,
            ..SnapshotReply::default()
        }))
    }

    #[tonic::async_trait]
    impl CodeServer for EchoServer {
        async fn ping(&self, request: Request<PingRequest>) -> Result<Response<PingReply>, Status> {
            Ok(Response::new(PingReply {
                echo: request.into_inner().echo,
                server_id: "echo-1".to_string(),
            }))
        }

        async fn get_server_info(
            &self,
            _request: Request<GetServerInfoRequest>,
        ) -> Result<Response<ServerInfoReply>, Status> {
            Ok(Response::new(ServerInfoReply {
                server_id: "echo-1".to_string(),
                protocol_version: PROTOCOL_VERSION,
                max_schema_version: 1,
                server_version: "test".to_string(),
            }))
        }

        async fn heartbeat(
            &self,
            _request: Request<HeartbeatRequest>,
        ) -> Result<Response<HeartbeatReply>, Status> {
            Ok(Response::new(HeartbeatReply {
                server_id: "echo-1".to_string(),
            }))
        }

        async fn get_repositories(
            &self,
            _request: Request<GetRepositoriesRequest>,
        ) -> Result<Response<SnapshotReply>, Status> {
            payload_reply("{}".to_string())
        }

        async fn get_execution_plan(
            &self,
            request: Request<GetExecutionPlanRequest>,
        ) -> Result<Response<SnapshotReply>, Status> {
            payload_reply(request.into_inner().step_keys_to_execute.join(","))
        }

        async fn get_job_subset(
            &self,
            request: Request<GetJobSubsetRequest>,
        ) -> Result<Response<SnapshotReply>, Status> {
            let req = request.into_inner();
            payload_reply(format!("{}[{}]", req.job_name, req.op_selection.join(",")))
        }

        async fn get_partition_names(
            &self,
            _request: Request<GetPartitionNamesRequest>,
        ) -> Result<Response<SnapshotReply>, Status> {
            Err(Status::not_found("no partition sets"))
        }

        async fn get_partition_config(
            &self,
            request: Request<GetPartitionRequest>,
        ) -> Result<Response<SnapshotReply>, Status> {
            payload_reply(request.into_inner().partition_name)
        }

        async fn get_partition_tags(
            &self,
            request: Request<GetPartitionRequest>,
        ) -> Result<Response<SnapshotReply>, Status> {
            payload_reply(request.into_inner().partition_set_name)
        }

        async fn shutdown(
            &self,
            _request: Request<ShutdownRequest>,
        ) -> Result<Response<ShutdownReply>, Status> {
            Ok(Response::new(ShutdownReply {
                accepted: true,
                serialized_error: String::new(),
            }))
        }
    }

    async fn spawn_echo_server() -> Channel {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            Server::builder()
                .add_service(CodeServerServer::new(EchoServer))
                .serve_with_incoming(TcpListenerStream::new(listener))
                .await
                .unwrap();
        });
        Channel::from_shared(format!("http://{}", addr))
            .unwrap()
            .connect()
            .await
            .unwrap()
    }

    #[test]
    fn test_message_wire_format() {
        let reply = SnapshotReply {
            schema_version: 2,
            serialized_payload: "payload".to_string(),
            serialized_error: String::new(),
            serialized_definition_error: String::new(),
        };
        let bytes = reply.encode_to_vec();
        assert_eq!(SnapshotReply::decode(bytes.as_slice()).unwrap(), reply);

        // An empty message decodes to defaults.
        let empty = SnapshotReply::decode(&[][..]).unwrap();
        assert_eq!(empty.schema_version, 0);
        assert!(empty.serialized_error.is_empty());
        assert!(empty.serialized_definition_error.is_empty());
    }

    #[tokio::test]
    async fn test_unary_round_trip() {
        let mut client = CodeServerClient::new(spawn_echo_server().await);

        let reply = client
            .ping(PingRequest {
                echo: "hello".to_string(),
            })
            .await
            .unwrap()
            .into_inner();
        assert_eq!(reply.echo, "hello");
        assert_eq!(reply.server_id, "echo-1");

        let info = client
            .get_server_info(GetServerInfoRequest {})
            .await
            .unwrap()
            .into_inner();
        assert_eq!(info.protocol_version, PROTOCOL_VERSION);

        let plan = client
            .get_execution_plan(GetExecutionPlanRequest {
                repository_name: "repo".to_string(),
                job_name: "etl_job".to_string(),
                run_config_json: String::new(),
                step_keys_to_execute: vec!["extract".to_string(), "load".to_string()],
                select_steps: true,
            })
            .await
            .unwrap()
            .into_inner();
        assert_eq!(plan.serialized_payload, "extract,load");

        let subset = client
            .get_job_subset(GetJobSubsetRequest {
                repository_name: "repo".to_string(),
                job_name: "etl_job".to_string(),
                op_selection: vec!["extract".to_string()],
            })
            .await
            .unwrap()
            .into_inner();
        assert_eq!(subset.serialized_payload, "etl_job[extract]");

        let partition = GetPartitionRequest {
            repository_name: "repo".to_string(),
            partition_set_name: "daily".to_string(),
            partition_name: "2024-01-01".to_string(),
        };
        let config = client
            .get_partition_config(partition.clone())
            .await
            .unwrap()
            .into_inner();
        assert_eq!(config.serialized_payload, "2024-01-01");
        let tags = client
            .get_partition_tags(partition)
            .await
            .unwrap()
            .into_inner();
        assert_eq!(tags.serialized_payload, "daily");
    }

    #[tokio::test]
    async fn test_status_is_propagated() {
        let mut client = CodeServerClient::new(spawn_echo_server().await);
        let status = client
            .get_partition_names(GetPartitionNamesRequest::default())
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::NotFound);
    }
}
