//! GrpcServerCodeLocation: a code server reached over gRPC
//!
//! One tonic channel per location. Requests on it are serialised through a
//! single mutex, so concurrent callers queue rather than race on the
//! transport. Every call runs under a caller-supplied timeout.

use crate::error::{from_status, ConnectError};
use crate::location::{
    check_origin, with_timeout, wrap_subset, CodeLocation, CodeLocationConfig, Repositories,
    SnapshotCache,
};
use crate::wire::decode_reply;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tether_core::origin::ConnectParams;
use tether_core::run_config::validate_run_config;
use tether_core::serdes::{RepositorySnapshots, MIN_SUPPORTED_SCHEMA_VERSION};
use tether_core::snapshot::{
    ExecutionPlanSnapshot, ExternalJobSubsetResult, ExternalPartitionConfigData,
    ExternalPartitionTagsData,
};
use tether_core::{
    CodeLocationOrigin, ConnectionErrorKind, Error, ExternalExecutionPlan, ExternalJob, JobHandle,
    RepositoryHandle, RepresentedJob, Result, RunConfig,
};
use tether_proto::code_server_client::CodeServerClient;
use tether_proto::{
    GetExecutionPlanRequest, GetJobSubsetRequest, GetPartitionNamesRequest, GetPartitionRequest,
    GetRepositoriesRequest, GetServerInfoRequest, HeartbeatRequest, ServerInfoReply,
    ShutdownRequest, PROTOCOL_VERSION,
};
use tokio::sync::Mutex;
use tonic::metadata::{AsciiMetadataKey, AsciiMetadataValue, MetadataMap};
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tonic::Code;
use tracing::{debug, info, warn};

/// Largest reply accepted from a code server
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

pub struct GrpcServerCodeLocation {
    origin: CodeLocationOrigin,
    config: CodeLocationConfig,
    client: Mutex<CodeServerClient<Channel>>,
    metadata: MetadataMap,
    server_info: RwLock<ServerInfoReply>,
    cache: SnapshotCache,
}

impl GrpcServerCodeLocation {
    /// Dial the server an origin points at and perform the handshake
    pub async fn connect(origin: CodeLocationOrigin, config: CodeLocationConfig) -> Result<Self> {
        let name = origin.location_name().to_string();
        let (channel, metadata) = match origin.connect_params() {
            ConnectParams::Tcp { uri, metadata } => (dial_tcp(&name, &uri, &config).await?, metadata),
            ConnectParams::UnixSocket { path, metadata } => {
                (dial_socket(&name, path, &config).await?, metadata)
            }
            other => {
                return Err(Error::connection(
                    name,
                    ConnectionErrorKind::Handshake,
                    format!("origin is not a gRPC server: {:?}", other),
                ))
            }
        };
        Self::from_channel(origin, config, channel, &metadata).await
    }

    /// Handshake over an established channel
    ///
    /// `origin` is what handles from this location will carry; it need not
    /// be the address the channel was dialed at.
    pub async fn from_channel(
        origin: CodeLocationOrigin,
        config: CodeLocationConfig,
        channel: Channel,
        metadata: &BTreeMap<String, String>,
    ) -> Result<Self> {
        let name = origin.location_name().to_string();
        let metadata = request_metadata(metadata).map_err(|e| e.at(&name))?;
        let mut client = CodeServerClient::new(channel).max_decoding_message_size(MAX_MESSAGE_SIZE);

        let info = with_timeout(&name, "handshake", config.connect_timeout, async {
            let mut request = tonic::Request::new(GetServerInfoRequest {});
            *request.metadata_mut() = metadata.clone();
            client
                .get_server_info(request)
                .await
                .map(|r| r.into_inner())
                .map_err(|status| handshake_error(&name, status))
        })
        .await?;
        check_server_info(&name, &info)?;

        info!(
            "Connected to code server {} (server id {}, version {})",
            name, info.server_id, info.server_version
        );

        Ok(Self {
            origin,
            config,
            client: Mutex::new(client),
            metadata,
            server_info: RwLock::new(info),
            cache: SnapshotCache::new(),
        })
    }

    fn request<T>(&self, message: T) -> tonic::Request<T> {
        let mut request = tonic::Request::new(message);
        *request.metadata_mut() = self.metadata.clone();
        request
    }

    /// Ask the server process to exit
    pub async fn request_server_shutdown(&self) -> Result<()> {
        let request = self.request(ShutdownRequest {});
        let reply = with_timeout(self.name(), "shutdown", self.config.request_timeout, async {
            let mut client = self.client.lock().await;
            client
                .shutdown(request)
                .await
                .map(|r| r.into_inner())
                .map_err(|s| from_status(self.name(), s))
        })
        .await?;

        if !reply.accepted {
            return Err(Error::fetch(
                self.name(),
                format!("server refused shutdown: {}", reply.serialized_error),
            ));
        }
        Ok(())
    }

    fn partition_request(
        &self,
        repository_handle: &RepositoryHandle,
        partition_set_name: &str,
        partition_name: &str,
    ) -> tonic::Request<GetPartitionRequest> {
        self.request(GetPartitionRequest {
            repository_name: repository_handle.repository_name.clone(),
            partition_set_name: partition_set_name.to_string(),
            partition_name: partition_name.to_string(),
        })
    }
}

#[async_trait]
impl CodeLocation for GrpcServerCodeLocation {
    fn origin(&self) -> &CodeLocationOrigin {
        &self.origin
    }

    async fn get_repositories(&self) -> Result<Arc<Repositories>> {
        let generation = self.cache.begin_fetch();
        let request = self.request(GetRepositoriesRequest {});
        let reply = with_timeout(self.name(), "get_repositories", self.config.request_timeout, async {
            let mut client = self.client.lock().await;
            client
                .get_repositories(request)
                .await
                .map(|r| r.into_inner())
                .map_err(|s| from_status(self.name(), s))
        })
        .await?;

        let snapshots: RepositorySnapshots = decode_reply(reply)?;
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
        let job_name = job_handle.job_name.as_str();

        // Names and config are checked against the host's snapshot first, so
        // only dynamic structure is left for the worker to resolve.
        let repository = self.get_repository(job_handle.repository_name()).await?;
        let job = repository.get_job(job_name)?;
        let violations = validate_run_config(job.config_schema(), run_config.as_value());
        if !violations.is_empty() {
            return Err(Error::InvalidConfig {
                job_name: job_name.to_string(),
                violations,
            });
        }

        let request = self.request(GetExecutionPlanRequest {
            repository_name: job_handle.repository_name().to_string(),
            job_name: job_name.to_string(),
            run_config_json: run_config.to_json(),
            step_keys_to_execute: step_keys_to_execute.map(<[String]>::to_vec).unwrap_or_default(),
            select_steps: step_keys_to_execute.is_some(),
        });
        let reply = with_timeout(self.name(), "get_execution_plan", self.config.request_timeout, async {
            let mut client = self.client.lock().await;
            client
                .get_execution_plan(request)
                .await
                .map(|r| r.into_inner())
                .map_err(|s| from_status(self.name(), s))
        })
        .await?;

        let snapshot: ExecutionPlanSnapshot = decode_reply(reply)?;
        ExternalExecutionPlan::from_snapshot(snapshot)
    }

    async fn get_subset_job(
        &self,
        job_handle: &JobHandle,
        op_selection: &[String],
    ) -> Result<Arc<ExternalJob>> {
        check_origin(&self.origin, &job_handle.repository_handle)?;
        let repository = self.get_repository(job_handle.repository_name()).await?;

        let request = self.request(GetJobSubsetRequest {
            repository_name: job_handle.repository_name().to_string(),
            job_name: job_handle.job_name.clone(),
            op_selection: op_selection.to_vec(),
        });
        let reply = with_timeout(self.name(), "get_subset_job", self.config.request_timeout, async {
            let mut client = self.client.lock().await;
            client
                .get_job_subset(request)
                .await
                .map(|r| r.into_inner())
                .map_err(|s| from_status(self.name(), s))
        })
        .await?;

        let result: ExternalJobSubsetResult = decode_reply(reply)?;
        wrap_subset(&repository, result)
    }

    async fn get_partition_names(
        &self,
        repository_handle: &RepositoryHandle,
        partition_set_name: &str,
    ) -> Result<Vec<String>> {
        check_origin(&self.origin, repository_handle)?;
        let request = self.request(GetPartitionNamesRequest {
            repository_name: repository_handle.repository_name.clone(),
            partition_set_name: partition_set_name.to_string(),
        });
        let reply = with_timeout(self.name(), "get_partition_names", self.config.request_timeout, async {
            let mut client = self.client.lock().await;
            client
                .get_partition_names(request)
                .await
                .map(|r| r.into_inner())
                .map_err(|s| from_status(self.name(), s))
        })
        .await?;
        decode_reply(reply)
    }

    async fn get_partition_config(
        &self,
        repository_handle: &RepositoryHandle,
        partition_set_name: &str,
        partition_name: &str,
    ) -> Result<ExternalPartitionConfigData> {
        check_origin(&self.origin, repository_handle)?;
        let request = self.partition_request(repository_handle, partition_set_name, partition_name);
        let reply = with_timeout(self.name(), "get_partition_config", self.config.request_timeout, async {
            let mut client = self.client.lock().await;
            client
                .get_partition_config(request)
                .await
                .map(|r| r.into_inner())
                .map_err(|s| from_status(self.name(), s))
        })
        .await?;
        decode_reply(reply)
    }

    async fn get_partition_tags(
        &self,
        repository_handle: &RepositoryHandle,
        partition_set_name: &str,
        partition_name: &str,
    ) -> Result<ExternalPartitionTagsData> {
        check_origin(&self.origin, repository_handle)?;
        let request = self.partition_request(repository_handle, partition_set_name, partition_name);
        let reply = with_timeout(self.name(), "get_partition_tags", self.config.request_timeout, async {
            let mut client = self.client.lock().await;
            client
                .get_partition_tags(request)
                .await
                .map(|r| r.into_inner())
                .map_err(|s| from_status(self.name(), s))
        })
        .await?;
        decode_reply(reply)
    }

    async fn heartbeat(&self) -> Result<()> {
        let request = self.request(HeartbeatRequest {});
        let reply = with_timeout(self.name(), "heartbeat", self.config.heartbeat_timeout, async {
            let mut client = self.client.lock().await;
            client
                .heartbeat(request)
                .await
                .map(|r| r.into_inner())
                .map_err(|s| from_status(self.name(), s))
        })
        .await?;

        let mut info = self.server_info.write().unwrap_or_else(|e| e.into_inner());
        if info.server_id != reply.server_id {
            warn!(
                "Code server {} restarted (server id {} -> {})",
                self.name(),
                info.server_id,
                reply.server_id
            );
            info.server_id = reply.server_id;
        }
        Ok(())
    }

    fn server_id(&self) -> Option<String> {
        let info = self.server_info.read().unwrap_or_else(|e| e.into_inner());
        Some(info.server_id.clone())
    }

    async fn shutdown(&self) -> Result<()> {
        // The server is not ours to stop; just drop what we hold.
        debug!("Releasing connection to {}", self.name());
        self.cache.clear();
        Ok(())
    }
}

fn check_server_info(location: &str, info: &ServerInfoReply) -> Result<()> {
    if info.protocol_version != PROTOCOL_VERSION {
        return Err(Error::connection(
            location,
            ConnectionErrorKind::VersionMismatch,
            format!(
                "server speaks protocol {}, host speaks {}",
                info.protocol_version, PROTOCOL_VERSION
            ),
        ));
    }
    if info.max_schema_version < MIN_SUPPORTED_SCHEMA_VERSION {
        return Err(Error::connection(
            location,
            ConnectionErrorKind::VersionMismatch,
            format!(
                "server writes snapshot schema {} but host reads {} and newer",
                info.max_schema_version, MIN_SUPPORTED_SCHEMA_VERSION
            ),
        ));
    }
    Ok(())
}

fn handshake_error(location: &str, status: tonic::Status) -> Error {
    match status.code() {
        Code::Unavailable => from_status(location, status),
        code => Error::connection(
            location,
            ConnectionErrorKind::Handshake,
            format!("{:?}: {}", code, status.message()),
        ),
    }
}

fn request_metadata(pairs: &BTreeMap<String, String>) -> std::result::Result<MetadataMap, ConnectError> {
    let mut map = MetadataMap::new();
    for (key, value) in pairs {
        let key = AsciiMetadataKey::from_bytes(key.as_bytes())?;
        let value = AsciiMetadataValue::try_from(value.as_str())?;
        map.insert(key, value);
    }
    Ok(map)
}

pub(crate) fn endpoint(location: &str, uri: &str, connect_timeout: Duration) -> Result<Endpoint> {
    let endpoint = Endpoint::from_shared(uri.to_string())
        .map_err(|e| {
            ConnectError::InvalidEndpoint {
                uri: uri.to_string(),
                reason: e.to_string(),
            }
            .at(location)
        })?
        .connect_timeout(connect_timeout);

    if uri.starts_with("https://") {
        return endpoint
            .tls_config(ClientTlsConfig::new().with_native_roots())
            .map_err(|e| ConnectError::from(e).at(location));
    }
    Ok(endpoint)
}

async fn dial_tcp(location: &str, uri: &str, config: &CodeLocationConfig) -> Result<Channel> {
    let endpoint = endpoint(location, uri, config.connect_timeout)?;
    debug!("Dialing code server {} at {}", location, uri);
    with_timeout(location, "connect", config.connect_timeout, async {
        endpoint
            .connect()
            .await
            .map_err(|e| ConnectError::from(e).at(location))
    })
    .await
}

#[cfg(unix)]
async fn dial_socket(location: &str, path: String, config: &CodeLocationConfig) -> Result<Channel> {
    use hyper_util::rt::TokioIo;
    use tokio::net::UnixStream;
    use tonic::transport::Uri;

    debug!("Dialing code server {} at socket {}", location, path);
    // The builder needs a URI; the connector ignores it.
    let endpoint = Endpoint::from_static("http://[::]:50051").connect_timeout(config.connect_timeout);
    let connector = tower::service_fn(move |_: Uri| {
        let path = path.clone();
        async move {
            let stream = UnixStream::connect(path).await?;
            Ok::<_, std::io::Error>(TokioIo::new(stream))
        }
    });

    with_timeout(location, "connect", config.connect_timeout, async {
        endpoint
            .connect_with_connector(connector)
            .await
            .map_err(|e| ConnectError::from(e).at(location))
    })
    .await
}

#[cfg(not(unix))]
async fn dial_socket(location: &str, path: String, _config: &CodeLocationConfig) -> Result<Channel> {
    Err(Error::connection(
        location,
        ConnectionErrorKind::Unreachable,
        format!("unix socket {} is not supported on this platform", path),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::GrpcServerOrigin;

    fn quick_config() -> CodeLocationConfig {
        CodeLocationConfig {
            connect_timeout: Duration::from_millis(500),
            ..CodeLocationConfig::default()
        }
    }

    #[test]
    fn test_server_info_checks() {
        let mut info = ServerInfoReply {
            server_id: "s1".to_string(),
            protocol_version: PROTOCOL_VERSION,
            max_schema_version: MIN_SUPPORTED_SCHEMA_VERSION,
            server_version: "0.1.0".to_string(),
        };
        assert!(check_server_info("etl", &info).is_ok());

        info.protocol_version = PROTOCOL_VERSION + 1;
        let err = check_server_info("etl", &info).unwrap_err();
        assert!(matches!(
            err,
            Error::Connection(ref c) if c.kind == ConnectionErrorKind::VersionMismatch
        ));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_request_metadata() {
        let mut pairs = BTreeMap::new();
        pairs.insert("x-tether-deployment".to_string(), "prod".to_string());
        let map = request_metadata(&pairs).unwrap();
        assert_eq!(
            map.get("x-tether-deployment").unwrap().to_str().unwrap(),
            "prod"
        );

        pairs.insert("bad key".to_string(), "v".to_string());
        assert!(request_metadata(&pairs).is_err());
    }

    #[tokio::test]
    async fn test_invalid_endpoint() {
        let err = endpoint("etl", "not a uri", Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
    }

    #[tokio::test]
    async fn test_closed_port_is_connection_error() {
        // Bind then drop to get a port nothing listens on.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let origin = CodeLocationOrigin::GrpcServer(GrpcServerOrigin::tcp("etl", "127.0.0.1", port));

        let err = GrpcServerCodeLocation::connect(origin, quick_config())
            .await
            .err()
            .unwrap();
        match err {
            Error::Connection(c) => {
                assert_eq!(c.location, "etl");
                assert!(matches!(
                    c.kind,
                    ConnectionErrorKind::Unreachable | ConnectionErrorKind::Timeout
                ));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_socket_is_connection_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.sock");
        let origin = CodeLocationOrigin::GrpcServer(GrpcServerOrigin::socket(
            "etl",
            path.to_string_lossy(),
        ));

        let err = GrpcServerCodeLocation::connect(origin, quick_config())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Connection(_)));
    }
}
