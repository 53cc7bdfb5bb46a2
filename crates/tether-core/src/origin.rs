//! Origins: stable, serializable identities for code locations and the
//! repositories, jobs and instigators they define
//!
//! An origin says *where* definitions live without holding a connection to
//! them. Origins are plain values: structural equality, hashable, and
//! serializable to a canonical storage key that parses back into an equal
//! value.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Location name used when an in-process origin is not given one
pub const IN_PROCESS_NAME: &str = "<<in_process>>";

/// Where a code location's definitions live
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CodeLocationOrigin {
    /// Definitions registered inside the host process
    InProcess(InProcessOrigin),

    /// A worker subprocess spawned and owned by the host
    ManagedGrpcEnv(ManagedGrpcEnvOrigin),

    /// An already running worker reachable over gRPC
    GrpcServer(GrpcServerOrigin),
}

/// Definitions provided by a target registered in the host process
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InProcessOrigin {
    pub location_name: String,

    /// Name of the registered definitions target
    pub target: String,
}

impl InProcessOrigin {
    /// Create an in-process origin with the default location name
    pub fn new<T: Into<String>>(target: T) -> Self {
        Self {
            location_name: IN_PROCESS_NAME.to_string(),
            target: target.into(),
        }
    }

    /// Create an in-process origin with an explicit location name
    pub fn named<N: Into<String>, T: Into<String>>(location_name: N, target: T) -> Self {
        Self {
            location_name: location_name.into(),
            target: target.into(),
        }
    }
}

/// A worker process the host spawns, then talks to over gRPC
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ManagedGrpcEnvOrigin {
    pub location_name: String,

    /// Worker executable
    pub executable_path: PathBuf,

    /// Arguments passed before the host-chosen `--port`
    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub working_directory: Option<PathBuf>,

    /// Extra environment for the worker
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl ManagedGrpcEnvOrigin {
    pub fn new<N: Into<String>, P: Into<PathBuf>>(location_name: N, executable_path: P) -> Self {
        Self {
            location_name: location_name.into(),
            executable_path: executable_path.into(),
            args: Vec::new(),
            working_directory: None,
            env: BTreeMap::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// A running worker reachable at host:port or a local socket
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GrpcServerOrigin {
    pub location_name: String,

    pub host: String,

    #[serde(default)]
    pub port: Option<u16>,

    /// Unix domain socket path, used instead of `port` when set
    #[serde(default)]
    pub socket: Option<String>,

    #[serde(default)]
    pub use_ssl: bool,

    /// Metadata attached to every request
    #[serde(default)]
    pub additional_metadata: BTreeMap<String, String>,
}

impl GrpcServerOrigin {
    /// Origin for a TCP server
    pub fn tcp<N: Into<String>, H: Into<String>>(location_name: N, host: H, port: u16) -> Self {
        Self {
            location_name: location_name.into(),
            host: host.into(),
            port: Some(port),
            socket: None,
            use_ssl: false,
            additional_metadata: BTreeMap::new(),
        }
    }

    /// Origin for a server listening on a Unix domain socket
    pub fn socket<N: Into<String>, S: Into<String>>(location_name: N, socket: S) -> Self {
        Self {
            location_name: location_name.into(),
            host: "localhost".to_string(),
            port: None,
            socket: Some(socket.into()),
            use_ssl: false,
            additional_metadata: BTreeMap::new(),
        }
    }

    /// `http(s)://host:port`, or `None` for socket origins
    pub fn endpoint_uri(&self) -> Option<String> {
        let port = self.port?;
        let scheme = if self.use_ssl { "https" } else { "http" };
        Some(format!("{}://{}:{}", scheme, self.host, port))
    }
}

/// Connection parameters extracted from an origin
///
/// Consumed only when a code location is constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectParams {
    /// Look up a registered target by name
    InProcess { target: String },

    /// Spawn a worker process
    Spawn {
        executable: PathBuf,
        args: Vec<String>,
        working_directory: Option<PathBuf>,
        env: BTreeMap<String, String>,
    },

    /// Dial a gRPC endpoint over TCP
    Tcp {
        uri: String,
        metadata: BTreeMap<String, String>,
    },

    /// Dial a gRPC endpoint over a Unix domain socket
    UnixSocket {
        path: String,
        metadata: BTreeMap<String, String>,
    },
}

impl CodeLocationOrigin {
    /// Name the workspace knows this location by
    pub fn location_name(&self) -> &str {
        match self {
            CodeLocationOrigin::InProcess(o) => &o.location_name,
            CodeLocationOrigin::ManagedGrpcEnv(o) => &o.location_name,
            CodeLocationOrigin::GrpcServer(o) => &o.location_name,
        }
    }

    /// Whether the host can reload the location by itself
    pub fn is_reload_supported(&self) -> bool {
        true
    }

    /// Whether the host may shut the worker down
    pub fn is_shutdown_supported(&self) -> bool {
        matches!(self, CodeLocationOrigin::ManagedGrpcEnv(_))
    }

    /// Parameters needed to open a connection to this location
    pub fn connect_params(&self) -> ConnectParams {
        match self {
            CodeLocationOrigin::InProcess(o) => ConnectParams::InProcess {
                target: o.target.clone(),
            },
            CodeLocationOrigin::ManagedGrpcEnv(o) => ConnectParams::Spawn {
                executable: o.executable_path.clone(),
                args: o.args.clone(),
                working_directory: o.working_directory.clone(),
                env: o.env.clone(),
            },
            CodeLocationOrigin::GrpcServer(o) => match (&o.socket, o.endpoint_uri()) {
                (Some(path), _) => ConnectParams::UnixSocket {
                    path: path.clone(),
                    metadata: o.additional_metadata.clone(),
                },
                (None, Some(uri)) => ConnectParams::Tcp {
                    uri,
                    metadata: o.additional_metadata.clone(),
                },
                // Neither set: dial the host on the default port
                (None, None) => ConnectParams::Tcp {
                    uri: format!(
                        "{}://{}:{}",
                        if o.use_ssl { "https" } else { "http" },
                        o.host,
                        DEFAULT_GRPC_PORT
                    ),
                    metadata: o.additional_metadata.clone(),
                },
            },
        }
    }

    pub fn to_storage_key(&self) -> String {
        storage_key(self)
    }

    pub fn from_storage_key(key: &str) -> Result<Self> {
        parse_storage_key(key)
    }

    pub fn get_id(&self) -> String {
        hash_key(&self.to_storage_key())
    }
}

/// Port assumed for gRPC origins configured with neither port nor socket
pub const DEFAULT_GRPC_PORT: u16 = 4266;

/// A repository inside a code location
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteRepositoryOrigin {
    pub code_location_origin: CodeLocationOrigin,
    pub repository_name: String,
}

impl RemoteRepositoryOrigin {
    pub fn new<N: Into<String>>(code_location_origin: CodeLocationOrigin, repository_name: N) -> Self {
        Self {
            code_location_origin,
            repository_name: repository_name.into(),
        }
    }

    pub fn location_name(&self) -> &str {
        self.code_location_origin.location_name()
    }

    pub fn get_job_origin<N: Into<String>>(&self, job_name: N) -> RemoteJobOrigin {
        RemoteJobOrigin {
            repository_origin: self.clone(),
            job_name: job_name.into(),
        }
    }

    pub fn get_instigator_origin<N: Into<String>>(&self, instigator_name: N) -> RemoteInstigatorOrigin {
        RemoteInstigatorOrigin {
            repository_origin: self.clone(),
            instigator_name: instigator_name.into(),
        }
    }

    pub fn to_storage_key(&self) -> String {
        storage_key(self)
    }

    pub fn from_storage_key(key: &str) -> Result<Self> {
        parse_storage_key(key)
    }

    pub fn get_id(&self) -> String {
        hash_key(&self.to_storage_key())
    }
}

/// A job inside a repository
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteJobOrigin {
    pub repository_origin: RemoteRepositoryOrigin,
    pub job_name: String,
}

impl RemoteJobOrigin {
    pub fn location_name(&self) -> &str {
        self.repository_origin.location_name()
    }

    pub fn to_storage_key(&self) -> String {
        storage_key(self)
    }

    pub fn from_storage_key(key: &str) -> Result<Self> {
        parse_storage_key(key)
    }

    pub fn get_id(&self) -> String {
        hash_key(&self.to_storage_key())
    }
}

/// A schedule or sensor inside a repository
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteInstigatorOrigin {
    pub repository_origin: RemoteRepositoryOrigin,
    pub instigator_name: String,
}

impl RemoteInstigatorOrigin {
    pub fn location_name(&self) -> &str {
        self.repository_origin.location_name()
    }

    pub fn to_storage_key(&self) -> String {
        storage_key(self)
    }

    pub fn from_storage_key(key: &str) -> Result<Self> {
        parse_storage_key(key)
    }

    /// Identity including the full connection parameters
    pub fn get_id(&self) -> String {
        hash_key(&self.to_storage_key())
    }

    /// Identity by names only
    ///
    /// Survives a location moving to a different host or port, so stored
    /// ticks keep pointing at the same instigator.
    pub fn selector_id(&self) -> String {
        hash_key(&format!(
            "{}\u{0}{}\u{0}{}",
            self.location_name(),
            self.repository_origin.repository_name,
            self.instigator_name
        ))
    }
}

fn storage_key<T: Serialize>(value: &T) -> String {
    // Origins hold only strings, integers, bools and BTreeMaps.
    serde_json::to_string(value).unwrap_or_default()
}

fn parse_storage_key<T: DeserializeOwned>(key: &str) -> Result<T> {
    serde_json::from_str(key).map_err(|e| Error::corrupt(format!("invalid origin key: {}", e)))
}

pub(crate) fn hash_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}
