/*!
 * Workspace configuration for tether
 *
 * A workspace file lists the code locations a host talks to, the timeouts
 * it applies to them, and how the binary logs. Example:
 *
 * ```toml
 * [logging]
 * level = "debug"
 *
 * [timeouts]
 * request_secs = 30
 *
 * [[locations]]
 * type = "grpc_server"
 * name = "analytics"
 * host = "localhost"
 * port = 4266
 *
 * [[locations]]
 * type = "managed_env"
 * name = "etl"
 * executable = "/usr/local/bin/tether"
 * args = ["serve", "--snapshot", "defs.json"]
 * ```
 */

use crate::error::{Result, TetherError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tether_connect::CodeLocationConfig;
use tether_core::{
    CodeLocationOrigin, GrpcServerOrigin, InProcessOrigin, ManagedGrpcEnvOrigin,
};

/// Default workspace file looked up in the current directory
pub const DEFAULT_CONFIG_FILE: &str = "tether.toml";

/// Top-level workspace configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TetherConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub history: HistoryConfig,

    /// Code locations, in the order they were declared
    #[serde(default)]
    pub locations: Vec<LocationConfig>,
}

/// Logging settings for the binary
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,

    /// Write JSON logs to this file instead of compact logs to stderr
    #[serde(default)]
    pub file: Option<PathBuf>,
}

/// Timeouts applied to every code location, in seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeoutConfig {
    #[serde(default = "default_connect_secs")]
    pub connect_secs: u64,

    #[serde(default = "default_request_secs")]
    pub request_secs: u64,

    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    #[serde(default = "default_startup_secs")]
    pub startup_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: default_connect_secs(),
            request_secs: default_request_secs(),
            heartbeat_secs: default_heartbeat_secs(),
            startup_secs: default_startup_secs(),
        }
    }
}

impl TimeoutConfig {
    pub fn to_location_config(&self) -> CodeLocationConfig {
        CodeLocationConfig {
            connect_timeout: Duration::from_secs(self.connect_secs),
            request_timeout: Duration::from_secs(self.request_secs),
            heartbeat_timeout: Duration::from_secs(self.heartbeat_secs),
            startup_timeout: Duration::from_secs(self.startup_secs),
        }
    }
}

/// Where run snapshots are stored
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HistoryConfig {
    /// Directory holding one snapshot file per run
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

/// One code location entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LocationConfig {
    /// A code server someone else runs
    GrpcServer {
        name: String,

        #[serde(default = "default_host")]
        host: String,

        #[serde(default)]
        port: Option<u16>,

        /// Unix socket path; mutually exclusive with `port`
        #[serde(default)]
        socket: Option<String>,

        #[serde(default)]
        use_ssl: bool,

        /// Extra gRPC metadata sent with every request
        #[serde(default)]
        metadata: BTreeMap<String, String>,
    },

    /// A code server process tether starts and stops
    ManagedEnv {
        name: String,

        executable: PathBuf,

        #[serde(default)]
        args: Vec<String>,

        #[serde(default)]
        working_directory: Option<PathBuf>,

        #[serde(default)]
        env: BTreeMap<String, String>,
    },

    /// Definitions read from a snapshot file inside the tether process
    InProcess { name: String, snapshot: PathBuf },
}

impl LocationConfig {
    pub fn name(&self) -> &str {
        match self {
            LocationConfig::GrpcServer { name, .. }
            | LocationConfig::ManagedEnv { name, .. }
            | LocationConfig::InProcess { name, .. } => name,
        }
    }

    /// Value of the `type` key
    pub fn kind(&self) -> &'static str {
        match self {
            LocationConfig::GrpcServer { .. } => "grpc_server",
            LocationConfig::ManagedEnv { .. } => "managed_env",
            LocationConfig::InProcess { .. } => "in_process",
        }
    }

    /// Origin this entry describes
    pub fn to_origin(&self) -> CodeLocationOrigin {
        match self {
            LocationConfig::GrpcServer {
                name,
                host,
                port,
                socket,
                use_ssl,
                metadata,
            } => CodeLocationOrigin::GrpcServer(GrpcServerOrigin {
                location_name: name.clone(),
                host: host.clone(),
                port: *port,
                socket: socket.clone(),
                use_ssl: *use_ssl,
                additional_metadata: metadata.clone(),
            }),
            LocationConfig::ManagedEnv {
                name,
                executable,
                args,
                working_directory,
                env,
            } => CodeLocationOrigin::ManagedGrpcEnv(ManagedGrpcEnvOrigin {
                location_name: name.clone(),
                executable_path: executable.clone(),
                args: args.clone(),
                working_directory: working_directory.clone(),
                env: env.clone(),
            }),
            LocationConfig::InProcess { name, snapshot } => CodeLocationOrigin::InProcess(
                InProcessOrigin::named(name.clone(), snapshot.to_string_lossy()),
            ),
        }
    }
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

// Default value functions for serde
fn default_connect_secs() -> u64 {
    10
}

fn default_request_secs() -> u64 {
    60
}

fn default_heartbeat_secs() -> u64 {
    5
}

fn default_startup_secs() -> u64 {
    60
}

fn default_host() -> String {
    "localhost".to_string()
}

impl TetherConfig {
    /// Load and validate a workspace file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => TetherError::ConfigNotFound(path.to_path_buf()),
            _ => TetherError::Io(e),
        })?;
        Self::from_toml(&contents)
    }

    /// Parse and validate workspace TOML
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: TetherConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let timeouts = [
            ("connect_secs", self.timeouts.connect_secs),
            ("request_secs", self.timeouts.request_secs),
            ("heartbeat_secs", self.timeouts.heartbeat_secs),
            ("startup_secs", self.timeouts.startup_secs),
        ];
        for (field, value) in timeouts {
            if value == 0 {
                return Err(TetherError::Config(format!(
                    "timeouts.{} must be greater than zero",
                    field
                )));
            }
        }

        let mut seen = HashSet::new();
        for location in &self.locations {
            let name = location.name();
            if name.trim().is_empty() {
                return Err(TetherError::Config(
                    "code location name must not be empty".to_string(),
                ));
            }
            if !seen.insert(name) {
                return Err(TetherError::Config(format!(
                    "code location {} is declared more than once",
                    name
                )));
            }

            match location {
                LocationConfig::GrpcServer { port, socket, .. } => {
                    if port.is_some() && socket.is_some() {
                        return Err(TetherError::Config(format!(
                            "code location {}: set either port or socket, not both",
                            name
                        )));
                    }
                }
                LocationConfig::ManagedEnv { executable, .. } => {
                    if executable.as_os_str().is_empty() {
                        return Err(TetherError::Config(format!(
                            "code location {}: executable must not be empty",
                            name
                        )));
                    }
                }
                LocationConfig::InProcess { snapshot, .. } => {
                    if snapshot.as_os_str().is_empty() {
                        return Err(TetherError::Config(format!(
                            "code location {}: snapshot must not be empty",
                            name
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn get_location(&self, name: &str) -> Option<&LocationConfig> {
        self.locations.iter().find(|l| l.name() == name)
    }

    pub fn origins(&self) -> Vec<CodeLocationOrigin> {
        self.locations.iter().map(LocationConfig::to_origin).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const WORKSPACE: &str = r#"
        [logging]
        level = "debug"

        [timeouts]
        request_secs = 30

        [[locations]]
        type = "grpc_server"
        name = "analytics"
        host = "code.internal"
        port = 4266
        use_ssl = true

        [locations.metadata]
        x-deployment = "prod"

        [[locations]]
        type = "grpc_server"
        name = "sockets"
        socket = "/run/tether/defs.sock"

        [[locations]]
        type = "managed_env"
        name = "etl"
        executable = "/usr/local/bin/tether"
        args = ["serve", "--snapshot", "defs.json"]

        [locations.env]
        RUST_LOG = "info"

        [[locations]]
        type = "in_process"
        name = "local"
        snapshot = "defs.json"
    "#;

    #[test]
    fn test_parse_workspace() {
        let config = TetherConfig::from_toml(WORKSPACE).unwrap();
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(config.timeouts.request_secs, 30);
        assert_eq!(config.timeouts.connect_secs, 10);
        assert_eq!(config.locations.len(), 4);

        let names: Vec<_> = config.locations.iter().map(|l| l.name()).collect();
        assert_eq!(names, vec!["analytics", "sockets", "etl", "local"]);
        let kinds: Vec<_> = config.locations.iter().map(|l| l.kind()).collect();
        assert_eq!(kinds, vec!["grpc_server", "grpc_server", "managed_env", "in_process"]);
    }

    #[test]
    fn test_origins() {
        let config = TetherConfig::from_toml(WORKSPACE).unwrap();
        let origins = config.origins();

        match &origins[0] {
            CodeLocationOrigin::GrpcServer(o) => {
                assert_eq!(o.endpoint_uri().as_deref(), Some("https://code.internal:4266"));
                assert_eq!(o.additional_metadata["x-deployment"], "prod");
            }
            other => panic!("unexpected origin: {:?}", other),
        }
        match &origins[2] {
            CodeLocationOrigin::ManagedGrpcEnv(o) => {
                assert_eq!(o.args, vec!["serve", "--snapshot", "defs.json"]);
                assert_eq!(o.env["RUST_LOG"], "info");
            }
            other => panic!("unexpected origin: {:?}", other),
        }
        match &origins[3] {
            CodeLocationOrigin::InProcess(o) => assert_eq!(o.target, "defs.json"),
            other => panic!("unexpected origin: {:?}", other),
        }
    }

    #[test]
    fn test_location_config_timeouts() {
        let config = TetherConfig::from_toml(WORKSPACE).unwrap();
        let timeouts = config.timeouts.to_location_config();
        assert_eq!(timeouts.request_timeout, Duration::from_secs(30));
        assert_eq!(timeouts.heartbeat_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_empty_workspace_uses_defaults() {
        let config = TetherConfig::from_toml("").unwrap();
        assert_eq!(config, TetherConfig::default());
        assert_eq!(config.logging.level, LogLevel::Info);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let toml = r#"
            [[locations]]
            type = "in_process"
            name = "defs"
            snapshot = "a.json"

            [[locations]]
            type = "in_process"
            name = "defs"
            snapshot = "b.json"
        "#;
        let err = TetherConfig::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_port_and_socket_rejected() {
        let toml = r#"
            [[locations]]
            type = "grpc_server"
            name = "analytics"
            port = 4266
            socket = "/tmp/defs.sock"
        "#;
        assert!(matches!(
            TetherConfig::from_toml(toml),
            Err(TetherError::Config(_))
        ));
    }

    #[test]
    fn test_empty_name_and_zero_timeout_rejected() {
        let toml = r#"
            [[locations]]
            type = "in_process"
            name = " "
            snapshot = "a.json"
        "#;
        assert!(TetherConfig::from_toml(toml).is_err());

        let toml = "[timeouts]\nconnect_secs = 0\n";
        assert!(TetherConfig::from_toml(toml).is_err());
    }

    #[test]
    fn test_unknown_location_type_rejected() {
        let toml = r#"
            [[locations]]
            type = "carrier_pigeon"
            name = "defs"
        "#;
        assert!(matches!(
            TetherConfig::from_toml(toml),
            Err(TetherError::Config(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(WORKSPACE.as_bytes()).unwrap();
        let config = TetherConfig::from_file(file.path()).unwrap();
        assert!(config.get_location("etl").is_some());
        assert!(config.get_location("nope").is_none());

        let err = TetherConfig::from_file(Path::new("/nonexistent/tether.toml")).unwrap_err();
        assert!(matches!(err, TetherError::ConfigNotFound(_)));
    }
}
