//! ManagedGrpcEnvCodeLocation: a code server process owned by the host
//!
//! The host picks a free local port, spawns the worker executable with
//! `--port <n>` appended to its arguments, and polls until the worker
//! answers the handshake. The worker is stopped when the location shuts
//! down, or killed when it is dropped.

use crate::error::ConnectError;
use crate::grpc::{endpoint, GrpcServerCodeLocation};
use crate::location::{CodeLocation, CodeLocationConfig, Repositories};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tether_core::origin::ConnectParams;
use tether_core::snapshot::{ExternalPartitionConfigData, ExternalPartitionTagsData};
use tether_core::{
    CodeLocationOrigin, ConnectionErrorKind, Error, ExternalExecutionPlan, ExternalJob, JobHandle,
    RepositoryHandle, Result, RunConfig,
};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Pause between handshake attempts while the worker starts
const STARTUP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long a worker gets to exit after a shutdown request
const EXIT_GRACE_PERIOD: Duration = Duration::from_secs(5);

pub struct ManagedGrpcEnvCodeLocation {
    inner: GrpcServerCodeLocation,
    child: Mutex<Option<Child>>,
    port: u16,
}

impl ManagedGrpcEnvCodeLocation {
    /// Spawn the worker an origin describes and wait until it answers
    pub async fn start(origin: CodeLocationOrigin, config: CodeLocationConfig) -> Result<Self> {
        let name = origin.location_name().to_string();
        let (executable, args, working_directory, env) = match origin.connect_params() {
            ConnectParams::Spawn {
                executable,
                args,
                working_directory,
                env,
            } => (executable, args, working_directory, env),
            other => {
                return Err(Error::connection(
                    name,
                    ConnectionErrorKind::Handshake,
                    format!("origin is not a managed worker: {:?}", other),
                ))
            }
        };

        let port = free_port().map_err(|e| ConnectError::from(e).at(&name))?;
        let mut command = Command::new(&executable);
        command
            .args(&args)
            .arg("--port")
            .arg(port.to_string())
            .envs(&env)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &working_directory {
            command.current_dir(dir);
        }

        info!(
            "Starting worker for {}: {} (port {})",
            name,
            executable.display(),
            port
        );
        let mut child = command.spawn().map_err(|source| {
            ConnectError::Spawn {
                executable: executable.display().to_string(),
                source,
            }
            .at(&name)
        })?;

        let uri = format!("http://127.0.0.1:{}", port);
        let deadline = Instant::now() + config.startup_timeout;
        let mut last_error = None;

        loop {
            if let Some(status) = child.try_wait().map_err(|e| ConnectError::from(e).at(&name))? {
                return Err(Error::connection(
                    name,
                    ConnectionErrorKind::ProcessExited,
                    format!("worker exited during startup with {}", status),
                ));
            }

            match handshake(&origin, &config, &uri).await {
                Ok(inner) => {
                    info!("Worker for {} is serving on port {}", name, port);
                    return Ok(Self {
                        inner,
                        child: Mutex::new(Some(child)),
                        port,
                    });
                }
                Err(Error::Connection(c)) if c.kind == ConnectionErrorKind::VersionMismatch => {
                    kill(&name, &mut child).await;
                    return Err(Error::Connection(c));
                }
                Err(e) => {
                    debug!("Worker for {} not ready yet: {}", name, e);
                    last_error = Some(e);
                }
            }

            if Instant::now() >= deadline {
                kill(&name, &mut child).await;
                if let Some(e) = last_error {
                    warn!("Worker for {} never became ready: {}", name, e);
                }
                return Err(Error::timeout(name, "startup", config.startup_timeout));
            }
            tokio::time::sleep(STARTUP_POLL_INTERVAL).await;
        }
    }

    /// Local port the worker serves on
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Fail if the worker process is gone
    async fn check_alive(&self) -> Result<()> {
        let mut child = self.child.lock().await;
        let Some(process) = child.as_mut() else {
            return Err(Error::connection(
                self.name(),
                ConnectionErrorKind::ProcessExited,
                "worker has been shut down",
            ));
        };
        match process.try_wait() {
            Ok(None) => Ok(()),
            Ok(Some(status)) => Err(Error::connection(
                self.name(),
                ConnectionErrorKind::ProcessExited,
                format!("worker exited with {}", status),
            )),
            Err(e) => Err(ConnectError::from(e).at(self.name())),
        }
    }
}

async fn handshake(
    origin: &CodeLocationOrigin,
    config: &CodeLocationConfig,
    uri: &str,
) -> Result<GrpcServerCodeLocation> {
    let name = origin.location_name();
    let channel = endpoint(name, uri, config.connect_timeout)?
        .connect()
        .await
        .map_err(|e| ConnectError::from(e).at(name))?;
    GrpcServerCodeLocation::from_channel(origin.clone(), *config, channel, &BTreeMap::new()).await
}

fn free_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

async fn kill(location: &str, child: &mut Child) {
    if let Err(e) = child.kill().await {
        warn!("Failed to kill worker for {}: {}", location, e);
    }
}

#[async_trait]
impl CodeLocation for ManagedGrpcEnvCodeLocation {
    fn origin(&self) -> &CodeLocationOrigin {
        self.inner.origin()
    }

    async fn get_repositories(&self) -> Result<Arc<Repositories>> {
        self.inner.get_repositories().await
    }

    fn cached_repositories(&self) -> Option<Arc<Repositories>> {
        self.inner.cached_repositories()
    }

    async fn get_execution_plan(
        &self,
        job_handle: &JobHandle,
        run_config: &RunConfig,
        step_keys_to_execute: Option<&[String]>,
    ) -> Result<ExternalExecutionPlan> {
        self.inner
            .get_execution_plan(job_handle, run_config, step_keys_to_execute)
            .await
    }

    async fn get_subset_job(
        &self,
        job_handle: &JobHandle,
        op_selection: &[String],
    ) -> Result<Arc<ExternalJob>> {
        self.inner.get_subset_job(job_handle, op_selection).await
    }

    async fn get_partition_names(
        &self,
        repository_handle: &RepositoryHandle,
        partition_set_name: &str,
    ) -> Result<Vec<String>> {
        self.inner
            .get_partition_names(repository_handle, partition_set_name)
            .await
    }

    async fn get_partition_config(
        &self,
        repository_handle: &RepositoryHandle,
        partition_set_name: &str,
        partition_name: &str,
    ) -> Result<ExternalPartitionConfigData> {
        self.inner
            .get_partition_config(repository_handle, partition_set_name, partition_name)
            .await
    }

    async fn get_partition_tags(
        &self,
        repository_handle: &RepositoryHandle,
        partition_set_name: &str,
        partition_name: &str,
    ) -> Result<ExternalPartitionTagsData> {
        self.inner
            .get_partition_tags(repository_handle, partition_set_name, partition_name)
            .await
    }

    async fn heartbeat(&self) -> Result<()> {
        self.check_alive().await?;
        self.inner.heartbeat().await
    }

    fn server_id(&self) -> Option<String> {
        self.inner.server_id()
    }

    async fn shutdown(&self) -> Result<()> {
        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };

        info!("Stopping worker for {}", self.name());
        if let Err(e) = self.inner.request_server_shutdown().await {
            warn!("Worker for {} ignored shutdown request: {}", self.name(), e);
        }
        self.inner.shutdown().await?;

        match tokio::time::timeout(EXIT_GRACE_PERIOD, child.wait()).await {
            Ok(Ok(status)) => debug!("Worker for {} exited with {}", self.name(), status),
            Ok(Err(e)) => return Err(ConnectError::from(e).at(self.name())),
            Err(_) => {
                warn!(
                    "Worker for {} still running after {:?}, killing it",
                    self.name(),
                    EXIT_GRACE_PERIOD
                );
                kill(self.name(), &mut child).await;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::ManagedGrpcEnvOrigin;

    fn config(startup: Duration) -> CodeLocationConfig {
        CodeLocationConfig {
            connect_timeout: Duration::from_millis(200),
            startup_timeout: startup,
            ..CodeLocationConfig::default()
        }
    }

    #[test]
    fn test_free_port() {
        assert!(free_port().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_missing_executable() {
        let origin = CodeLocationOrigin::ManagedGrpcEnv(ManagedGrpcEnvOrigin::new(
            "etl",
            "/nonexistent/tether-worker",
        ));
        let err = ManagedGrpcEnvCodeLocation::start(origin, config(Duration::from_secs(1)))
            .await
            .err()
            .unwrap();
        match err {
            Error::Connection(c) => {
                assert_eq!(c.location, "etl");
                assert!(c.message.contains("/nonexistent/tether-worker"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_worker_exits_during_startup() {
        // `sh -c "exit 3" --port N`: the trailing args become $0 and $1.
        let origin = CodeLocationOrigin::ManagedGrpcEnv(
            ManagedGrpcEnvOrigin::new("etl", "sh").with_args(["-c", "exit 3"]),
        );
        let err = ManagedGrpcEnvCodeLocation::start(origin, config(Duration::from_secs(10)))
            .await
            .err()
            .unwrap();
        match err {
            Error::Connection(c) => assert_eq!(c.kind, ConnectionErrorKind::ProcessExited),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_worker_never_ready_times_out() {
        let origin = CodeLocationOrigin::ManagedGrpcEnv(
            ManagedGrpcEnvOrigin::new("etl", "sh").with_args(["-c", "sleep 30"]),
        );
        let err = ManagedGrpcEnvCodeLocation::start(origin, config(Duration::from_millis(500)))
            .await
            .err()
            .unwrap();
        assert!(err.is_timeout());
    }
}
