/*!
 * Tether CLI - Command Line Interface
 *
 * Inspects the code locations a workspace file lists, plans jobs against
 * them and serves snapshot files to other hosts.
 */

use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tether::{
    config::{LoggingConfig, DEFAULT_CONFIG_FILE},
    error::{EXIT_SUCCESS, Result, TetherError},
    logging,
    output::{self, print_error, print_success, print_warning, section_header, Theme},
    LogLevel, SnapshotFileProvider, TetherConfig, Workspace,
};
use tether_connect::DefinitionsServer;
use tether_core::serdes::serialize_snapshot;
use tether_core::{PassthroughResolver, RepresentedJob, RunConfig};
use tracing::info;

#[derive(Parser)]
#[command(name = "tether")]
#[command(version, about = "Host-side view of remote code locations", long_about = None)]
struct Cli {
    /// Workspace file listing code locations
    #[arg(short = 'c', long, value_name = "FILE", default_value = DEFAULT_CONFIG_FILE, global = true)]
    config: PathBuf,

    /// Log level (overrides the workspace file)
    #[arg(long, value_enum, global = true)]
    log_level: Option<LogLevelArg>,

    /// Write JSON logs to this file
    #[arg(long = "log", value_name = "FILE", global = true)]
    log: Option<PathBuf>,

    /// Verbose output (debug logging)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to every location and show its status
    Locations,

    /// List repositories and what they define
    Repositories {
        /// Only this location
        #[arg(short, long)]
        location: Option<String>,

        /// Also list each repository's jobs and their snapshot ids
        #[arg(long)]
        jobs: bool,
    },

    /// Build the execution plan for a job
    Plan {
        #[arg(short, long)]
        location: String,

        #[arg(short, long)]
        repository: String,

        #[arg(short, long)]
        job: String,

        /// Run config as JSON or TOML
        #[arg(long, value_name = "FILE")]
        run_config: Option<PathBuf>,

        /// Only execute these steps (repeatable)
        #[arg(long = "step", value_name = "KEY")]
        steps: Vec<String>,

        /// Store the job snapshot under this run id
        #[arg(long, value_name = "RUN_ID")]
        record_run: Option<String>,

        /// Print the plan snapshot instead of a table
        #[arg(long)]
        json: bool,
    },

    /// List the partitions of a partition set
    Partitions {
        #[arg(short, long)]
        location: String,

        #[arg(short, long)]
        repository: String,

        #[arg(short, long)]
        partition_set: String,
    },

    /// Show the job a past run was planned against
    History {
        #[arg(long = "run", value_name = "RUN_ID")]
        run_id: String,

        /// Run store directory (overrides `[history] dir`)
        #[arg(long, value_name = "DIR")]
        store: Option<PathBuf>,
    },

    /// Serve a snapshot file as a code server
    Serve {
        #[arg(long, value_name = "FILE")]
        snapshot: PathBuf,

        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        #[arg(short, long)]
        port: u16,

        /// Location name reported to clients (defaults to the file stem)
        #[arg(long)]
        name: Option<String>,
    },
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum LogLevelArg {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevelArg> for LogLevel {
    fn from(arg: LogLevelArg) -> Self {
        match arg {
            LogLevelArg::Error => LogLevel::Error,
            LogLevelArg::Warn => LogLevel::Warn,
            LogLevelArg::Info => LogLevel::Info,
            LogLevelArg::Debug => LogLevel::Debug,
            LogLevelArg::Trace => LogLevel::Trace,
        }
    }
}

fn main() {
    let code = match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            print_error(&e.to_string(), e.suggestion());
            e.exit_code()
        }
    };
    std::process::exit(code);
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    // `serve` runs without a workspace file
    let config = match cli.command {
        Commands::Serve { .. } => None,
        _ => Some(TetherConfig::from_file(&cli.config)?),
    };

    let mut log_config = config
        .as_ref()
        .map(|c| c.logging.clone())
        .unwrap_or_else(LoggingConfig::default);
    if let Some(level) = cli.log_level {
        log_config.level = level.into();
    }
    if cli.log.is_some() {
        log_config.file = cli.log.clone();
    }
    logging::init_logging(&log_config, cli.verbose)?;

    let runtime = tokio::runtime::Runtime::new()
        .map_err(|e| TetherError::Other(format!("Failed to start runtime: {}", e)))?;

    match (cli.command, config) {
        (
            Commands::Serve {
                snapshot,
                host,
                port,
                name,
            },
            _,
        ) => runtime.block_on(serve(snapshot, &host, port, name)),
        (command, Some(config)) => runtime.block_on(async {
            let workspace = Workspace::from_config(config).await;
            let result = run_command(&workspace, command).await;
            workspace.shutdown().await;
            result
        }),
        (_, None) => Err(TetherError::ConfigNotFound(cli.config)),
    }
}

async fn run_command(workspace: &Workspace, command: Commands) -> Result<()> {
    match command {
        Commands::Locations => {
            let rows = workspace.location_rows().await;
            if rows.is_empty() {
                print_warning("No code locations configured");
                return Ok(());
            }
            println!("{}", output::locations_table(&rows));
            Ok(())
        }

        Commands::Repositories { location, jobs } => {
            let explicit = location.is_some();
            let names: Vec<String> = match location {
                Some(name) => vec![name],
                None => workspace
                    .config()
                    .locations
                    .iter()
                    .map(|l| l.name().to_string())
                    .collect(),
            };
            for name in names {
                match workspace.repositories(&name).await {
                    Ok(repositories) => {
                        section_header(&name);
                        println!("{}", output::repositories_table(&name, &repositories));
                        if jobs {
                            for (repo_name, repo) in repositories.iter() {
                                let refs = repo.data().job_refs();
                                println!("{}", output::jobs_table(repo_name, &refs));
                            }
                        }
                    }
                    Err(e) if explicit => return Err(e),
                    Err(e) => print_warning(&format!("{}: {}", name, e)),
                }
            }
            Ok(())
        }

        Commands::Plan {
            location,
            repository,
            job,
            run_config,
            steps,
            record_run,
            json,
        } => {
            let external_job = workspace.job(&location, &repository, &job).await?;
            let run_config = match run_config {
                Some(path) => load_run_config(&path, &job)?,
                None => RunConfig::empty(),
            };
            let step_keys = if steps.is_empty() {
                None
            } else {
                Some(steps.as_slice())
            };

            let plan = workspace
                .plan(&external_job, &run_config, step_keys)
                .await?;

            if json {
                println!("{}", serialize_snapshot(plan.snapshot())?);
            } else {
                section_header(&format!("{} @ {}", external_job.name(), location));
                println!("{}", output::plan_table(&plan));
            }

            if let Some(run_id) = record_run {
                let store = workspace.run_store().ok_or_else(|| {
                    TetherError::Config("--record-run needs `[history] dir`".to_string())
                })?;
                Workspace::record_run(&store, &run_id, &external_job)?;
                print_success(&format!("Recorded run {}", run_id));
            }
            Ok(())
        }

        Commands::Partitions {
            location,
            repository,
            partition_set,
        } => {
            let names = workspace
                .partition_names(&location, &repository, &partition_set)
                .await?;
            for name in names {
                println!("{}", name);
            }
            Ok(())
        }

        Commands::History { run_id, store } => {
            let store = store
                .map(tether::FileRunSnapshotStore::new)
                .or_else(|| workspace.run_store())
                .ok_or_else(|| {
                    TetherError::Config("Pass --store or set `[history] dir`".to_string())
                })?;
            let job = Workspace::history(&store, &run_id)?;
            section_header(&format!("{} (run {})", job.name(), run_id));
            println!(
                "{} {}",
                Theme::muted("snapshot"),
                job.identifying_job_snapshot_id()
            );
            println!("{}", output::history_table(&job));
            Ok(())
        }

        Commands::Serve { .. } => Ok(()),
    }
}

/// Read a run config file and resolve it for `job_name`
fn load_run_config(path: &Path, job_name: &str) -> Result<RunConfig> {
    let contents = std::fs::read_to_string(path)?;
    let raw: serde_json::Value = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(&contents)?,
        _ => serde_json::from_str(&contents)?,
    };
    Ok(RunConfig::resolve(job_name, &raw, &PassthroughResolver)?)
}

async fn serve(snapshot: PathBuf, host: &str, port: u16, name: Option<String>) -> Result<()> {
    let name = name.unwrap_or_else(|| {
        snapshot
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "snapshot".to_string())
    });

    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    let server = DefinitionsServer::new(name, Arc::new(SnapshotFileProvider::new(&snapshot)));
    info!(
        "Serving {} as server {}",
        snapshot.display(),
        server.server_id()
    );

    tokio::select! {
        result = server.serve(listener) => {
            result.map_err(|e| TetherError::Other(format!("Server failed: {}", e)))
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            Ok(())
        }
    }
}
