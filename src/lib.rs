/*!
 * Tether - host-side view of remote code locations
 *
 * Loads a workspace file, connects to the code locations it lists and answers
 * questions about their definitions without running any user code:
 * - Repositories, jobs, schedules, sensors and partition sets per location
 * - Structural execution plans for a job and run config
 * - Jobs as they were when a past run was planned
 *
 * The snapshot model lives in `tether-core`; connections live in
 * `tether-connect`. This crate adds configuration, logging, the CLI and
 * file-backed providers.
 */

pub mod config;
pub mod error;
pub mod logging;
pub mod output;
pub mod provider;
pub mod workspace;

// Re-export commonly used types
pub use config::{LocationConfig, LogLevel, TetherConfig};
pub use error::{Result, TetherError};
pub use provider::{FileRunSnapshotStore, SnapshotFileProvider};
pub use workspace::Workspace;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, env!("CARGO_PKG_VERSION"));
    }
}
