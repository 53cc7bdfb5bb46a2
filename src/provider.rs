/*!
 * Definitions and run history backed by files
 *
 * `SnapshotFileProvider` serves repositories from a snapshot file written by
 * `serialize_snapshot`. It is what `tether serve` and in-process locations in
 * a workspace file load. `FileRunSnapshotStore` keeps one job snapshot per
 * run in a directory.
 */

use std::path::{Path, PathBuf};
use tether_connect::DefinitionsProvider;
use tether_core::serdes::{deserialize_snapshot, serialize_snapshot, RepositorySnapshots};
use tether_core::snapshot::{ExternalRepositoryData, SerializableErrorInfo};
use tether_core::{EntityKind, Error, RunSnapshotStore};
use tracing::debug;

/// Repositories read from a snapshot file on every load
///
/// Reading on every call means a reload picks up a rewritten file.
#[derive(Debug, Clone)]
pub struct SnapshotFileProvider {
    path: PathBuf,
}

impl SnapshotFileProvider {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write repositories to `path` in the format this provider reads
    pub fn write(path: &Path, repositories: &RepositorySnapshots) -> tether_core::Result<()> {
        let payload = serialize_snapshot(repositories)?;
        std::fs::write(path, payload)
            .map_err(|e| Error::fetch(path.display().to_string(), format!("write failed: {}", e)))
    }
}

impl DefinitionsProvider for SnapshotFileProvider {
    fn load_repositories(&self) -> Result<Vec<ExternalRepositoryData>, SerializableErrorInfo> {
        debug!("Loading definitions from {}", self.path.display());
        let payload = std::fs::read_to_string(&self.path).map_err(|e| {
            let mut info = SerializableErrorInfo::new(format!(
                "could not read {}: {}",
                self.path.display(),
                e
            ));
            info.cls_name = Some("IoError".to_string());
            info
        })?;

        let repositories: RepositorySnapshots = deserialize_snapshot(&payload).map_err(|e| {
            let mut info = SerializableErrorInfo::new(e.to_string());
            info.cls_name = Some("SnapshotError".to_string());
            info
        })?;
        Ok(repositories.into_values().collect())
    }
}

/// Run history kept as `<dir>/<run_id>.json`
#[derive(Debug, Clone)]
pub struct FileRunSnapshotStore {
    dir: PathBuf,
}

impl FileRunSnapshotStore {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, run_id: &str) -> tether_core::Result<PathBuf> {
        let valid = !run_id.is_empty()
            && run_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(Error::not_found(EntityKind::Run, run_id));
        }
        Ok(self.dir.join(format!("{}.json", run_id)))
    }
}

impl RunSnapshotStore for FileRunSnapshotStore {
    fn get_snapshot(&self, run_id: &str) -> tether_core::Result<String> {
        let path = self.path_for(run_id)?;
        match std::fs::read_to_string(&path) {
            Ok(payload) => Ok(payload),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::not_found(EntityKind::Run, run_id))
            }
            Err(e) => Err(Error::fetch(
                path.display().to_string(),
                format!("read failed: {}", e),
            )),
        }
    }

    fn put_snapshot(&self, run_id: &str, payload: String) -> tether_core::Result<()> {
        let path = self.path_for(run_id)?;
        std::fs::create_dir_all(&self.dir)
            .and_then(|_| std::fs::write(&path, payload))
            .map_err(|e| Error::fetch(path.display().to_string(), format!("write failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::init_test_logging;
    use std::sync::Arc;
    use tether_core::testing::etl_repository;
    use tether_core::{
        CodeLocationOrigin, ExternalRepository, HistoricalJob, HistoricalJobSnapshot,
        InProcessOrigin, RepresentedJob,
    };

    #[test]
    fn test_provider_reads_snapshot_file() {
        init_test_logging();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("defs.json");

        let mut repositories = RepositorySnapshots::new();
        repositories.insert("analytics".to_string(), etl_repository("analytics"));
        SnapshotFileProvider::write(&path, &repositories).unwrap();

        let provider = SnapshotFileProvider::new(&path);
        let loaded = provider.load_repositories().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "analytics");
    }

    #[test]
    fn test_provider_errors_are_user_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = SnapshotFileProvider::new(dir.path().join("missing.json"));
        let info = missing.load_repositories().unwrap_err();
        assert_eq!(info.cls_name.as_deref(), Some("IoError"));

        let garbage = dir.path().join("garbage.json");
        std::fs::write(&garbage, "not json").unwrap();
        let info = SnapshotFileProvider::new(&garbage)
            .load_repositories()
            .unwrap_err();
        assert_eq!(info.cls_name.as_deref(), Some("SnapshotError"));
    }

    #[test]
    fn test_file_run_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRunSnapshotStore::new(dir.path().join("runs"));

        let err = store.get_snapshot("run-1").unwrap_err();
        assert_eq!(err, Error::not_found(EntityKind::Run, "run-1"));

        let repo = ExternalRepository::from_location(
            Arc::new(etl_repository("analytics")),
            CodeLocationOrigin::InProcess(InProcessOrigin::new("defs")),
        );
        let job = repo.get_job("etl_job").unwrap();
        let payload = HistoricalJobSnapshot::for_job(&job).to_payload().unwrap();
        store.put_snapshot("run-1", payload).unwrap();

        let historical = HistoricalJob::from_store(&store, "run-1").unwrap();
        assert_eq!(historical.run_id(), "run-1");
        assert_eq!(historical.name(), "etl_job");
    }

    #[test]
    fn test_io_failures_are_fetch_errors() {
        init_test_logging();
        let dir = tempfile::tempdir().unwrap();

        // The store directory is a plain file.
        let blocker = dir.path().join("runs");
        std::fs::write(&blocker, "").unwrap();
        let store = FileRunSnapshotStore::new(&blocker);
        let err = store.put_snapshot("run-1", "{}".to_string()).unwrap_err();
        assert!(matches!(err, Error::SnapshotFetch { .. }), "{:?}", err);

        // The run entry is a directory, not a file.
        let store = FileRunSnapshotStore::new(dir.path());
        std::fs::create_dir(dir.path().join("run-2.json")).unwrap();
        let err = store.get_snapshot("run-2").unwrap_err();
        assert!(matches!(err, Error::SnapshotFetch { .. }), "{:?}", err);
        assert!(!err.is_not_found());

        let err = SnapshotFileProvider::write(dir.path(), &RepositorySnapshots::new()).unwrap_err();
        assert!(matches!(err, Error::SnapshotFetch { .. }), "{:?}", err);
    }

    #[test]
    fn test_run_ids_cannot_escape_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRunSnapshotStore::new(dir.path());
        assert!(store.get_snapshot("../etc/passwd").unwrap_err().is_not_found());
        assert!(store
            .put_snapshot("a/b", "{}".to_string())
            .unwrap_err()
            .is_not_found());
    }
}
