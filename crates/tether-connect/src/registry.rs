//! CodeLocationRegistry: the set of code locations a host knows about
//!
//! Locations are registered by origin and connected lazily on first use.
//! The registry is an ordinary value; a host may keep as many as it likes.

use crate::location::{
    connect, CodeLocation, CodeLocationConfig, DefinitionTargets, DefinitionsProvider,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tether_core::{CodeLocationOrigin, EntityKind, Error, Result};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Status of a registered code location
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationStatus {
    /// Registered but never connected
    Registered,
    /// Connected and serving snapshots
    Connected,
    /// The last connection attempt failed
    Failed,
    /// Connection released by the host
    Disconnected,
}

impl LocationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocationStatus::Registered => "registered",
            LocationStatus::Connected => "connected",
            LocationStatus::Failed => "failed",
            LocationStatus::Disconnected => "disconnected",
        }
    }
}

/// What the registry knows about one location
#[derive(Debug, Clone)]
pub struct LocationEntry {
    pub origin: CodeLocationOrigin,

    pub status: LocationStatus,

    /// Message of the last failed connect or reload
    pub last_error: Option<String>,

    /// Identity of the serving process while connected
    pub server_id: Option<String>,
}

impl LocationEntry {
    fn new(origin: CodeLocationOrigin) -> Self {
        Self {
            origin,
            status: LocationStatus::Registered,
            last_error: None,
            server_id: None,
        }
    }

    fn failed(&mut self, err: &Error) {
        self.status = LocationStatus::Failed;
        self.last_error = Some(err.to_string());
        self.server_id = None;
    }

    fn connected(&mut self, location: &dyn CodeLocation) {
        self.status = LocationStatus::Connected;
        self.last_error = None;
        self.server_id = location.server_id();
    }
}

/// Registry of code locations for one host
///
/// # Example
///
/// ```rust,no_run
/// use tether_connect::{CodeLocation, CodeLocationConfig, CodeLocationRegistry};
/// use tether_core::{CodeLocationOrigin, GrpcServerOrigin};
///
/// # async fn example() -> tether_core::Result<()> {
/// let registry = CodeLocationRegistry::new(CodeLocationConfig::default());
/// registry
///     .register(CodeLocationOrigin::GrpcServer(GrpcServerOrigin::tcp(
///         "analytics",
///         "localhost",
///         4266,
///     )))
///     .await;
///
/// let location = registry.get_location("analytics").await?;
/// let repositories = location.get_repositories().await?;
/// # Ok(())
/// # }
/// ```
pub struct CodeLocationRegistry {
    config: CodeLocationConfig,

    /// Providers in-process origins may name as their target
    targets: Arc<RwLock<DefinitionTargets>>,

    /// Known locations (name -> entry)
    entries: Arc<RwLock<BTreeMap<String, LocationEntry>>>,

    /// Live connections (name -> location)
    locations: Arc<RwLock<HashMap<String, Arc<dyn CodeLocation>>>>,
}

impl CodeLocationRegistry {
    pub fn new(config: CodeLocationConfig) -> Self {
        Self {
            config,
            targets: Arc::new(RwLock::new(DefinitionTargets::new())),
            entries: Arc::new(RwLock::new(BTreeMap::new())),
            locations: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &CodeLocationConfig {
        &self.config
    }

    /// Make a provider available to in-process origins under `name`
    pub async fn register_target<N: Into<String>>(
        &self,
        name: N,
        provider: Arc<dyn DefinitionsProvider>,
    ) {
        let name = name.into();
        debug!("Registering definitions target {}", name);
        self.targets.write().await.insert(name, provider);
    }

    /// Add a location without connecting to it
    ///
    /// Registering a name again replaces its origin; a live connection to
    /// the old origin is shut down.
    pub async fn register(&self, origin: CodeLocationOrigin) {
        let name = origin.location_name().to_string();
        info!("Registering code location {}", name);

        let replaced = {
            let mut entries = self.entries.write().await;
            entries
                .insert(name.clone(), LocationEntry::new(origin.clone()))
                .is_some_and(|old| old.origin != origin)
        };
        if replaced {
            self.release(&name).await;
        }
    }

    /// Forget a location, shutting down its connection
    pub async fn unregister(&self, name: &str) -> Result<()> {
        info!("Unregistering code location {}", name);
        self.entries
            .write()
            .await
            .remove(name)
            .ok_or_else(|| Error::not_found(EntityKind::CodeLocation, name))?;
        self.release(name).await;
        Ok(())
    }

    /// Live location for `name`, connecting on first use
    pub async fn get_location(&self, name: &str) -> Result<Arc<dyn CodeLocation>> {
        {
            let locations = self.locations.read().await;
            if let Some(location) = locations.get(name) {
                return Ok(location.clone());
            }
        }

        let origin = self.origin(name).await?;
        let location = self.open(name, &origin).await?;

        // Another caller may have connected while we were dialing.
        let mut locations = self.locations.write().await;
        if let Some(existing) = locations.get(name) {
            let existing = existing.clone();
            drop(locations);
            if let Err(e) = location.shutdown().await {
                warn!("Failed to release duplicate connection to {}: {}", name, e);
            }
            return Ok(existing);
        }
        locations.insert(name.to_string(), location.clone());
        Ok(location)
    }

    /// Replace the connection for `name` with a fresh one
    ///
    /// The old connection keeps serving until the new one is up; if the new
    /// one fails the old one stays in place, and the entry records the
    /// failure.
    pub async fn reload(&self, name: &str) -> Result<Arc<dyn CodeLocation>> {
        let origin = self.origin(name).await?;
        if !origin.is_reload_supported() {
            return Err(Error::fetch(name, "location does not support reload"));
        }
        info!("Reloading code location {}", name);

        let location = self.open(name, &origin).await?;
        if let Err(e) = location.get_repositories().await {
            warn!("Reload of {} failed: {}", name, e);
            if let Some(entry) = self.entries.write().await.get_mut(name) {
                entry.failed(&e);
            }
            if let Err(shutdown) = location.shutdown().await {
                warn!("Failed to release failed reload of {}: {}", name, shutdown);
            }
            return Err(e);
        }

        let old = self
            .locations
            .write()
            .await
            .insert(name.to_string(), location.clone());
        if let Some(old) = old {
            if let Err(e) = old.shutdown().await {
                warn!("Failed to shut down previous connection to {}: {}", name, e);
            }
        }
        Ok(location)
    }

    /// Release the connection to `name` but keep it registered
    pub async fn disconnect(&self, name: &str) {
        info!("Disconnecting from code location {}", name);
        self.release(name).await;

        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(name) {
            entry.status = LocationStatus::Disconnected;
            entry.server_id = None;
        }
    }

    pub async fn disconnect_all(&self) {
        info!("Disconnecting from all code locations");
        let drained: Vec<_> = self.locations.write().await.drain().collect();
        for (name, location) in drained {
            if let Err(e) = location.shutdown().await {
                warn!("Failed to shut down {}: {}", name, e);
            }
        }

        let mut entries = self.entries.write().await;
        for entry in entries.values_mut() {
            if entry.status == LocationStatus::Connected {
                entry.status = LocationStatus::Disconnected;
                entry.server_id = None;
            }
        }
    }

    /// Every registered location, ordered by name
    pub async fn list_entries(&self) -> Vec<(String, LocationEntry)> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .map(|(name, entry)| (name.clone(), entry.clone()))
            .collect()
    }

    pub async fn is_connected(&self, name: &str) -> bool {
        self.locations.read().await.contains_key(name)
    }

    /// Heartbeat every live connection
    ///
    /// A failed heartbeat marks the entry failed but keeps the connection, so
    /// cached snapshots stay readable.
    pub async fn heartbeat_all(&self) -> BTreeMap<String, Result<()>> {
        let live: Vec<_> = {
            let locations = self.locations.read().await;
            locations
                .iter()
                .map(|(name, location)| (name.clone(), location.clone()))
                .collect()
        };

        let mut results = BTreeMap::new();
        for (name, location) in live {
            let result = location.heartbeat().await;
            {
                let mut entries = self.entries.write().await;
                if let Some(entry) = entries.get_mut(&name) {
                    match &result {
                        Ok(()) => entry.connected(location.as_ref()),
                        Err(e) => {
                            warn!("Heartbeat to {} failed: {}", name, e);
                            entry.failed(e);
                        }
                    }
                }
            }
            results.insert(name, result);
        }
        results
    }

    /// Live location whose origin is exactly `origin`
    pub async fn location_for_origin(
        &self,
        origin: &CodeLocationOrigin,
    ) -> Result<Arc<dyn CodeLocation>> {
        let name = origin.location_name();
        if self.origin(name).await? != *origin {
            return Err(Error::not_found(
                EntityKind::CodeLocation,
                format!("{} (origin {})", name, origin.get_id()),
            ));
        }
        self.get_location(name).await
    }

    async fn origin(&self, name: &str) -> Result<CodeLocationOrigin> {
        let entries = self.entries.read().await;
        entries
            .get(name)
            .map(|entry| entry.origin.clone())
            .ok_or_else(|| Error::not_found(EntityKind::CodeLocation, name))
    }

    /// Connect and record the outcome on the entry
    async fn open(&self, name: &str, origin: &CodeLocationOrigin) -> Result<Arc<dyn CodeLocation>> {
        let targets = self.targets.read().await.clone();
        let result = connect(origin, &self.config, &targets).await;

        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(name) {
            match &result {
                Ok(location) => entry.connected(location.as_ref()),
                Err(e) => {
                    warn!("Failed to connect to code location {}: {}", name, e);
                    entry.failed(e);
                }
            }
        }
        result
    }

    async fn release(&self, name: &str) {
        let removed = self.locations.write().await.remove(name);
        if let Some(location) = removed {
            if let Err(e) = location.shutdown().await {
                warn!("Failed to shut down {}: {}", name, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tether_core::snapshot::{ExternalRepositoryData, SerializableErrorInfo};
    use tether_core::testing::etl_repository;
    use tether_core::{GrpcServerOrigin, InProcessOrigin};

    #[derive(Default)]
    struct Toggle {
        broken: AtomicBool,
    }

    impl DefinitionsProvider for Toggle {
        fn load_repositories(
            &self,
        ) -> std::result::Result<Vec<ExternalRepositoryData>, SerializableErrorInfo> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(SerializableErrorInfo::new("syntax error in definitions"));
            }
            Ok(vec![etl_repository("analytics")])
        }
    }

    fn in_process(name: &str) -> CodeLocationOrigin {
        CodeLocationOrigin::InProcess(InProcessOrigin::named(name, "defs"))
    }

    async fn registry(provider: Arc<Toggle>) -> CodeLocationRegistry {
        let registry = CodeLocationRegistry::new(CodeLocationConfig::default());
        registry.register_target("defs", provider).await;
        registry
    }

    #[tokio::test]
    async fn test_register_and_list() {
        let registry = registry(Arc::new(Toggle::default())).await;
        registry.register(in_process("b")).await;
        registry.register(in_process("a")).await;

        let entries = registry.list_entries().await;
        let names: Vec<_> = entries.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(entries
            .iter()
            .all(|(_, e)| e.status == LocationStatus::Registered));
    }

    #[tokio::test]
    async fn test_lazy_connect_reuses_location() {
        let registry = registry(Arc::new(Toggle::default())).await;
        registry.register(in_process("etl")).await;
        assert!(!registry.is_connected("etl").await);

        let first = registry.get_location("etl").await.unwrap();
        let second = registry.get_location("etl").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let (_, entry) = &registry.list_entries().await[0];
        assert_eq!(entry.status, LocationStatus::Connected);
        assert!(entry.server_id.is_some());
    }

    #[tokio::test]
    async fn test_unknown_location() {
        let registry = registry(Arc::new(Toggle::default())).await;
        let err = registry.get_location("nope").await.err().unwrap();
        assert_eq!(err, Error::not_found(EntityKind::CodeLocation, "nope"));
        assert!(registry.unregister("nope").await.is_err());
    }

    #[tokio::test]
    async fn test_failed_connect_is_recorded() {
        let registry = registry(Arc::new(Toggle::default())).await;
        registry
            .register(CodeLocationOrigin::InProcess(InProcessOrigin::named(
                "etl", "missing",
            )))
            .await;

        assert!(registry.get_location("etl").await.is_err());
        let (_, entry) = &registry.list_entries().await[0];
        assert_eq!(entry.status, LocationStatus::Failed);
        assert!(entry.last_error.as_deref().unwrap().contains("missing"));
    }

    #[tokio::test]
    async fn test_reload_swaps_location() {
        let provider = Arc::new(Toggle::default());
        let registry = registry(provider.clone()).await;
        registry.register(in_process("etl")).await;

        let old = registry.get_location("etl").await.unwrap();
        old.get_repositories().await.unwrap();

        let new = registry.reload("etl").await.unwrap();
        assert!(!Arc::ptr_eq(&old, &new));
        assert!(old.cached_repositories().is_none());
        assert!(new.cached_repositories().is_some());
        assert!(Arc::ptr_eq(&registry.get_location("etl").await.unwrap(), &new));
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_old_location() {
        let provider = Arc::new(Toggle::default());
        let registry = registry(provider.clone()).await;
        registry.register(in_process("etl")).await;
        let old = registry.get_location("etl").await.unwrap();
        old.get_repositories().await.unwrap();

        provider.broken.store(true, Ordering::SeqCst);
        assert!(matches!(
            registry.reload("etl").await.err().unwrap(),
            Error::UserCode(_)
        ));

        let current = registry.get_location("etl").await.unwrap();
        assert!(Arc::ptr_eq(&current, &old));
        assert!(current.cached_repositories().is_some());

        let (_, entry) = &registry.list_entries().await[0];
        assert_eq!(entry.status, LocationStatus::Failed);
        assert!(entry
            .last_error
            .as_deref()
            .unwrap()
            .contains("syntax error in definitions"));

        // A successful reload clears the failure.
        provider.broken.store(false, Ordering::SeqCst);
        registry.reload("etl").await.unwrap();
        let (_, entry) = &registry.list_entries().await[0];
        assert_eq!(entry.status, LocationStatus::Connected);
        assert!(entry.last_error.is_none());
    }

    #[tokio::test]
    async fn test_disconnect_and_unregister() {
        let registry = registry(Arc::new(Toggle::default())).await;
        registry.register(in_process("a")).await;
        registry.register(in_process("b")).await;
        registry.get_location("a").await.unwrap();
        registry.get_location("b").await.unwrap();

        registry.disconnect("a").await;
        assert!(!registry.is_connected("a").await);
        assert!(registry.is_connected("b").await);

        registry.disconnect_all().await;
        let entries = registry.list_entries().await;
        assert!(entries
            .iter()
            .all(|(_, e)| e.status == LocationStatus::Disconnected));

        registry.unregister("a").await.unwrap();
        assert_eq!(registry.list_entries().await.len(), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_all() {
        let registry = registry(Arc::new(Toggle::default())).await;
        registry.register(in_process("etl")).await;
        registry.get_location("etl").await.unwrap();

        let results = registry.heartbeat_all().await;
        assert_eq!(results.len(), 1);
        assert!(results["etl"].is_ok());
    }

    #[tokio::test]
    async fn test_location_for_origin() {
        let registry = registry(Arc::new(Toggle::default())).await;
        registry.register(in_process("etl")).await;

        let location = registry.location_for_origin(&in_process("etl")).await.unwrap();
        assert_eq!(location.name(), "etl");

        let other = CodeLocationOrigin::GrpcServer(GrpcServerOrigin::tcp("etl", "localhost", 4266));
        assert!(registry
            .location_for_origin(&other)
            .await
            .err()
            .unwrap()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_reregister_with_new_origin_drops_connection() {
        let registry = registry(Arc::new(Toggle::default())).await;
        registry.register(in_process("etl")).await;
        registry.get_location("etl").await.unwrap();

        registry
            .register(CodeLocationOrigin::InProcess(InProcessOrigin::named(
                "etl", "defs_v2",
            )))
            .await;
        assert!(!registry.is_connected("etl").await);
    }
}
