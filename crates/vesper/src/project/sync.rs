//! Configuration Sync
//!
//! Keeps a registry of live entities in step with the files of one directory.
//! A full load rebuilds everything; a file change applies a minimal diff so
//! unchanged entities keep their identity and state.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, error, info, warn};

use super::loader::{self, LoadError};
use super::node::{ConfigError, ConfigNode, is_disabled};

/// An entity defined by one top-level table of a configuration file
pub trait Managed: Send + Sync + Sized + 'static {
    /// Shared dependencies handed to every entity of this kind
    type Env: Send + Sync + 'static;

    /// Entity kind used in log output
    const KIND: &'static str;

    /// Build a new entity from its configuration
    fn create(id: &str, path: &Path, node: ConfigNode, env: &Self::Env) -> Result<Arc<Self>, ConfigError>;

    fn id(&self) -> &str;

    /// File the entity was defined in
    fn path(&self) -> &Path;

    /// Apply an updated configuration in place
    fn contrast(self: &Arc<Self>, table: toml::Table, env: &Self::Env);

    /// Release everything the entity holds; it is dropped afterwards
    fn retire(&self, env: &Self::Env);

    /// Called for entities created by an incremental sync
    fn activate(self: &Arc<Self>, _env: &Self::Env) {}

    /// Called once after a full load with every live entity
    fn loaded(_env: &Self::Env, _entities: &[Arc<Self>]) {}
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────────────────

/// Live entities of one kind, keyed by id
pub struct ConfigRegistry<T> {
    entries: DashMap<String, Arc<T>>,
}

impl<T> Default for ConfigRegistry<T> {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl<T> ConfigRegistry<T> {
    /// Get an entity by id
    pub fn get(&self, id: &str) -> Option<Arc<T>> {
        self.entries.get(id).map(|e| Arc::clone(e.value()))
    }

    /// Check if an id is registered
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Snapshot of all entities, sorted by id
    pub fn list(&self) -> Vec<Arc<T>> {
        let mut entries: Vec<(String, Arc<T>)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries.into_iter().map(|(_, v)| v).collect()
    }

    /// All registered ids, sorted
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insert(&self, id: String, entity: Arc<T>) {
        self.entries.insert(id, entity);
    }

    fn remove(&self, id: &str) -> Option<Arc<T>> {
        self.entries.remove(id).map(|(_, v)| v)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Reports
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of a full load
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: usize,
    pub conflicts: usize,
    pub failed: usize,
    pub elapsed: Duration,
}

/// Outcome of syncing one file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub updated: usize,
    pub created: usize,
    pub removed: usize,
    pub conflicts: usize,
    pub failed: usize,
    pub elapsed: Duration,
}

// ─────────────────────────────────────────────────────────────────────────────
// Sync
// ─────────────────────────────────────────────────────────────────────────────

/// Parsed files of a directory, ready to replace a registry
#[derive(Debug)]
pub struct PreparedLoad {
    files: Vec<(PathBuf, toml::Table)>,
    started: Instant,
}

impl PreparedLoad {
    /// Number of files read
    pub fn files(&self) -> usize {
        self.files.len()
    }
}

/// Registry plus the directory that defines it
pub struct ConfigSync<T: Managed> {
    dir: PathBuf,
    registry: ConfigRegistry<T>,
    env: Arc<T::Env>,
    /// Serializes loads and file syncs
    gate: tokio::sync::Mutex<()>,
}

impl<T: Managed> ConfigSync<T> {
    pub fn new(dir: impl Into<PathBuf>, env: Arc<T::Env>) -> Self {
        Self {
            dir: dir.into(),
            registry: ConfigRegistry::default(),
            env,
            gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn registry(&self) -> &ConfigRegistry<T> {
        &self.registry
    }

    pub fn env(&self) -> &Arc<T::Env> {
        &self.env
    }

    /// Get an entity by id
    pub fn get(&self, id: &str) -> Option<Arc<T>> {
        self.registry.get(id)
    }

    /// Discard the registry and rebuild it from every file in the directory.
    ///
    /// All files are parsed before anything is touched; if any fails the
    /// registry is left as it was.
    pub async fn load(&self) -> Result<LoadReport, LoadError> {
        let prepared = self.prepare().await?;
        Ok(self.apply(prepared).await)
    }

    /// Read and parse every file of the directory without touching the
    /// registry
    pub async fn prepare(&self) -> Result<PreparedLoad, LoadError> {
        let started = Instant::now();
        loader::ensure_dir(&self.dir).await?;
        match loader::read_dir_tables(&self.dir).await {
            Ok(files) => Ok(PreparedLoad { files, started }),
            Err(e) => {
                error!(
                    kind = T::KIND,
                    error = %e,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Failed to load, keeping current entries"
                );
                Err(e)
            }
        }
    }

    /// Replace the registry with the entries of a prepared load
    pub async fn apply(&self, prepared: PreparedLoad) -> LoadReport {
        let _gate = self.gate.lock().await;
        let PreparedLoad { files, started } = prepared;

        for entity in self.registry.list() {
            entity.retire(&self.env);
        }
        self.registry.entries.clear();

        let mut report = LoadReport::default();
        for (path, table) in files {
            for (id, value) in table {
                let Some(node) = Self::entry_table(&path, &id, value) else {
                    report.failed += 1;
                    continue;
                };
                if is_disabled(&node) {
                    debug!(kind = T::KIND, id = %id, "Skipping disabled entry");
                    continue;
                }
                if let Some(existing) = self.registry.get(&id) {
                    warn!(
                        kind = T::KIND,
                        id = %id,
                        file = %path.display(),
                        defined_in = %existing.path().display(),
                        "Duplicate id, keeping first definition"
                    );
                    report.conflicts += 1;
                    continue;
                }
                match T::create(&id, &path, ConfigNode::new(node), &self.env) {
                    Ok(entity) => {
                        self.registry.insert(id, entity);
                        report.loaded += 1;
                    }
                    Err(e) => {
                        warn!(kind = T::KIND, error = %e, "Failed to create entry");
                        report.failed += 1;
                    }
                }
            }
        }

        T::loaded(&self.env, &self.registry.list());

        report.elapsed = started.elapsed();
        info!(
            kind = T::KIND,
            count = report.loaded,
            conflicts = report.conflicts,
            failed = report.failed,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Loaded {} entries from {}",
            T::KIND,
            self.dir.display()
        );
        report
    }

    /// Apply the current contents of one file as a diff against the registry.
    ///
    /// Kept ids are updated in place, vanished or disabled ids are retired and
    /// new ids are created. A missing file retires everything it defined.
    pub async fn sync_file(&self, path: &Path) -> Result<SyncReport, LoadError> {
        let _gate = self.gate.lock().await;
        let started = Instant::now();
        let path = loader::normalize_path(path);

        let table = match loader::read_table(&path).await {
            Ok(table) => table.unwrap_or_default(),
            Err(e) => {
                error!(
                    kind = T::KIND,
                    file = %path.display(),
                    error = %e,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Failed to sync file, keeping current entries"
                );
                return Err(e);
            }
        };

        let mut report = SyncReport::default();
        let mut incoming: BTreeMap<String, toml::Table> = BTreeMap::new();
        for (id, value) in table {
            match Self::entry_table(&path, &id, value) {
                Some(node) => {
                    incoming.insert(id, node);
                }
                None => report.failed += 1,
            }
        }

        let owned: Vec<Arc<T>> = self
            .registry
            .list()
            .into_iter()
            .filter(|e| e.path() == path)
            .collect();

        for entity in owned {
            let id = entity.id().to_string();
            match incoming.remove(&id) {
                Some(node) if !is_disabled(&node) => {
                    entity.contrast(node, &self.env);
                    report.updated += 1;
                }
                _ => {
                    debug!(kind = T::KIND, id = %id, "Retiring entry");
                    entity.retire(&self.env);
                    self.registry.remove(&id);
                    report.removed += 1;
                }
            }
        }

        for (id, node) in incoming {
            if is_disabled(&node) {
                continue;
            }
            if let Some(existing) = self.registry.get(&id) {
                warn!(
                    kind = T::KIND,
                    id = %id,
                    file = %path.display(),
                    defined_in = %existing.path().display(),
                    "Duplicate id, keeping first definition"
                );
                report.conflicts += 1;
                continue;
            }
            match T::create(&id, &path, ConfigNode::new(node), &self.env) {
                Ok(entity) => {
                    entity.activate(&self.env);
                    self.registry.insert(id, entity);
                    report.created += 1;
                }
                Err(e) => {
                    warn!(kind = T::KIND, error = %e, "Failed to create entry");
                    report.failed += 1;
                }
            }
        }

        report.elapsed = started.elapsed();
        info!(
            kind = T::KIND,
            file = %path.display(),
            updated = report.updated,
            created = report.created,
            removed = report.removed,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Synced {} file",
            T::KIND
        );
        Ok(report)
    }

    /// Retire and drop every entity
    pub async fn clear(&self) {
        let _gate = self.gate.lock().await;
        for entity in self.registry.list() {
            entity.retire(&self.env);
        }
        self.registry.entries.clear();
    }

    fn entry_table(path: &Path, id: &str, value: toml::Value) -> Option<toml::Table> {
        match value {
            toml::Value::Table(node) => Some(node),
            other => {
                warn!(
                    kind = T::KIND,
                    id = %id,
                    file = %path.display(),
                    found = other.type_str(),
                    "Top-level entry is not a table, skipping"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Journal {
        events: Mutex<Vec<String>>,
    }

    impl Journal {
        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.events.lock())
        }
    }

    struct Entry {
        id: String,
        path: PathBuf,
        node: Mutex<ConfigNode>,
    }

    impl Managed for Entry {
        type Env = Journal;
        const KIND: &'static str = "entry";

        fn create(id: &str, path: &Path, node: ConfigNode, env: &Journal) -> Result<Arc<Self>, ConfigError> {
            if node.get("invalid").is_some() {
                return Err(ConfigError::Validation {
                    kind: "entry",
                    id: id.to_string(),
                    message: "invalid".to_string(),
                });
            }
            env.events.lock().push(format!("create {id}"));
            Ok(Arc::new(Entry {
                id: id.to_string(),
                path: path.to_path_buf(),
                node: Mutex::new(node),
            }))
        }

        fn id(&self) -> &str {
            &self.id
        }

        fn path(&self) -> &Path {
            &self.path
        }

        fn contrast(self: &Arc<Self>, table: toml::Table, env: &Journal) {
            let changed = self.node.lock().update_source(table);
            env.events.lock().push(format!("contrast {} {:?}", self.id, changed));
        }

        fn retire(&self, env: &Journal) {
            env.events.lock().push(format!("retire {}", self.id));
        }

        fn activate(self: &Arc<Self>, env: &Journal) {
            env.events.lock().push(format!("activate {}", self.id));
        }
    }

    fn setup() -> (tempfile::TempDir, ConfigSync<Entry>) {
        let dir = tempfile::tempdir().unwrap();
        let sync = ConfigSync::new(dir.path(), Arc::new(Journal::default()));
        (dir, sync)
    }

    fn write(dir: &tempfile::TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[tokio::test]
    async fn test_load_rejects_conflicts_and_disabled() {
        let (dir, sync) = setup();
        write(&dir, "a.toml", "[one]\nx = 1\n[two]\nx = 1");
        write(&dir, "b.toml", "[one]\nx = 2\n[three]\ndisable = true");

        let report = sync.load().await.unwrap();
        assert_eq!(report.loaded, 2);
        assert_eq!(report.conflicts, 1);
        assert_eq!(sync.registry().ids(), vec!["one", "two"]);
        assert!(sync.get("one").unwrap().path().ends_with("a.toml"));
    }

    #[tokio::test]
    async fn test_failed_load_keeps_registry() {
        let (dir, sync) = setup();
        write(&dir, "a.toml", "[one]\nx = 1");
        sync.load().await.unwrap();

        write(&dir, "b.toml", "[broken");
        assert!(sync.load().await.is_err());
        assert_eq!(sync.registry().ids(), vec!["one"]);
    }

    #[tokio::test]
    async fn test_sync_file_diff() {
        let (dir, sync) = setup();
        let path = write(&dir, "a.toml", "[keep]\nx = 1\n[drop]\nx = 1\n[off]\nx = 1");
        sync.load().await.unwrap();
        let kept = sync.get("keep").unwrap();
        sync.env().take();

        write(&dir, "a.toml", "[keep]\nx = 2\n[off]\ndisable = true\n[new]\nx = 1");
        let report = sync.sync_file(&path).await.unwrap();

        assert_eq!(report.updated, 1);
        assert_eq!(report.removed, 2);
        assert_eq!(report.created, 1);
        assert_eq!(sync.registry().ids(), vec!["keep", "new"]);
        assert!(Arc::ptr_eq(&kept, &sync.get("keep").unwrap()));

        let events = sync.env().take();
        assert!(events.contains(&"contrast keep [\"x\"]".to_string()));
        assert!(events.contains(&"retire drop".to_string()));
        assert!(events.contains(&"retire off".to_string()));
        assert!(events.contains(&"activate new".to_string()));
    }

    #[tokio::test]
    async fn test_sync_file_rejects_foreign_ids() {
        let (dir, sync) = setup();
        write(&dir, "a.toml", "[shared]\nx = 1");
        let b = write(&dir, "b.toml", "");
        sync.load().await.unwrap();

        write(&dir, "b.toml", "[shared]\nx = 2\n[mine]\nx = 1");
        let report = sync.sync_file(&b).await.unwrap();
        assert_eq!(report.conflicts, 1);
        assert_eq!(report.created, 1);
        assert!(sync.get("shared").unwrap().path().ends_with("a.toml"));
    }

    #[tokio::test]
    async fn test_deleted_file_retires_entries() {
        let (dir, sync) = setup();
        let path = write(&dir, "a.toml", "[one]\nx = 1\n[two]\nx = 1");
        write(&dir, "b.toml", "[three]\nx = 1");
        sync.load().await.unwrap();

        std::fs::remove_file(&path).unwrap();
        let report = sync.sync_file(&path).await.unwrap();
        assert_eq!(report.removed, 2);
        assert_eq!(sync.registry().ids(), vec!["three"]);
    }

    #[tokio::test]
    async fn test_sync_parse_error_changes_nothing() {
        let (dir, sync) = setup();
        let path = write(&dir, "a.toml", "[one]\nx = 1");
        sync.load().await.unwrap();

        write(&dir, "a.toml", "[one\nx = ");
        assert!(sync.sync_file(&path).await.is_err());
        assert_eq!(sync.registry().ids(), vec!["one"]);
    }

    #[tokio::test]
    async fn test_create_failure_is_counted() {
        let (dir, sync) = setup();
        write(&dir, "a.toml", "[good]\nx = 1\n[bad]\ninvalid = true\nscalar = 1");
        write(&dir, "c.toml", "loose = 1");

        let report = sync.load().await.unwrap();
        assert_eq!(report.loaded, 1);
        assert_eq!(report.failed, 2);
    }
}
