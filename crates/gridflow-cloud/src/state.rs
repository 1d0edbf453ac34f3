//! Cluster state store
//!
//! Persists one [`ClusterRecord`] per cluster and is its only writer. Every
//! mutating sequence runs under a per-cluster lease; a second requester gets
//! `StateConflict` right away instead of queueing. Reads (`load`, `list`)
//! take no lock: writes are atomic, so a reader sees either the previous or
//! the new record.
//!
//! File layout under the state directory:
//!
//! ```text
//! clusters/<cid>.json         current record
//! clusters/<cid>.json.backup  previous record
//! clusters/<cid>.lock         cross-process lock (stale after one hour)
//! last-cluster                id of the most recently created cluster
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gridflow_core::{ClusterError, ClusterRecord, Result, RECORD_VERSION};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::OwnedMutexGuard;

const CLUSTERS_DIR: &str = "clusters";
const LAST_CLUSTER_FILE: &str = "last-cluster";
const STALE_LOCK_HOURS: i64 = 1;

/// Byte-level persistence of cluster records.
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Stored bytes of a record, `None` when there is none.
    async fn read(&self, cluster_id: &str) -> Result<Option<Vec<u8>>>;

    /// Replaces a record atomically.
    async fn write(&self, cluster_id: &str, bytes: &[u8]) -> Result<()>;

    async fn remove(&self, cluster_id: &str) -> Result<()>;

    async fn list_ids(&self) -> Result<Vec<String>>;

    /// Takes the cross-process lock of a cluster. `None` when another holder
    /// owns it.
    async fn acquire_lock(&self, cluster_id: &str, holder: &str) -> Result<Option<StateLock>>;

    async fn read_last_cluster(&self) -> Result<Option<String>>;

    async fn write_last_cluster(&self, cluster_id: &str) -> Result<()>;
}

/// Lock information
#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    holder: String,
    acquired_at: DateTime<Utc>,
}

/// RAII guard for a backend lock
pub struct StateLock {
    release: LockRelease,
    released: bool,
}

enum LockRelease {
    File(PathBuf),
    Memory(Arc<Mutex<HashSet<String>>>, String),
}

impl StateLock {
    fn file(path: PathBuf) -> Self {
        Self {
            release: LockRelease::File(path),
            released: false,
        }
    }

    fn memory(held: Arc<Mutex<HashSet<String>>>, cluster_id: String) -> Self {
        Self {
            release: LockRelease::Memory(held, cluster_id),
            released: false,
        }
    }

    /// Release the lock
    pub async fn release(mut self) -> Result<()> {
        if !self.released {
            match &self.release {
                LockRelease::File(path) => {
                    if fs::try_exists(path).await? {
                        fs::remove_file(path).await?;
                        tracing::debug!(lock = %path.display(), "Released state lock");
                    }
                }
                LockRelease::Memory(held, cluster_id) => {
                    held.lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .remove(cluster_id);
                }
            }
            self.released = true;
        }
        Ok(())
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match &self.release {
            // Synchronous cleanup in drop
            LockRelease::File(path) => match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(
                    lock = %path.display(),
                    error = %e,
                    "Could not remove state lock, it blocks the cluster until it goes stale"
                ),
            },
            LockRelease::Memory(held, cluster_id) => {
                held.lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .remove(cluster_id);
            }
        }
    }
}

/// Cluster ids end up in file names.
fn check_id(cluster_id: &str) -> Result<()> {
    let valid = !cluster_id.is_empty()
        && cluster_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(ClusterError::StateError(format!(
            "invalid cluster id '{}'",
            cluster_id
        )))
    }
}

/// Records as JSON files in a state directory.
pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn clusters_dir(&self) -> PathBuf {
        self.root.join(CLUSTERS_DIR)
    }

    fn record_path(&self, cluster_id: &str) -> PathBuf {
        self.clusters_dir().join(format!("{}.json", cluster_id))
    }

    fn backup_path(&self, cluster_id: &str) -> PathBuf {
        self.clusters_dir().join(format!("{}.json.backup", cluster_id))
    }

    fn temp_path(&self, cluster_id: &str) -> PathBuf {
        self.clusters_dir().join(format!(".{}.json.tmp", cluster_id))
    }

    fn lock_path(&self, cluster_id: &str) -> PathBuf {
        self.clusters_dir().join(format!("{}.lock", cluster_id))
    }

    /// Ensure the state directory exists
    async fn ensure_dir(&self) -> Result<()> {
        let dir = self.clusters_dir();
        if !fs::try_exists(&dir).await? {
            fs::create_dir_all(&dir).await?;
            tracing::debug!(dir = %dir.display(), "Created state directory");
        }
        Ok(())
    }

    /// Creates the lock file unless it exists.
    async fn create_lock(&self, path: &Path, holder: &str) -> Result<bool> {
        let info = LockInfo {
            holder: holder.to_string(),
            acquired_at: Utc::now(),
        };
        let created = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await;
        match created {
            Ok(mut file) => {
                file.write_all(&serde_json::to_vec_pretty(&info)?).await?;
                file.sync_all().await?;
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl StateBackend for FileBackend {
    async fn read(&self, cluster_id: &str) -> Result<Option<Vec<u8>>> {
        check_id(cluster_id)?;
        match fs::read(self.record_path(cluster_id)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, cluster_id: &str, bytes: &[u8]) -> Result<()> {
        check_id(cluster_id)?;
        self.ensure_dir().await?;

        let path = self.record_path(cluster_id);
        let temp = self.temp_path(cluster_id);

        let mut file = fs::File::create(&temp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);

        if fs::try_exists(&path).await? {
            fs::copy(&path, self.backup_path(cluster_id)).await?;
        }
        fs::rename(&temp, &path).await?;

        tracing::debug!(cluster_id, bytes = bytes.len(), "Saved cluster record");
        Ok(())
    }

    async fn remove(&self, cluster_id: &str) -> Result<()> {
        check_id(cluster_id)?;
        for path in [self.record_path(cluster_id), self.backup_path(cluster_id)] {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        tracing::debug!(cluster_id, "Removed cluster record");
        Ok(())
    }

    async fn list_ids(&self) -> Result<Vec<String>> {
        let dir = self.clusters_dir();
        if !fs::try_exists(&dir).await? {
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(id) = name.strip_suffix(".json") {
                if check_id(id).is_ok() {
                    ids.push(id.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn acquire_lock(&self, cluster_id: &str, holder: &str) -> Result<Option<StateLock>> {
        check_id(cluster_id)?;
        self.ensure_dir().await?;
        let path = self.lock_path(cluster_id);

        if self.create_lock(&path, holder).await? {
            tracing::debug!(cluster_id, "Acquired state lock");
            return Ok(Some(StateLock::file(path)));
        }

        // Check if the existing lock is stale
        let content = fs::read_to_string(&path).await?;
        let stale = match serde_json::from_str::<LockInfo>(&content) {
            Ok(info) => {
                let age = Utc::now().signed_duration_since(info.acquired_at);
                if age.num_hours() < STALE_LOCK_HOURS {
                    tracing::debug!(
                        cluster_id,
                        holder = %info.holder,
                        since = %info.acquired_at,
                        "Cluster is locked"
                    );
                    false
                } else {
                    tracing::warn!(cluster_id, holder = %info.holder, "Removing stale lock");
                    true
                }
            }
            Err(_) => {
                tracing::warn!(cluster_id, "Removing unreadable lock");
                true
            }
        };
        if !stale {
            return Ok(None);
        }

        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(cluster_id, lock = %path.display(), error = %e, "Could not remove stale lock");
                return Ok(None);
            }
        }
        if self.create_lock(&path, holder).await? {
            Ok(Some(StateLock::file(path)))
        } else {
            Ok(None)
        }
    }

    async fn read_last_cluster(&self) -> Result<Option<String>> {
        match fs::read_to_string(self.root.join(LAST_CLUSTER_FILE)).await {
            Ok(content) => {
                let id = content.trim();
                Ok((!id.is_empty()).then(|| id.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_last_cluster(&self, cluster_id: &str) -> Result<()> {
        check_id(cluster_id)?;
        fs::create_dir_all(&self.root).await?;
        fs::write(self.root.join(LAST_CLUSTER_FILE), format!("{}\n", cluster_id)).await?;
        Ok(())
    }
}

/// Records kept in memory, for tests and dry runs.
#[derive(Default)]
pub struct MemoryBackend {
    records: Mutex<BTreeMap<String, Vec<u8>>>,
    held: Arc<Mutex<HashSet<String>>>,
    last: Mutex<Option<String>>,
    writes: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of writes performed so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn records(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl StateBackend for MemoryBackend {
    async fn read(&self, cluster_id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.records().get(cluster_id).cloned())
    }

    async fn write(&self, cluster_id: &str, bytes: &[u8]) -> Result<()> {
        self.records().insert(cluster_id.to_string(), bytes.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove(&self, cluster_id: &str) -> Result<()> {
        self.records().remove(cluster_id);
        Ok(())
    }

    async fn list_ids(&self) -> Result<Vec<String>> {
        Ok(self.records().keys().cloned().collect())
    }

    async fn acquire_lock(&self, cluster_id: &str, _holder: &str) -> Result<Option<StateLock>> {
        let inserted = self
            .held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(cluster_id.to_string());
        Ok(inserted.then(|| StateLock::memory(Arc::clone(&self.held), cluster_id.to_string())))
    }

    async fn read_last_cluster(&self) -> Result<Option<String>> {
        Ok(self
            .last
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone())
    }

    async fn write_last_cluster(&self, cluster_id: &str) -> Result<()> {
        *self
            .last
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(cluster_id.to_string());
        Ok(())
    }
}

/// The single writer of cluster records.
pub struct ClusterStore {
    backend: Arc<dyn StateBackend>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    holder: String,
}

impl ClusterStore {
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        let host = std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("HOST"))
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            backend,
            locks: Mutex::new(HashMap::new()),
            holder: format!("{}:{}", host, std::process::id()),
        }
    }

    /// Store backed by a state directory.
    pub fn open(root: impl AsRef<Path>) -> Self {
        Self::new(Arc::new(FileBackend::new(root)))
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    pub fn backend(&self) -> &Arc<dyn StateBackend> {
        &self.backend
    }

    /// Loads a record; `NotFound` when the cluster is unknown.
    pub async fn load(&self, cluster_id: &str) -> Result<ClusterRecord> {
        self.try_load(cluster_id)
            .await?
            .ok_or_else(|| ClusterError::NotFound(cluster_id.to_string()))
    }

    pub async fn try_load(&self, cluster_id: &str) -> Result<Option<ClusterRecord>> {
        let Some(bytes) = self.backend.read(cluster_id).await? else {
            return Ok(None);
        };
        let record: ClusterRecord = serde_json::from_slice(&bytes)?;

        // Version check
        if record.version > RECORD_VERSION {
            return Err(ClusterError::StateError(format!(
                "record of cluster {} has version {}, newer than supported version {}",
                cluster_id, record.version, RECORD_VERSION
            )));
        }
        Ok(Some(record))
    }

    /// Every stored record, without locking.
    pub async fn list(&self) -> Result<Vec<ClusterRecord>> {
        let mut records = Vec::new();
        for id in self.backend.list_ids().await? {
            match self.try_load(&id).await {
                Ok(Some(record)) => records.push(record),
                // removed since listing
                Ok(None) => {}
                Err(e) => tracing::warn!(cluster_id = %id, error = %e, "Skipping unreadable record"),
            }
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    /// Saves a record under a short-lived lease.
    pub async fn save(&self, record: &ClusterRecord) -> Result<bool> {
        let lease = self.lock(&record.cluster_id).await?;
        let written = lease.save(record).await?;
        lease.release().await?;
        Ok(written)
    }

    /// Applies `mutator` to the stored record under the cluster lease and
    /// saves the result.
    pub async fn update<T, F>(&self, cluster_id: &str, mutator: F) -> Result<T>
    where
        F: FnOnce(&mut ClusterRecord) -> Result<T>,
    {
        let lease = self.lock(cluster_id).await?;
        let value = lease.update(mutator).await?;
        lease.release().await?;
        Ok(value)
    }

    /// Takes the exclusive lease of a cluster.
    ///
    /// Fails with `StateConflict` when another operation, in this process or
    /// another one, holds it.
    pub async fn lock(&self, cluster_id: &str) -> Result<ClusterLease<'_>> {
        let mutex = {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            Arc::clone(locks.entry(cluster_id.to_string()).or_default())
        };
        let guard = mutex
            .try_lock_owned()
            .map_err(|_| ClusterError::StateConflict(cluster_id.to_string()))?;

        let file = self
            .backend
            .acquire_lock(cluster_id, &self.holder)
            .await?
            .ok_or_else(|| ClusterError::StateConflict(cluster_id.to_string()))?;

        tracing::debug!(cluster_id, "Acquired cluster lease");
        Ok(ClusterLease {
            store: self,
            cluster_id: cluster_id.to_string(),
            file: Some(file),
            _guard: guard,
        })
    }

    pub async fn last_cluster(&self) -> Result<Option<String>> {
        self.backend.read_last_cluster().await
    }

    pub async fn remember(&self, cluster_id: &str) -> Result<()> {
        self.backend.write_last_cluster(cluster_id).await
    }

    async fn write(&self, record: &ClusterRecord) -> Result<bool> {
        let bytes = serde_json::to_vec_pretty(record)?;
        if self.backend.read(&record.cluster_id).await?.as_deref() == Some(bytes.as_slice()) {
            tracing::debug!(cluster_id = %record.cluster_id, "Record unchanged, nothing written");
            return Ok(false);
        }
        self.backend.write(&record.cluster_id, &bytes).await?;
        Ok(true)
    }
}

/// Exclusive access to one cluster record.
pub struct ClusterLease<'a> {
    store: &'a ClusterStore,
    cluster_id: String,
    file: Option<StateLock>,
    _guard: OwnedMutexGuard<()>,
}

impl ClusterLease<'_> {
    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    pub async fn load(&self) -> Result<ClusterRecord> {
        self.store.load(&self.cluster_id).await
    }

    pub async fn try_load(&self) -> Result<Option<ClusterRecord>> {
        self.store.try_load(&self.cluster_id).await
    }

    /// Writes the record unless the stored bytes are identical. Returns
    /// whether anything was written.
    pub async fn save(&self, record: &ClusterRecord) -> Result<bool> {
        self.check(record)?;
        self.store.write(record).await
    }

    pub async fn update<T, F>(&self, mutator: F) -> Result<T>
    where
        F: FnOnce(&mut ClusterRecord) -> Result<T>,
    {
        let mut record = self.load().await?;
        let value = mutator(&mut record)?;
        record.touch();
        self.save(&record).await?;
        Ok(value)
    }

    /// Deletes the record. Only allowed once every resource is released.
    pub async fn remove(&self, record: &ClusterRecord) -> Result<()> {
        self.check(record)?;
        if !record.is_releasable() {
            let live: Vec<String> = record.live_resources().map(|r| r.id.to_string()).collect();
            return Err(ClusterError::InvalidOperation(format!(
                "cluster {} still owns resources: {}",
                self.cluster_id,
                live.join(", ")
            )));
        }
        self.store.backend.remove(&self.cluster_id).await
    }

    pub async fn release(mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            file.release().await?;
        }
        Ok(())
    }

    fn check(&self, record: &ClusterRecord) -> Result<()> {
        if record.cluster_id != self.cluster_id {
            return Err(ClusterError::StateError(format!(
                "lease of cluster {} cannot write cluster {}",
                self.cluster_id, record.cluster_id
            )));
        }
        Ok(())
    }
}
