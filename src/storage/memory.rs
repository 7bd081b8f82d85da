//! In-memory backend with optional snapshot persistence.
//!
//! Collections are ordered maps of JSON values behind a single `RwLock`. When a
//! snapshot directory is configured, every committed mutation rewrites
//! `<dir>/snapshot.bin` (bincode envelope, JSON-encoded values) through a temp
//! file and rename; a mutation whose snapshot write fails is rolled back and
//! reported as an infrastructure error, so memory never runs ahead of disk.
//!
//! The snapshot write is synchronous and happens under the state write lock,
//! blocking the calling runtime thread for the duration of the write. That
//! keeps files in commit order and is acceptable at data-room sizes (tens to
//! hundreds of records); larger deployments belong on a networked backend.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{Backend, ChangeEvent, ChangeKind, CollectionWatch, CreateOutcome, Filter};
use crate::error::{AppError, AppResult};
use crate::types::now_millis;

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotSettings {
    pub dir: PathBuf,
}

impl SnapshotSettings {
    pub fn new(dir: impl Into<PathBuf>) -> Self { Self { dir: dir.into() } }
    fn snapshot_path(&self) -> PathBuf { self.dir.join("snapshot.bin") }
}

#[derive(Serialize, Deserialize)]
struct SnapEntry { collection: String, key: String, json: Vec<u8> }

#[derive(Serialize, Deserialize)]
struct Snapshot { version: u32, created_ms: i64, seq: u64, entries: Vec<SnapEntry> }

#[derive(Default)]
struct State {
    seq: u64,
    collections: HashMap<String, BTreeMap<String, Value>>,
}

#[derive(Clone)]
pub struct MemoryBackend {
    state: Arc<RwLock<State>>,
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<ChangeEvent>>>>,
    snapshot: Option<SnapshotSettings>,
    channel_capacity: usize,
    available: Arc<AtomicBool>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(State::default())),
            channels: Arc::new(RwLock::new(HashMap::new())),
            snapshot: None,
            channel_capacity: 1024,
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Open a persistent backend, loading an existing snapshot if present.
    pub fn open(settings: SnapshotSettings) -> AppResult<Self> {
        std::fs::create_dir_all(&settings.dir)?;
        let mut backend = Self::new();
        let path = settings.snapshot_path();
        if path.exists() {
            let bytes = std::fs::read(&path)?;
            let snap: Snapshot = bincode::deserialize(&bytes)
                .map_err(|e| AppError::infrastructure("snapshot_corrupt".to_string(), format!("{}: {}", path.display(), e)))?;
            if snap.version != SNAPSHOT_VERSION {
                return Err(AppError::infrastructure("snapshot_version".to_string(), format!("unsupported snapshot version {}", snap.version)));
            }
            let mut st = backend.state.write();
            st.seq = snap.seq;
            let mut loaded = 0usize;
            for e in snap.entries.into_iter() {
                match serde_json::from_slice::<Value>(&e.json) {
                    Ok(v) => {
                        st.collections.entry(e.collection).or_default().insert(e.key, v);
                        loaded += 1;
                    }
                    Err(err) => warn!(target: "dataroom::storage", "skipping undecodable snapshot entry {}/{}: {}", e.collection, e.key, err),
                }
            }
            info!(target: "dataroom::storage", "loaded snapshot '{}': entries={} seq={}", path.display(), loaded, snap.seq);
        }
        backend.snapshot = Some(settings);
        Ok(backend)
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// Toggle availability. While unavailable every operation fails with
    /// `backend_unreachable` and nothing is read or written.
    pub fn set_available(&self, available: bool) { self.available.store(available, Ordering::SeqCst); }

    fn ensure_available(&self) -> AppResult<()> {
        if self.available.load(Ordering::SeqCst) { Ok(()) }
        else { Err(AppError::infrastructure("backend_unreachable", "persistence backend is unreachable")) }
    }

    /// Caller holds the state write lock.
    fn persist(&self, st: &State) -> AppResult<()> {
        let Some(settings) = &self.snapshot else { return Ok(()); };
        let mut entries = Vec::new();
        for (collection, docs) in st.collections.iter() {
            for (key, v) in docs.iter() {
                entries.push(SnapEntry { collection: collection.clone(), key: key.clone(), json: serde_json::to_vec(v)? });
            }
        }
        let snap = Snapshot { version: SNAPSHOT_VERSION, created_ms: now_millis(), seq: st.seq, entries };
        let bytes = bincode::serialize(&snap).map_err(|e| AppError::internal("snapshot_encode".to_string(), e.to_string()))?;
        let path = settings.snapshot_path();
        let tmp = path.with_extension("bin.tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(tmp, path)?;
        Ok(())
    }

    fn publish(&self, ev: ChangeEvent) {
        if let Some(tx) = self.channels.read().get(&ev.collection) {
            // No receivers is fine.
            let _ = tx.send(ev);
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self { Self::new() }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn get(&self, collection: &str, key: &str) -> AppResult<Option<Value>> {
        self.ensure_available()?;
        Ok(self.state.read().collections.get(collection).and_then(|c| c.get(key)).cloned())
    }

    async fn create_if_absent(&self, collection: &str, key: &str, value: Value) -> AppResult<CreateOutcome> {
        self.ensure_available()?;
        let mut st = self.state.write();
        if let Some(existing) = st.collections.get(collection).and_then(|c| c.get(key)) {
            return Ok(CreateOutcome::Exists(existing.clone()));
        }
        st.seq += 1;
        let seq = st.seq;
        st.collections.entry(collection.to_string()).or_default().insert(key.to_string(), value.clone());
        if let Err(e) = self.persist(&st) {
            if let Some(c) = st.collections.get_mut(collection) { c.remove(key); }
            st.seq -= 1;
            warn!(target: "dataroom::storage", "create {}/{} rolled back: {}", collection, key, e);
            return Err(e);
        }
        debug!(target: "dataroom::storage", "create {}/{} seq={}", collection, key, seq);
        // Published under the write lock so event order matches commit order.
        self.publish(ChangeEvent { seq, collection: collection.to_string(), key: key.to_string(), kind: ChangeKind::Created(value) });
        Ok(CreateOutcome::Created { seq })
    }

    async fn delete(&self, collection: &str, key: &str) -> AppResult<Option<u64>> {
        self.ensure_available()?;
        let mut st = self.state.write();
        let Some(old) = st.collections.get_mut(collection).and_then(|c| c.remove(key)) else {
            return Ok(None);
        };
        st.seq += 1;
        let seq = st.seq;
        if let Err(e) = self.persist(&st) {
            st.collections.entry(collection.to_string()).or_default().insert(key.to_string(), old);
            st.seq -= 1;
            warn!(target: "dataroom::storage", "delete {}/{} rolled back: {}", collection, key, e);
            return Err(e);
        }
        debug!(target: "dataroom::storage", "delete {}/{} seq={}", collection, key, seq);
        self.publish(ChangeEvent { seq, collection: collection.to_string(), key: key.to_string(), kind: ChangeKind::Deleted(old) });
        Ok(Some(seq))
    }

    async fn scan(&self, collection: &str) -> AppResult<Vec<(String, Value)>> {
        self.ensure_available()?;
        let st = self.state.read();
        Ok(st.collections.get(collection)
            .map(|c| c.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn watch(&self, collection: &str, filter: Filter) -> AppResult<CollectionWatch> {
        self.ensure_available()?;
        // Hold the state lock while subscribing: no mutation can commit between
        // the snapshot and the receiver creation.
        let st = self.state.read();
        let rx = {
            let mut ch = self.channels.write();
            ch.entry(collection.to_string())
                .or_insert_with(|| broadcast::channel(self.channel_capacity).0)
                .subscribe()
        };
        let entries = st.collections.get(collection)
            .map(|c| c.iter().filter(|(_, v)| filter.matches(v)).map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        Ok(CollectionWatch::new(st.seq, entries, filter, rx))
    }
}
