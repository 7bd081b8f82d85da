//!
//! dataroom document registry
//! --------------------------
//! Persisted collection of document records with role-gated mutation and a
//! live, ordered view pushed to subscribers.
//!
//! One projection task per registry follows the backend's change stream for the
//! documents collection, applies each committed change to an in-memory view and
//! publishes an immutable `DocumentSnapshot` on a `watch` channel. Records are
//! decoded whole before they enter the view; a stored value that does not decode
//! is skipped. If the change stream lags, the view is rebuilt from a fresh
//! `watch` (scan + stream taken together).
//!
//! `add` and `remove` return once the projection has published a snapshot that
//! includes their commit, so any subscriber's next snapshot reflects the change.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult};
use crate::identity::{Action, SessionContext};
use crate::storage::{Backend, ChangeKind, CollectionPaths, CollectionWatch, CreateOutcome, Filter, WatchItem};
use crate::types::{now_millis, DocumentId, DocumentRecord, NewDocument};

mod subscription;

pub use subscription::{DocumentSubscription, SubscriptionId};
use subscription::SubscriberTable;

const PROJECTION_WAIT: Duration = Duration::from_secs(5);
const RESCAN_BACKOFF: Duration = Duration::from_millis(200);

/// One published version of the registry, ordered newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentSnapshot {
    pub version: u64,
    /// Backend commit sequence this view is consistent with.
    #[serde(skip)]
    pub seq: u64,
    pub documents: Vec<DocumentRecord>,
}

impl DocumentSnapshot {
    pub fn contains(&self, id: &DocumentId) -> bool { self.documents.iter().any(|d| &d.id == id) }
    pub fn len(&self) -> usize { self.documents.len() }
    pub fn is_empty(&self) -> bool { self.documents.is_empty() }
}

struct Inner {
    backend: Arc<dyn Backend>,
    collection: String,
    snapshots: watch::Receiver<Arc<DocumentSnapshot>>,
    subscribers: SubscriberTable,
    next_id: AtomicU64,
    projection: JoinHandle<()>,
}

impl Drop for Inner {
    fn drop(&mut self) { self.projection.abort(); }
}

#[derive(Clone)]
pub struct DocumentRegistry {
    inner: Arc<Inner>,
}

impl DocumentRegistry {
    /// Load the current documents and start following changes.
    pub async fn open(backend: Arc<dyn Backend>, paths: &CollectionPaths) -> AppResult<Self> {
        let collection = paths.documents();
        let stream = backend.watch(&collection, Filter::All).await?;
        let mut projection = Projection::new(collection.clone());
        projection.reset(stream.seq, &stream.entries);
        info!(target: "dataroom::registry", "registry open: collection={} documents={} seq={}", collection, projection.view.len(), stream.seq);

        let (tx, rx) = watch::channel(Arc::new(projection.snapshot()));
        let task = tokio::spawn(projection.run(backend.clone(), stream, tx));
        Ok(Self {
            inner: Arc::new(Inner {
                backend,
                collection,
                snapshots: rx,
                subscribers: SubscriberTable::default(),
                next_id: AtomicU64::new(1),
                projection: task,
            }),
        })
    }

    /// Current ordered view without subscribing.
    pub fn snapshot(&self) -> Arc<DocumentSnapshot> { self.inner.snapshots.borrow().clone() }

    pub fn subscribe(&self) -> DocumentSubscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(target: "dataroom::registry", "subscribe id={}", id);
        DocumentSubscription::new(id, self.inner.snapshots.clone(), self.inner.subscribers.clone())
    }

    /// End a subscription by id. Returns false if it was not active.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.inner.subscribers.cancel(id);
        debug!(target: "dataroom::registry", "unsubscribe id={} removed={}", id, removed);
        removed
    }

    pub fn active_subscribers(&self) -> usize { self.inner.subscribers.len() }

    pub async fn add(&self, ctx: &SessionContext, doc: NewDocument) -> AppResult<DocumentRecord> {
        ctx.require(Action::AddDocument)?;
        let doc = doc.normalized()?;
        let record = DocumentRecord {
            id: DocumentId::generate(),
            name: doc.name,
            locator: doc.locator,
            created_at: now_millis(),
            owner: ctx.principal.clone(),
        };
        let value = serde_json::to_value(&record)?;
        let seq = match self.inner.backend.create_if_absent(&self.inner.collection, record.id.as_str(), value).await? {
            CreateOutcome::Created { seq } => seq,
            CreateOutcome::Exists(_) => {
                return Err(AppError::internal("document_id_collision".to_string(), format!("document id {} already exists", record.id)));
            }
        };
        self.wait_for(seq).await?;
        info!(target: "dataroom::registry", "document added id={} name='{}' owner={} seq={}", record.id, record.name, record.owner, seq);
        Ok(record)
    }

    pub async fn remove(&self, ctx: &SessionContext, id: &DocumentId) -> AppResult<()> {
        ctx.require(Action::RemoveDocument)?;
        let Some(seq) = self.inner.backend.delete(&self.inner.collection, id.as_str()).await? else {
            return Err(AppError::not_found("document_not_found".to_string(), format!("no document with id {}", id)));
        };
        self.wait_for(seq).await?;
        info!(target: "dataroom::registry", "document removed id={} by={} seq={}", id, ctx.principal, seq);
        Ok(())
    }

    async fn wait_for(&self, seq: u64) -> AppResult<()> {
        let mut rx = self.inner.snapshots.clone();
        let reached = tokio::time::timeout(PROJECTION_WAIT, rx.wait_for(|s| s.seq >= seq)).await.map(|r| r.is_ok());
        match reached {
            Ok(true) => Ok(()),
            Ok(false) => Err(AppError::infrastructure("registry_closed", "document projection has stopped")),
            Err(_) => Err(AppError::infrastructure(
                "projection_timeout".to_string(),
                format!("change seq={} committed but not yet visible", seq),
            )),
        }
    }
}

struct Projection {
    collection: String,
    view: HashMap<String, DocumentRecord>,
    seq: u64,
    version: u64,
}

impl Projection {
    fn new(collection: String) -> Self { Self { collection, view: HashMap::new(), seq: 0, version: 0 } }

    fn decode(&self, key: &str, v: &Value) -> Option<DocumentRecord> {
        match serde_json::from_value::<DocumentRecord>(v.clone()) {
            Ok(rec) if rec.id.as_str() == key => Some(rec),
            Ok(rec) => {
                warn!(target: "dataroom::registry", "skipping record {}/{}: id field '{}' does not match key", self.collection, key, rec.id);
                None
            }
            Err(e) => {
                warn!(target: "dataroom::registry", "skipping malformed record {}/{}: {}", self.collection, key, e);
                None
            }
        }
    }

    fn reset(&mut self, seq: u64, entries: &[(String, Value)]) {
        self.view.clear();
        for (k, v) in entries {
            if let Some(rec) = self.decode(k, v) {
                self.view.insert(k.clone(), rec);
            }
        }
        self.seq = seq;
        self.version += 1;
    }

    fn apply(&mut self, seq: u64, key: &str, kind: &ChangeKind) {
        match kind {
            ChangeKind::Created(v) => {
                if let Some(rec) = self.decode(key, v) {
                    self.view.insert(key.to_string(), rec);
                }
            }
            ChangeKind::Deleted(_) => {
                self.view.remove(key);
            }
        }
        self.seq = seq;
        self.version += 1;
    }

    fn snapshot(&self) -> DocumentSnapshot {
        let mut documents: Vec<DocumentRecord> = self.view.values().cloned().collect();
        documents.sort_by(DocumentRecord::registry_order);
        DocumentSnapshot { version: self.version, seq: self.seq, documents }
    }

    async fn run(mut self, backend: Arc<dyn Backend>, mut stream: CollectionWatch, tx: watch::Sender<Arc<DocumentSnapshot>>) {
        loop {
            match stream.next().await {
                Some(WatchItem::Change(ev)) => {
                    self.apply(ev.seq, &ev.key, &ev.kind);
                    tx.send_replace(Arc::new(self.snapshot()));
                }
                Some(WatchItem::Lagged(n)) => {
                    warn!(target: "dataroom::registry", "change stream lagged by {} events; rescanning {}", n, self.collection);
                    stream = loop {
                        match backend.watch(&self.collection, Filter::All).await {
                            Ok(w) => break w,
                            Err(e) => {
                                warn!(target: "dataroom::registry", "rescan failed: {}", e);
                                tokio::time::sleep(RESCAN_BACKOFF).await;
                            }
                        }
                    };
                    self.reset(stream.seq, &stream.entries);
                    tx.send_replace(Arc::new(self.snapshot()));
                }
                None => {
                    info!(target: "dataroom::registry", "change stream closed for {}", self.collection);
                    break;
                }
            }
        }
    }
}
