//!
//! dataroom storage module
//! -----------------------
//! Persistence contract shared by the role store and the document registry.
//! A backend stores JSON documents in named collections and must provide five
//! primitives: point read by key, create-if-absent write, delete, full scan, and
//! a live filtered subscription to a collection. Any document database, keyed
//! table with an index, or replicated KV store that offers these satisfies the
//! contract.
//!
//! Every committed mutation is stamped with a backend-wide, strictly increasing
//! sequence number. Watchers receive change events in sequence order; the
//! initial snapshot returned by `watch` and the event stream are taken
//! atomically, so nothing committed between them is lost or duplicated.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::AppResult;

mod paths;
pub mod memory;

pub use memory::{MemoryBackend, SnapshotSettings};
pub use paths::{CollectionPaths, DEFAULT_APP_ID};

/// Row filter for `Backend::watch`.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    All,
    /// Top-level field equality, e.g. `role == "admin"`.
    FieldEquals { field: String, value: Value },
}

impl Filter {
    pub fn field_equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::FieldEquals { field: field.into(), value: value.into() }
    }

    pub fn matches(&self, doc: &Value) -> bool {
        match self {
            Filter::All => true,
            Filter::FieldEquals { field, value } => doc.get(field) == Some(value),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    /// The value was written; `seq` is its commit sequence.
    Created { seq: u64 },
    /// A value already existed under the key and was left untouched.
    Exists(Value),
}

impl CreateOutcome {
    pub fn was_created(&self) -> bool { matches!(self, CreateOutcome::Created { .. }) }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChangeKind {
    Created(Value),
    /// Carries the removed value so filtered watchers can decide relevance.
    Deleted(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub seq: u64,
    pub collection: String,
    pub key: String,
    pub kind: ChangeKind,
}

impl ChangeEvent {
    fn value(&self) -> &Value {
        match &self.kind {
            ChangeKind::Created(v) | ChangeKind::Deleted(v) => v,
        }
    }
}

/// Item yielded by `CollectionWatch::next`.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchItem {
    Change(ChangeEvent),
    /// The watcher fell behind and `n` events were dropped. Consumers must
    /// rebuild their view from a fresh scan.
    Lagged(u64),
}

/// Live subscription to one collection.
pub struct CollectionWatch {
    /// Sequence number the initial entries are consistent with.
    pub seq: u64,
    pub entries: Vec<(String, Value)>,
    filter: Filter,
    events: broadcast::Receiver<ChangeEvent>,
}

impl CollectionWatch {
    pub fn new(seq: u64, entries: Vec<(String, Value)>, filter: Filter, events: broadcast::Receiver<ChangeEvent>) -> Self {
        Self { seq, entries, filter, events }
    }

    /// Next matching change, or `None` once the backend is gone.
    pub async fn next(&mut self) -> Option<WatchItem> {
        loop {
            match self.events.recv().await {
                Ok(ev) => {
                    // Events already reflected in the initial snapshot.
                    if ev.seq <= self.seq { continue; }
                    if !self.filter.matches(ev.value()) { continue; }
                    return Some(WatchItem::Change(ev));
                }
                Err(broadcast::error::RecvError::Lagged(n)) => return Some(WatchItem::Lagged(n)),
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Persistence backend contract. All errors surface as `AppError`; an
/// unreachable backend is `AppError::Infrastructure`.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn get(&self, collection: &str, key: &str) -> AppResult<Option<Value>>;

    /// Write `value` only if `key` is absent. Never overwrites.
    async fn create_if_absent(&self, collection: &str, key: &str, value: Value) -> AppResult<CreateOutcome>;

    /// Remove `key`; returns the commit sequence, or `None` if it was absent.
    async fn delete(&self, collection: &str, key: &str) -> AppResult<Option<u64>>;

    async fn scan(&self, collection: &str) -> AppResult<Vec<(String, Value)>>;

    async fn watch(&self, collection: &str, filter: Filter) -> AppResult<CollectionWatch>;
}

#[cfg(test)]
#[path = "storage_tests.rs"]
mod storage_tests;
