//!
//! dataroom upload coordinator
//! ---------------------------
//! Drives one binary transfer per session to blob storage, then registers the
//! resulting document.
//!
//! State machine: idle -> transferring -> {succeeded, failed}. A session only
//! reaches `succeeded` once its document is in the registry. On failure the
//! session ends with the error recorded and nothing is registered; there is no
//! automatic retry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::identity::{Action, Principal, SessionContext};
use crate::registry::DocumentRegistry;
use crate::roles::RoleBootstrap;
use crate::types::{DocumentId, DocumentRecord, Locator, NewDocument};

mod transport;

pub use transport::{BlobTransport, FsBlobTransport, ProgressReporter, DEFAULT_CHUNK_BYTES};

pub type UploadId = Uuid;

const DEFAULT_RETENTION: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadState {
    Idle,
    Transferring,
    Succeeded,
    Failed,
}

impl UploadState {
    pub fn is_terminal(&self) -> bool { matches!(self, UploadState::Succeeded | UploadState::Failed) }
}

/// Observable state of one upload session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadProgress {
    pub upload_id: UploadId,
    pub owner: Principal,
    pub name: String,
    pub state: UploadState,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub locator: Option<Locator>,
    pub document_id: Option<DocumentId>,
    pub error: Option<AppError>,
}

impl UploadProgress {
    fn new(upload_id: UploadId, owner: Principal, name: String, total_bytes: u64) -> Self {
        Self {
            upload_id,
            owner,
            name,
            state: UploadState::Idle,
            bytes_transferred: 0,
            total_bytes,
            locator: None,
            document_id: None,
            error: None,
        }
    }

    /// 0.0..=1.0; an empty upload counts as complete once it succeeds.
    pub fn fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            return if self.state == UploadState::Succeeded { 1.0 } else { 0.0 };
        }
        self.bytes_transferred as f64 / self.total_bytes as f64
    }
}

/// Caller's view of a running upload.
pub struct UploadHandle {
    id: UploadId,
    progress: watch::Receiver<UploadProgress>,
    task: JoinHandle<AppResult<DocumentRecord>>,
}

impl UploadHandle {
    pub fn id(&self) -> UploadId { self.id }

    pub fn progress(&self) -> watch::Receiver<UploadProgress> { self.progress.clone() }

    pub fn latest(&self) -> UploadProgress { self.progress.borrow().clone() }

    /// Wait for the session to end. Dropping the handle instead lets the
    /// transfer run to completion unobserved.
    pub async fn outcome(self) -> AppResult<DocumentRecord> {
        match self.task.await {
            Ok(r) => r,
            Err(e) => Err(AppError::internal("upload_task_failed".to_string(), e.to_string())),
        }
    }
}

struct SessionEntry {
    progress: watch::Receiver<UploadProgress>,
    finished_at: Arc<Mutex<Option<Instant>>>,
}

#[derive(Clone)]
pub struct UploadCoordinator {
    transport: Arc<dyn BlobTransport>,
    registry: DocumentRegistry,
    bootstrap: RoleBootstrap,
    sessions: Arc<Mutex<HashMap<UploadId, SessionEntry>>>,
    retention: Duration,
}

impl UploadCoordinator {
    pub fn new(transport: Arc<dyn BlobTransport>, registry: DocumentRegistry, bootstrap: RoleBootstrap) -> Self {
        Self { transport, registry, bootstrap, sessions: Arc::new(Mutex::new(HashMap::new())), retention: DEFAULT_RETENTION }
    }

    /// How long finished sessions stay queryable through `progress`.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub async fn begin_upload(&self, ctx: &SessionContext, bytes: Vec<u8>, name: &str) -> AppResult<UploadHandle> {
        ctx.require(Action::Upload)?;
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(AppError::user("missing_name", "Please enter a file name for the upload."));
        }
        self.prune();

        let id = Uuid::new_v4();
        let path = format!("uploads/{}/{}-{}", sanitize(ctx.principal.as_str()), id.simple(), sanitize(&name));
        let (reporter, rx) = ProgressReporter::channel(UploadProgress::new(id, ctx.principal.clone(), name.clone(), bytes.len() as u64));
        reporter.update(|p| p.state = UploadState::Transferring);

        let finished_at = Arc::new(Mutex::new(None));
        self.sessions.lock().insert(id, SessionEntry { progress: rx.clone(), finished_at: finished_at.clone() });
        info!(target: "dataroom::upload", "upload start id={} principal={} name='{}' bytes={}", id, ctx.principal, name, bytes.len());

        let this = self.clone();
        let principal = ctx.principal.clone();
        let task = tokio::spawn(async move {
            let result = this.drive(&principal, &bytes, &path, name, &reporter).await;
            match &result {
                Ok(rec) => {
                    info!(target: "dataroom::upload", "upload done id={} document={} locator={}", id, rec.id, rec.locator);
                    reporter.update(|p| {
                        p.state = UploadState::Succeeded;
                        p.bytes_transferred = p.total_bytes;
                        p.locator = Some(rec.locator.clone());
                        p.document_id = Some(rec.id.clone());
                    });
                }
                Err(e) => {
                    warn!(target: "dataroom::upload", "upload failed id={} principal={}: {}", id, principal, e);
                    reporter.update(|p| {
                        p.state = UploadState::Failed;
                        p.error = Some(e.clone());
                    });
                }
            }
            *finished_at.lock() = Some(Instant::now());
            result
        });

        Ok(UploadHandle { id, progress: rx, task })
    }

    async fn drive(&self, principal: &Principal, bytes: &[u8], path: &str, name: String, reporter: &ProgressReporter) -> AppResult<DocumentRecord> {
        let locator = self.transport.put(bytes, path, reporter).await?;
        reporter.report(bytes.len() as u64);

        // Authority is re-read from the store, not taken from the session.
        let Some(role) = self.bootstrap.current_role(principal).await? else {
            return Err(AppError::permission_denied(
                "role_missing".to_string(),
                format!("no role on record for {}; upload not registered", principal),
            ));
        };
        let ctx = SessionContext::new(principal.clone(), role);
        self.registry.add(&ctx, NewDocument { name, locator }).await
    }

    pub fn progress(&self, id: &UploadId) -> AppResult<UploadProgress> {
        self.sessions
            .lock()
            .get(id)
            .map(|s| s.progress.borrow().clone())
            .ok_or_else(|| AppError::not_found("upload_not_found".to_string(), format!("no upload session {}", id)))
    }

    /// Sessions currently tracked (running or within retention).
    pub fn tracked(&self) -> usize { self.sessions.lock().len() }

    /// Drop finished sessions older than the retention window.
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, s| match *s.finished_at.lock() {
            Some(at) => now.duration_since(at) < self.retention,
            None => true,
        });
        before - sessions.len()
    }
}

/// Keep `[A-Za-z0-9._-]`, replace everything else, and never start with a dot.
fn sanitize(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .take(120)
        .collect();
    while out.starts_with('.') {
        out.remove(0);
    }
    if out.is_empty() { "file".to_string() } else { out }
}
