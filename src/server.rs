//!
//! dataroom HTTP/WS server
//! -----------------------
//! Axum gateway in front of the registry, the role bootstrap and the upload
//! coordinator.
//!
//! Responsibilities:
//! - Sign-in through the identity resolver, role resolution on first sight, and
//!   a cookie + CSRF token session model.
//! - Document listing and role-gated add/remove.
//! - Raw-body uploads with pollable progress.
//! - A WebSocket that pushes every published registry snapshot and accepts
//!   add/remove commands, authorized per message.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

use crate::config::{AppConfig, DEFAULT_MAX_UPLOAD_BYTES};
use crate::error::{AppError, AppResult};
use crate::identity::{Action, IdentityResolver, Session, SessionManager, SignInRequest};
use crate::registry::DocumentRegistry;
use crate::roles::{BootstrapPolicy, RoleBootstrap, RoleStore};
use crate::storage::{Backend, CollectionPaths};
use crate::types::{DocumentId, NewDocument};
use crate::upload::{BlobTransport, FsBlobTransport, UploadCoordinator, UploadId};

pub mod ws;

pub const SESSION_COOKIE: &str = "dataroom_session";
pub const CSRF_HEADER: &str = "x-csrf-token";

/// Shared server state injected into all handlers. Every component is owned
/// here; nothing is process-global.
#[derive(Clone)]
pub struct AppState {
    pub registry: DocumentRegistry,
    pub bootstrap: RoleBootstrap,
    pub uploads: UploadCoordinator,
    pub sessions: SessionManager,
    pub resolver: Arc<dyn IdentityResolver>,
    /// Body limit for `POST /uploads`; every other route keeps axum's default.
    pub max_upload_bytes: usize,
}

impl AppState {
    /// Wire the components over an already opened backend.
    pub async fn assemble(
        backend: Arc<dyn Backend>,
        paths: CollectionPaths,
        policy: BootstrapPolicy,
        transport: Arc<dyn BlobTransport>,
        resolver: Arc<dyn IdentityResolver>,
        sessions: SessionManager,
    ) -> AppResult<Self> {
        let registry = DocumentRegistry::open(backend.clone(), &paths).await?;
        let bootstrap = RoleBootstrap::new(RoleStore::new(backend, paths), policy);
        let uploads = UploadCoordinator::new(transport, registry.clone(), bootstrap.clone());
        Ok(Self { registry, bootstrap, uploads, sessions, resolver, max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES })
    }

    pub fn with_max_upload_bytes(mut self, limit: usize) -> Self {
        self.max_upload_bytes = limit;
        self
    }

    pub async fn from_config(cfg: &AppConfig) -> AppResult<Self> {
        let backend = cfg.backend.open()?;
        std::fs::create_dir_all(&cfg.blob_dir)?;
        let transport = Arc::new(FsBlobTransport::new(cfg.blob_dir.clone()).with_chunk_bytes(cfg.upload_chunk_bytes));
        Self::assemble(
            backend,
            CollectionPaths::new(cfg.app_id.clone()),
            cfg.bootstrap_policy,
            transport,
            Arc::new(cfg.identity_resolver()),
            SessionManager::new(cfg.session_ttl),
        )
        .await
        .map(|state| state.with_max_upload_bytes(cfg.max_upload_bytes))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!(target: "dataroom::server", "request failed: {}", self);
        }
        (status, Json(self.to_json())).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    let upload_limit = DefaultBodyLimit::max(state.max_upload_bytes);
    Router::new()
        .route("/", get(|| async { "dataroom ok" }))
        .route("/session", post(sign_in))
        .route("/logout", post(logout))
        .route("/documents", get(list_documents).post(add_document))
        .route("/documents/{id}", delete(remove_document))
        .route("/uploads", post(begin_upload).layer(upload_limit))
        .route("/uploads/{id}", get(upload_progress))
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}

fn log_startup(cfg: &AppConfig) {
    let cwd = std::env::current_dir().ok();
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "<unset>".to_string());
    info!(
        target: "startup",
        "dataroom starting: RUST_LOG='{}', http_port={}, app_id='{}', backend={:?}, blob_dir={:?}, policy={}, max_upload_bytes={}, session_ttl_secs={}, tokens={}, anonymous={}, cwd={:?}",
        rust_log, cfg.http_port, cfg.app_id, cfg.backend, cfg.blob_dir, cfg.bootstrap_policy, cfg.max_upload_bytes,
        cfg.session_ttl.as_secs(), cfg.auth_tokens.len(), cfg.allow_anonymous, cwd
    );
}

/// Start the gateway on `cfg.http_port` and serve until the process ends.
pub async fn run(cfg: AppConfig) -> anyhow::Result<()> {
    log_startup(&cfg);
    let state = AppState::from_config(&cfg)
        .await
        .with_context(|| format!("While opening backend {:?}", cfg.backend))?;
    info!(target: "startup", "registry loaded: documents={}", state.registry.snapshot().len());

    let addr: SocketAddr = format!("0.0.0.0:{}", cfg.http_port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!(target: "startup", "Starting server on {}", addr);
    serve(listener, state).await
}

/// Serve on an already bound listener.
pub async fn serve(listener: tokio::net::TcpListener, state: AppState) -> anyhow::Result<()> {
    axum::serve(listener, router(state)).await?;
    Ok(())
}

fn parse_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    let cookie = headers.get("cookie")?;
    let s = cookie.to_str().ok()?;
    for part in s.split(';') {
        let p = part.trim();
        if let Some((k, v)) = p.split_once('=') {
            if k == name { return Some(v.to_string()); }
        }
    }
    None
}

fn set_session_cookie(token: &str) -> AppResult<HeaderValue> {
    HeaderValue::from_str(&format!("{}={}; HttpOnly; Secure; SameSite=Strict; Path=/", SESSION_COOKIE, token))
        .map_err(|e| AppError::internal("cookie_encode".to_string(), e.to_string()))
}

fn clear_session_cookie() -> HeaderValue {
    HeaderValue::from_static("dataroom_session=deleted; Expires=Thu, 01 Jan 1970 00:00:00 GMT; HttpOnly; Secure; SameSite=Strict; Path=/")
}

pub(crate) fn session_from_headers(state: &AppState, headers: &HeaderMap) -> AppResult<Session> {
    let Some(token) = parse_cookie(headers, SESSION_COOKIE) else {
        return Err(AppError::auth("unauthorized", "sign in first"));
    };
    state.sessions.validate(&token).ok_or_else(|| AppError::auth("session_expired", "session is unknown or expired; sign in again"))
}

pub(crate) fn check_csrf(session: &Session, provided: Option<&str>) -> AppResult<()> {
    match provided {
        Some(t) if t == session.csrf => Ok(()),
        _ => Err(AppError::permission_denied("invalid_csrf", "missing or invalid csrf token")),
    }
}

/// Session plus CSRF validation for mutating routes.
fn mutating_session(state: &AppState, headers: &HeaderMap) -> AppResult<Session> {
    let session = session_from_headers(state, headers)?;
    check_csrf(&session, headers.get(CSRF_HEADER).and_then(|v| v.to_str().ok()))?;
    Ok(session)
}

#[derive(Debug, Default, Deserialize)]
struct SignInPayload {
    #[serde(default)]
    token: Option<String>,
}

async fn sign_in(State(state): State<AppState>, payload: Option<Json<SignInPayload>>) -> AppResult<impl IntoResponse> {
    let payload = payload.map(|Json(p)| p).unwrap_or_default();
    let principal = state.resolver.resolve(&SignInRequest { token: payload.token }).await?;
    let role = state.bootstrap.resolve_role(&principal).await?;
    let session = state.sessions.issue(principal.clone(), role)?;
    info!(target: "dataroom::server", "sign-in principal={} role={}", principal, role);
    let mut headers = HeaderMap::new();
    headers.insert("Set-Cookie", set_session_cookie(&session.token)?);
    Ok((
        StatusCode::OK,
        headers,
        Json(json!({"status": "ok", "principal": principal, "role": role, "csrf": session.csrf})),
    ))
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> AppResult<impl IntoResponse> {
    let session = mutating_session(&state, &headers)?;
    state.sessions.logout(&session.token);
    let mut h = HeaderMap::new();
    h.insert("Set-Cookie", clear_session_cookie());
    Ok((StatusCode::OK, h, Json(json!({"status": "ok"}))))
}

async fn list_documents(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Json<serde_json::Value>> {
    let session = session_from_headers(&state, &headers)?;
    session.context().require(Action::ReadDocuments)?;
    let snap = state.registry.snapshot();
    Ok(Json(json!({"status": "ok", "version": snap.version, "documents": snap.documents})))
}

#[derive(Debug, Deserialize)]
struct AddPayload {
    #[serde(default)]
    name: String,
    #[serde(default)]
    locator: String,
}

async fn add_document(State(state): State<AppState>, headers: HeaderMap, Json(payload): Json<AddPayload>) -> AppResult<impl IntoResponse> {
    let session = mutating_session(&state, &headers)?;
    let rec = state.registry.add(&session.context(), NewDocument::new(payload.name, payload.locator)).await?;
    Ok((StatusCode::CREATED, Json(json!({"status": "ok", "document": rec}))))
}

async fn remove_document(State(state): State<AppState>, headers: HeaderMap, Path(id): Path<String>) -> AppResult<Json<serde_json::Value>> {
    let session = mutating_session(&state, &headers)?;
    state.registry.remove(&session.context(), &DocumentId::from(id)).await?;
    Ok(Json(json!({"status": "ok"})))
}

#[derive(Debug, Deserialize)]
struct UploadQuery {
    #[serde(default)]
    name: String,
}

async fn begin_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(q): Query<UploadQuery>,
    body: Bytes,
) -> AppResult<impl IntoResponse> {
    let session = mutating_session(&state, &headers)?;
    let handle = state.uploads.begin_upload(&session.context(), body.to_vec(), &q.name).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"status": "ok", "upload_id": handle.id(), "upload": handle.latest()})),
    ))
}

async fn upload_progress(State(state): State<AppState>, headers: HeaderMap, Path(id): Path<UploadId>) -> AppResult<Json<serde_json::Value>> {
    let session = session_from_headers(&state, &headers)?;
    let progress = state.uploads.progress(&id)?;
    // Other principals' uploads are reported as absent.
    if progress.owner != session.principal {
        return Err(AppError::not_found("upload_not_found".to_string(), format!("no upload session {}", id)));
    }
    Ok(Json(json!({"status": "ok", "upload": progress})))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_parsing_finds_named_value() {
        let mut h = HeaderMap::new();
        h.insert("cookie", HeaderValue::from_static("a=1; dataroom_session=tok=en; b=2"));
        assert_eq!(parse_cookie(&h, SESSION_COOKIE).as_deref(), Some("tok=en"));
        assert_eq!(parse_cookie(&h, "missing"), None);
    }

    #[test]
    fn app_error_maps_to_status() {
        let resp = AppError::permission_denied("admin_required", "nope").into_response();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        let resp = AppError::infrastructure("backend_unreachable", "down").into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
