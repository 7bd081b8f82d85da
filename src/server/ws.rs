//! WebSocket endpoint for live registry snapshots.
//!
//! ### Server -> client
//! ```json
//! {"type": "hello", "principal": "...", "role": "admin"}
//! {"type": "snapshot", "version": 7, "documents": [...]}
//! {"type": "result", "op": "add", "status": "ok", "document": {...}}
//! {"type": "error", "status": "error", "code": "...", "message": "...", "retryable": false}
//! ```
//!
//! ### Client -> server
//! ```json
//! {"op": "add", "name": "Q2 Report", "locator": "blob://x"}
//! {"op": "remove", "id": "..."}
//! {"op": "ping"}
//! ```

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::{check_csrf, session_from_headers, AppState, CSRF_HEADER};
use crate::error::{AppError, AppResult};
use crate::identity::SessionContext;
use crate::types::{DocumentId, NewDocument};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientCommand {
    Add {
        #[serde(default)]
        name: String,
        #[serde(default)]
        locator: String,
    },
    Remove { id: String },
    Ping,
}

#[derive(Debug, Default, Deserialize)]
pub struct WsQuery {
    /// Browsers cannot set headers on the upgrade request, so the token may
    /// also come as `?csrf=`.
    csrf: Option<String>,
}

pub async fn ws_handler(State(state): State<AppState>, headers: HeaderMap, Query(q): Query<WsQuery>, ws: WebSocketUpgrade) -> Response {
    let session = match session_from_headers(&state, &headers) {
        Ok(s) => s,
        Err(e) => return e.into_response(),
    };
    let provided = headers.get(CSRF_HEADER).and_then(|v| v.to_str().ok()).or(q.csrf.as_deref());
    if let Err(e) = check_csrf(&session, provided) {
        return e.into_response();
    }
    let ctx = session.context();
    ws.on_upgrade(move |socket| handle_socket(socket, state, ctx))
}

async fn handle_socket(socket: WebSocket, state: AppState, ctx: SessionContext) {
    let (mut sink, mut stream) = socket.split();
    let mut sub = state.registry.subscribe();
    info!(target: "dataroom::server", "ws open principal={} role={} sub={}", ctx.principal, ctx.role, sub.id());

    let hello = json!({"type": "hello", "principal": ctx.principal, "role": ctx.role});
    if sink.send(Message::Text(hello.to_string().into())).await.is_err() {
        sub.unsubscribe();
        return;
    }

    loop {
        tokio::select! {
            snap = sub.next() => {
                let Some(snap) = snap else { break; };
                let frame = json!({"type": "snapshot", "version": snap.version, "documents": snap.documents});
                if sink.send(Message::Text(frame.to_string().into())).await.is_err() {
                    break;
                }
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let reply = match handle_command(&state, &ctx, text.as_str()).await {
                            Ok(v) => v,
                            Err(e) => {
                                debug!(target: "dataroom::server", "ws command rejected principal={}: {}", ctx.principal, e);
                                let mut v = e.to_json();
                                v["type"] = json!("error");
                                v
                            }
                        };
                        if sink.send(Message::Text(reply.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(target: "dataroom::server", "ws receive error principal={}: {}", ctx.principal, e);
                        break;
                    }
                }
            }
        }
    }

    sub.unsubscribe();
    info!(target: "dataroom::server", "ws closed principal={} sub={}", ctx.principal, sub.id());
}

/// Parse and run one client command; authorization is checked per message.
async fn handle_command(state: &AppState, ctx: &SessionContext, text: &str) -> AppResult<Value> {
    let cmd: ClientCommand = serde_json::from_str(text)
        .map_err(|e| AppError::user("invalid_command".to_string(), format!("could not parse command: {}", e)))?;
    match cmd {
        ClientCommand::Add { name, locator } => {
            let rec = state.registry.add(ctx, NewDocument::new(name, locator)).await?;
            Ok(json!({"type": "result", "op": "add", "status": "ok", "document": rec}))
        }
        ClientCommand::Remove { id } => {
            state.registry.remove(ctx, &DocumentId::from(id.clone())).await?;
            Ok(json!({"type": "result", "op": "remove", "status": "ok", "id": id}))
        }
        ClientCommand::Ping => Ok(json!({"type": "pong"})),
    }
}
