use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;

use dataroom::identity::{LocalIdentityResolver, SessionManager};
use dataroom::roles::BootstrapPolicy;
use dataroom::server::{self, AppState};
use dataroom::storage::{CollectionPaths, MemoryBackend};
use dataroom::upload::FsBlobTransport;

struct Gateway {
    addr: String,
    _blobs: TempDir,
}

impl Gateway {
    fn url(&self, path: &str) -> String { format!("http://{}{}", self.addr, path) }
}

async fn start() -> Gateway { start_with(8, None).await }

async fn start_with(chunk_bytes: usize, max_upload_bytes: Option<usize>) -> Gateway {
    let blobs = tempfile::tempdir().unwrap();
    let tokens = LocalIdentityResolver::parse_token_table("t1=p1,t2=p2").unwrap();
    let state = AppState::assemble(
        Arc::new(MemoryBackend::new()),
        CollectionPaths::new("gw"),
        BootstrapPolicy::AdminClaim,
        Arc::new(FsBlobTransport::new(blobs.path()).with_chunk_bytes(chunk_bytes)),
        Arc::new(LocalIdentityResolver::new(tokens, true)),
        SessionManager::default(),
    )
    .await
    .unwrap();
    let state = match max_upload_bytes {
        Some(limit) => state.with_max_upload_bytes(limit),
        None => state,
    };
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(server::serve(listener, state));
    Gateway { addr, _blobs: blobs }
}

struct Client {
    http: reqwest::Client,
    cookie: String,
    csrf: String,
    role: String,
}

async fn sign_in(gw: &Gateway, token: &str) -> Client {
    let http = reqwest::Client::new();
    let resp = http.post(gw.url("/session")).json(&json!({"token": token})).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let set_cookie = resp.headers().get("set-cookie").unwrap().to_str().unwrap().to_string();
    let cookie = set_cookie.split(';').next().unwrap().to_string();
    let body: Value = resp.json().await.unwrap();
    Client {
        http,
        cookie,
        csrf: body["csrf"].as_str().unwrap().to_string(),
        role: body["role"].as_str().unwrap().to_string(),
    }
}

impl Client {
    fn get(&self, url: String) -> reqwest::RequestBuilder {
        self.http.get(url).header("cookie", &self.cookie)
    }
    fn post(&self, url: String) -> reqwest::RequestBuilder {
        self.http.post(url).header("cookie", &self.cookie).header("x-csrf-token", &self.csrf)
    }
    fn delete(&self, url: String) -> reqwest::RequestBuilder {
        self.http.delete(url).header("cookie", &self.cookie).header("x-csrf-token", &self.csrf)
    }
}

#[tokio::test]
async fn first_sign_in_is_admin_then_investors() {
    let gw = start().await;
    assert_eq!(sign_in(&gw, "t1").await.role, "admin");
    assert_eq!(sign_in(&gw, "t2").await.role, "investor");
    // Same token again keeps its role.
    assert_eq!(sign_in(&gw, "t1").await.role, "admin");

    let resp = reqwest::Client::new().post(gw.url("/session")).json(&json!({"token": "bogus"})).send().await.unwrap();
    assert_eq!(resp.status(), 401);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "invalid_token");
}

#[tokio::test]
async fn document_routes_enforce_session_csrf_and_role() {
    let gw = start().await;
    let admin = sign_in(&gw, "t1").await;
    let investor = sign_in(&gw, "t2").await;

    let resp = reqwest::Client::new().get(gw.url("/documents")).send().await.unwrap();
    assert_eq!(resp.status(), 401);

    let resp = admin.http.post(gw.url("/documents")).header("cookie", &admin.cookie)
        .json(&json!({"name": "Q2 Report", "locator": "blob://x"})).send().await.unwrap();
    assert_eq!(resp.status(), 403);

    let resp = investor.post(gw.url("/documents")).json(&json!({"name": "Q2 Report", "locator": "blob://x"})).send().await.unwrap();
    assert_eq!(resp.status(), 403);
    assert_eq!(resp.json::<Value>().await.unwrap()["code"], "admin_required");

    let resp = admin.post(gw.url("/documents")).json(&json!({"name": "", "locator": "blob://x"})).send().await.unwrap();
    assert_eq!(resp.status(), 400);

    let resp = admin.post(gw.url("/documents")).json(&json!({"name": "Q2 Report", "locator": "blob://x"})).send().await.unwrap();
    assert_eq!(resp.status(), 201);
    let id = resp.json::<Value>().await.unwrap()["document"]["id"].as_str().unwrap().to_string();

    let list: Value = investor.get(gw.url("/documents")).send().await.unwrap().json().await.unwrap();
    assert_eq!(list["documents"].as_array().unwrap().len(), 1);
    assert_eq!(list["documents"][0]["name"], "Q2 Report");

    let resp = investor.delete(gw.url(&format!("/documents/{}", id))).send().await.unwrap();
    assert_eq!(resp.status(), 403);
    let resp = admin.delete(gw.url(&format!("/documents/{}", id))).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let resp = admin.delete(gw.url(&format!("/documents/{}", id))).send().await.unwrap();
    assert_eq!(resp.status(), 404);

    let list: Value = investor.get(gw.url("/documents")).send().await.unwrap().json().await.unwrap();
    assert!(list["documents"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn logout_ends_the_session() {
    let gw = start().await;
    let admin = sign_in(&gw, "t1").await;
    assert_eq!(admin.post(gw.url("/logout")).send().await.unwrap().status(), 200);
    assert_eq!(admin.get(gw.url("/documents")).send().await.unwrap().status(), 401);
}

#[tokio::test]
async fn upload_registers_document_and_reports_progress() {
    let gw = start().await;
    let admin = sign_in(&gw, "t1").await;
    let investor = sign_in(&gw, "t2").await;

    let resp = investor.post(gw.url("/uploads?name=deck.pdf")).body(vec![1u8; 10]).send().await.unwrap();
    assert_eq!(resp.status(), 403);

    let resp = admin.post(gw.url("/uploads?name=deck.pdf")).body(b"forty two bytes of very important data!!".to_vec()).send().await.unwrap();
    assert_eq!(resp.status(), 202);
    let id = resp.json::<Value>().await.unwrap()["upload_id"].as_str().unwrap().to_string();

    let last = poll_upload(&gw, &admin, &id).await;
    assert_eq!(last["upload"]["state"], "succeeded");
    assert_eq!(last["upload"]["bytes_transferred"], last["upload"]["total_bytes"]);

    let list: Value = investor.get(gw.url("/documents")).send().await.unwrap().json().await.unwrap();
    let docs = list["documents"].as_array().unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0]["name"], "deck.pdf");
    assert_eq!(docs[0]["locator"], last["upload"]["locator"]);
    assert!(docs[0]["locator"].as_str().unwrap().starts_with("blob://uploads/p1/"));

    // Other principals cannot see the session.
    let resp = investor.get(gw.url(&format!("/uploads/{}", id))).send().await.unwrap();
    assert_eq!(resp.status(), 404);
}

/// Poll `GET /uploads/{id}` until the session ends.
async fn poll_upload(gw: &Gateway, c: &Client, id: &str) -> Value {
    let mut last = Value::Null;
    for _ in 0..250 {
        last = c.get(gw.url(&format!("/uploads/{}", id))).send().await.unwrap().json().await.unwrap();
        if last["upload"]["state"] == "succeeded" || last["upload"]["state"] == "failed" { break; }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    last
}

#[tokio::test]
async fn uploads_larger_than_the_default_body_limit_are_accepted() {
    let gw = start_with(64 * 1024, None).await;
    let admin = sign_in(&gw, "t1").await;
    let body = vec![7u8; 3 * 1024 * 1024];

    let resp = admin.post(gw.url("/uploads?name=deck.pdf")).body(body.clone()).send().await.unwrap();
    assert_eq!(resp.status(), 202);
    let id = resp.json::<Value>().await.unwrap()["upload_id"].as_str().unwrap().to_string();

    let last = poll_upload(&gw, &admin, &id).await;
    assert_eq!(last["upload"]["state"], "succeeded");
    assert_eq!(last["upload"]["total_bytes"], body.len() as u64);
    assert_eq!(last["upload"]["bytes_transferred"], body.len() as u64);
}

#[tokio::test]
async fn uploads_over_the_configured_limit_are_refused() {
    let gw = start_with(64, Some(1024)).await;
    let admin = sign_in(&gw, "t1").await;

    let resp = admin.post(gw.url("/uploads?name=big.pdf")).body(vec![1u8; 2048]).send().await.unwrap();
    assert_eq!(resp.status(), 413);
    let resp = admin.post(gw.url("/uploads?name=small.pdf")).body(vec![1u8; 512]).send().await.unwrap();
    assert_eq!(resp.status(), 202);
    // Non-upload routes are unaffected by the upload limit.
    let resp = admin.post(gw.url("/documents")).json(&json!({"name": "x".repeat(4096), "locator": "blob://x"})).send().await.unwrap();
    assert_eq!(resp.status(), 201);
}

type Ws = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect_ws(gw: &Gateway, c: &Client) -> Ws {
    let mut req = format!("ws://{}/ws", gw.addr).into_client_request().unwrap();
    req.headers_mut().insert("cookie", c.cookie.parse().unwrap());
    req.headers_mut().insert("x-csrf-token", c.csrf.parse().unwrap());
    let (ws, _) = tokio_tungstenite::connect_async(req).await.unwrap();
    ws
}

async fn next_json(ws: &mut Ws) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next()).await.expect("ws frame timeout").unwrap().unwrap();
        if let Message::Text(t) = msg {
            return serde_json::from_str(&t).unwrap();
        }
    }
}

/// Read frames until one of `kind` shows up and satisfies `pred`.
async fn wait_for(ws: &mut Ws, kind: &str, pred: impl Fn(&Value) -> bool) -> Value {
    loop {
        let v = next_json(ws).await;
        if v["type"] == kind && pred(&v) { return v; }
    }
}

#[tokio::test]
async fn websocket_pushes_snapshots_and_gates_commands() {
    let gw = start().await;
    let admin = sign_in(&gw, "t1").await;
    let investor = sign_in(&gw, "t2").await;

    let mut aw = connect_ws(&gw, &admin).await;
    let mut iw = connect_ws(&gw, &investor).await;
    assert_eq!(next_json(&mut aw).await["role"], "admin");
    assert_eq!(next_json(&mut iw).await["role"], "investor");
    assert!(next_json(&mut aw).await["documents"].as_array().unwrap().is_empty());
    assert!(next_json(&mut iw).await["documents"].as_array().unwrap().is_empty());

    aw.send(Message::Text(json!({"op": "add", "name": "Q2 Report", "locator": "blob://x"}).to_string())).await.unwrap();
    let result = wait_for(&mut aw, "result", |_| true).await;
    let id = result["document"]["id"].as_str().unwrap().to_string();

    let snap = wait_for(&mut iw, "snapshot", |v| v["documents"].as_array().map(|d| d.len()) == Some(1)).await;
    assert_eq!(snap["documents"][0]["id"], id.as_str());

    iw.send(Message::Text(json!({"op": "remove", "id": id}).to_string())).await.unwrap();
    let err = wait_for(&mut iw, "error", |_| true).await;
    assert_eq!(err["code"], "admin_required");

    aw.send(Message::Text(json!({"op": "remove", "id": id}).to_string())).await.unwrap();
    wait_for(&mut iw, "snapshot", |v| v["documents"].as_array().map(|d| d.is_empty()) == Some(true)).await;
}

#[tokio::test]
async fn websocket_requires_csrf() {
    let gw = start().await;
    let admin = sign_in(&gw, "t1").await;
    let mut req = format!("ws://{}/ws", gw.addr).into_client_request().unwrap();
    req.headers_mut().insert("cookie", admin.cookie.parse().unwrap());
    assert!(tokio_tungstenite::connect_async(req).await.is_err());

    let req = format!("ws://{}/ws?csrf={}", gw.addr, admin.csrf).into_client_request().unwrap();
    let mut req = req;
    req.headers_mut().insert("cookie", admin.cookie.parse().unwrap());
    let (mut ws, _) = tokio_tungstenite::connect_async(req).await.unwrap();
    assert_eq!(next_json(&mut ws).await["type"], "hello");
}
