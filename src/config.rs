//!
//! dataroom configuration
//! ----------------------
//! Effective settings resolved from CLI flags, then `DATAROOM_*` environment
//! variables, then defaults. The backend configuration is a JSON document and
//! has no default: a missing, empty or unparsable value is a configuration
//! error and the server refuses to start.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{AppError, AppResult};
use crate::identity::{LocalIdentityResolver, Principal};
use crate::roles::BootstrapPolicy;
use crate::storage::{Backend, MemoryBackend, SnapshotSettings, DEFAULT_APP_ID};
use crate::upload::DEFAULT_CHUNK_BYTES;

pub const DEFAULT_HTTP_PORT: u16 = 7878;
pub const DEFAULT_BLOB_DIR: &str = "blobs";
pub const DEFAULT_SESSION_TTL_SECS: u64 = 3600;
/// Upload bodies are buffered before the transfer starts, so this also bounds
/// per-request memory.
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    Memory,
    Snapshot { dir: PathBuf },
}

impl BackendConfig {
    pub fn parse(raw: Option<&str>) -> AppResult<Self> {
        let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
            return Err(AppError::configuration(
                "missing_backend_config",
                "backend configuration is missing; set --backend-config or DATAROOM_BACKEND_CONFIG",
            ));
        };
        serde_json::from_str(raw).map_err(|e| {
            AppError::configuration("invalid_backend_config".to_string(), format!("backend configuration is not valid: {}", e))
        })
    }

    pub fn open(&self) -> AppResult<Arc<dyn Backend>> {
        match self {
            BackendConfig::Memory => Ok(Arc::new(MemoryBackend::new())),
            BackendConfig::Snapshot { dir } => Ok(Arc::new(MemoryBackend::open(SnapshotSettings::new(dir.clone()))?)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub http_port: u16,
    pub app_id: String,
    pub backend: BackendConfig,
    pub blob_dir: PathBuf,
    pub upload_chunk_bytes: usize,
    pub max_upload_bytes: usize,
    pub session_ttl: Duration,
    pub bootstrap_policy: BootstrapPolicy,
    pub auth_tokens: HashMap<String, Principal>,
    pub allow_anonymous: bool,
}

impl AppConfig {
    /// Resolve from the process arguments and environment.
    pub fn from_env_and_args(args: &[String]) -> AppResult<Self> {
        Self::resolve(args, |name| std::env::var(name).ok())
    }

    pub fn resolve(args: &[String], env: impl Fn(&str) -> Option<String>) -> AppResult<Self> {
        let http_port = match arg_value(args, "--http-port").or_else(|| env("DATAROOM_HTTP_PORT")) {
            Some(v) => parse_num::<u16>("http port", &v)?,
            None => DEFAULT_HTTP_PORT,
        };
        let app_id = arg_value(args, "--app-id")
            .or_else(|| env("DATAROOM_APP_ID"))
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_APP_ID.to_string());
        let backend = BackendConfig::parse(arg_value(args, "--backend-config").or_else(|| env("DATAROOM_BACKEND_CONFIG")).as_deref())?;
        let blob_dir = arg_value(args, "--blob-dir")
            .or_else(|| env("DATAROOM_BLOB_DIR"))
            .unwrap_or_else(|| DEFAULT_BLOB_DIR.to_string());
        let upload_chunk_bytes = match env("DATAROOM_UPLOAD_CHUNK_BYTES") {
            Some(v) => parse_num::<usize>("upload chunk size", &v)?.max(1),
            None => DEFAULT_CHUNK_BYTES,
        };
        let max_upload_bytes = match arg_value(args, "--max-upload-bytes").or_else(|| env("DATAROOM_MAX_UPLOAD_BYTES")) {
            Some(v) => parse_num::<usize>("max upload size", &v)?,
            None => DEFAULT_MAX_UPLOAD_BYTES,
        };
        let session_ttl = match env("DATAROOM_SESSION_TTL_SECS") {
            Some(v) => Duration::from_secs(parse_num::<u64>("session ttl", &v)?),
            None => Duration::from_secs(DEFAULT_SESSION_TTL_SECS),
        };
        let bootstrap_policy = match env("DATAROOM_BOOTSTRAP_POLICY") {
            Some(v) => v.parse::<BootstrapPolicy>()?,
            None => BootstrapPolicy::default(),
        };
        let auth_tokens = match env("DATAROOM_AUTH_TOKENS") {
            Some(v) => LocalIdentityResolver::parse_token_table(&v)?,
            None => HashMap::new(),
        };
        let allow_anonymous = match env("DATAROOM_ALLOW_ANONYMOUS") {
            Some(v) => parse_bool(&v).ok_or_else(|| {
                AppError::configuration("invalid_bool".to_string(), format!("DATAROOM_ALLOW_ANONYMOUS: expected a boolean, got '{}'", v))
            })?,
            None => true,
        };
        Ok(Self {
            http_port,
            app_id,
            backend,
            blob_dir: PathBuf::from(blob_dir),
            upload_chunk_bytes,
            max_upload_bytes,
            session_ttl,
            bootstrap_policy,
            auth_tokens,
            allow_anonymous,
        })
    }

    pub fn identity_resolver(&self) -> LocalIdentityResolver {
        LocalIdentityResolver::new(self.auth_tokens.clone(), self.allow_anonymous)
    }
}

fn arg_value(args: &[String], flag: &str) -> Option<String> {
    let mut i = 0;
    while i < args.len() {
        if args[i] == flag {
            return args.get(i + 1).cloned();
        }
        if let Some(v) = args[i].strip_prefix(flag).and_then(|rest| rest.strip_prefix('=')) {
            return Some(v.to_string());
        }
        i += 1;
    }
    None
}

fn parse_num<T: std::str::FromStr>(what: &str, v: &str) -> AppResult<T> {
    v.trim()
        .parse::<T>()
        .map_err(|_| AppError::configuration("invalid_number".to_string(), format!("{}: '{}' is not a valid number", what, v)))
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
