use std::env;

use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use dataroom::config::AppConfig;

const USAGE: &str = "dataroom\n\nUSAGE:\n  dataroom [--http-port N] [--app-id ID] [--backend-config JSON] [--blob-dir PATH] [--max-upload-bytes N]\n\nOPTIONS:\n  --http-port N            HTTP/WS port (env: DATAROOM_HTTP_PORT, default 7878)\n  --app-id ID              Collection namespace (env: DATAROOM_APP_ID, default default-app-id)\n  --backend-config JSON    {\"kind\":\"memory\"} or {\"kind\":\"snapshot\",\"dir\":\"...\"} (env: DATAROOM_BACKEND_CONFIG, required)\n  --blob-dir PATH          Upload blob root (env: DATAROOM_BLOB_DIR, default blobs)\n  --max-upload-bytes N     Largest accepted upload body (env: DATAROOM_MAX_UPLOAD_BYTES, default 268435456)\n\nENVIRONMENT:\n  DATAROOM_UPLOAD_CHUNK_BYTES, DATAROOM_SESSION_TTL_SECS, DATAROOM_BOOTSTRAP_POLICY,\n  DATAROOM_AUTH_TOKENS (token=principal,...), DATAROOM_ALLOW_ANONYMOUS\n";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    fmt().with_env_filter(filter).init();

    let args: Vec<String> = env::args().collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        println!("{}", USAGE);
        return Ok(());
    }

    let cfg = match AppConfig::from_env_and_args(&args) {
        Ok(cfg) => cfg,
        Err(e) => {
            // Configuration errors are reported once and never retried.
            error!(target: "startup", "configuration error: {}", e);
            std::process::exit(2);
        }
    };
    info!(target: "startup", "dataroom {} configured", env!("CARGO_PKG_VERSION"));
    dataroom::server::run(cfg).await
}
