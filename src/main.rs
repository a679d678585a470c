use anyhow::{Context, Result};
use clap::Parser;
use csvledger::{
    server::{self, AppState},
    Config, Store,
};
use std::{fs, sync::Arc};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    // ─── 1) init logging ─────────────────────────────────────────────
    let env = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    fmt::Subscriber::builder().with_env_filter(env).init();
    info!("startup");

    // ─── 2) staging dir + store ──────────────────────────────────────
    fs::create_dir_all(&config.upload_dir).with_context(|| {
        format!(
            "failed to create upload dir {}",
            config.upload_dir.display()
        )
    })?;
    let store = Store::open(&config.db_path)
        .with_context(|| format!("failed to open store at {}", config.db_path.display()))?;
    let state = AppState::new(
        Arc::new(store),
        config.upload_dir.clone(),
        config.max_upload_bytes,
    );

    // ─── 3) serve until ctrl-c ───────────────────────────────────────
    let (addr, serving) = warp::serve(server::routes(state))
        .try_bind_with_graceful_shutdown(config.socket_addr(), async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("failed to listen for ctrl-c: {}", e);
                std::future::pending::<()>().await;
            }
            info!("shutdown requested");
        })
        .with_context(|| format!("failed to bind {}", config.socket_addr()))?;

    info!("Server is running on http://localhost:{}", addr.port());
    info!(db = %config.db_path.display(), uploads = %config.upload_dir.display(), "ready");
    serving.await;

    info!("all done");
    Ok(())
}
