use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use vault_coordination::caller::HttpModelCaller;
use vault_coordination::kv::{MemoryKv, SharedKv};
use vault_coordination::market::CoinGeckoFeed;
use vault_coordination::models::ModelRegistry;
use vault_server::{build_router, tasks, AppState, Cli, VaultConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vault_server=info,vault_coordination=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = VaultConfig::resolve(&cli)?;

    let registry = Arc::new(ModelRegistry::from_env());
    let active: Vec<&str> = registry.active().into_iter().map(|m| m.id.as_str()).collect();
    info!(
        bind = %config.bind,
        asset = %config.chatroom.asset,
        analysts = ?active,
        auto_trade = config.trading.auto_execute,
        "Consensus Vault starting"
    );

    let kv = open_store(&config)?;
    let caller = Arc::new(HttpModelCaller::new(registry.clone()));
    let market = Arc::new(CoinGeckoFeed::new());
    let bind = config.bind.clone();
    let app = AppState::new(config, kv, caller, market, registry);

    let cancel = CancellationToken::new();
    let background = tasks::spawn_all(&app, &cancel);

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {bind}"))?;
    info!(addr = %bind, "listening");

    let shutdown = cancel.clone();
    axum::serve(listener, build_router(app))
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for shutdown signal");
            }
            info!("shutting down");
            shutdown.cancel();
        })
        .await
        .context("HTTP server failed")?;

    cancel.cancel();
    for handle in background {
        let _ = handle.await;
    }
    Ok(())
}

/// RocksDB when built with `heavy-state` and a data dir is set, memory otherwise.
fn open_store(config: &VaultConfig) -> Result<SharedKv> {
    #[cfg(feature = "heavy-state")]
    {
        if let Some(dir) = &config.data_dir {
            let kv = vault_coordination::kv::RocksKv::open(dir)
                .with_context(|| format!("Failed to open RocksDB at {}", dir.display()))?;
            info!(path = %dir.display(), "using RocksDB store");
            return Ok(Arc::new(kv));
        }
    }
    #[cfg(not(feature = "heavy-state"))]
    {
        if config.data_dir.is_some() {
            warn!("data_dir is set but this build lacks heavy-state; using the in-memory store");
        }
    }
    Ok(Arc::new(MemoryKv::new()))
}
