use anyhow::Context;
use clap::Parser;
use sidx_core::{IndexerRegistry, StateStore};
use sidx_indexer::{DispatchConfig, OnlineDispatcher, Reindexer, ReindexerConfig};
use sidx_service::{build_router, AppState};
use sidx_storage::{QueueConfig, ReindexStore, SqliteStateStore};
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_ADDR: &str = "127.0.0.1:9180";
const DEFAULT_DB_PATH: &str = "sidx.db";

#[derive(Clone, Debug)]
struct Config {
    addr: String,
    db_path: PathBuf,
    auto_reindex: bool,
    max_attempts: u32,
    reindex_poll_interval: Duration,
    debug: bool,
}

#[derive(Parser, Debug)]
#[command(name = "sidx-service")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value = "")]
    db_path: String,
    #[arg(long, default_value_t = false)]
    auto_reindex: bool,
    #[arg(long, default_value_t = sidx_core::DEFAULT_MAX_ATTEMPTS)]
    max_attempts: u32,
    /// Idle wait between queue polls; zero busy-polls the store.
    #[arg(long, default_value_t = 1_000)]
    reindex_poll_interval_ms: u64,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config();
    init_logging(&config);

    let addr: SocketAddr = config
        .addr
        .parse()
        .with_context(|| format!("invalid listen address {}", config.addr))?;

    // Indexers are announced by service discovery, which embedders wire in
    // through the registry before serving.
    let registry = Arc::new(IndexerRegistry::new());
    let queue = Arc::new(
        ReindexStore::open(
            &config.db_path,
            registry.clone(),
            QueueConfig {
                max_attempts: config.max_attempts,
                ..QueueConfig::default()
            },
        )
        .with_context(|| format!("open reindex queue at {}", config.db_path.display()))?,
    );
    let states = Arc::new(
        SqliteStateStore::open(&config.db_path)
            .with_context(|| format!("open state store at {}", config.db_path.display()))?,
    );
    let reindexer = Arc::new(Reindexer::new(
        queue,
        states.clone() as Arc<dyn StateStore>,
        ReindexerConfig {
            idle_poll_interval: config.reindex_poll_interval,
            ..ReindexerConfig::default()
        },
    ));
    let dispatcher = Arc::new(OnlineDispatcher::new(registry, DispatchConfig::default()));

    let shutdown = CancellationToken::new();
    let reindex_task = config.auto_reindex.then(|| {
        let reindexer = reindexer.clone();
        let cancel = shutdown.child_token();
        tokio::spawn(async move { reindexer.run(cancel).await })
    });

    let app = build_router(Arc::new(AppState {
        reindexer,
        dispatcher,
        states,
        auto_reindex: config.auto_reindex,
        shutdown: shutdown.clone(),
    }));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(
        event = "service_start",
        addr = %addr,
        db_path = %config.db_path.display(),
        auto_reindex = config.auto_reindex
    );

    let signal = shutdown.clone();
    let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!(event = "service_shutdown");
        signal.cancel();
    });
    if let Err(err) = serve.await {
        error!(event = "service_error", error = %err);
    }

    shutdown.cancel();
    if let Some(task) = reindex_task {
        let _ = task.await;
    }
    Ok(())
}

fn load_config() -> Config {
    let args = Args::parse();
    Config {
        addr: resolve_flag_or_env(&args.addr, "SIDX_ADDR").unwrap_or_else(|| DEFAULT_ADDR.into()),
        db_path: resolve_flag_or_env(&args.db_path, "SIDX_DB_PATH")
            .unwrap_or_else(|| DEFAULT_DB_PATH.into())
            .into(),
        auto_reindex: args.auto_reindex || env_true("SIDX_AUTO_REINDEX"),
        max_attempts: args.max_attempts.max(1),
        reindex_poll_interval: Duration::from_millis(args.reindex_poll_interval_ms),
        debug: args.debug,
    }
}

fn init_logging(config: &Config) {
    let level = if config.debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("SIDX_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn resolve_flag_or_env(flag: &str, key: &str) -> Option<String> {
    if !flag.trim().is_empty() {
        return Some(flag.to_string());
    }
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}
