use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use kohakuhub::config::Config;
use kohakuhub::fallback::cache::FallbackCache;
use kohakuhub::git::bridge::GitShaCache;
use kohakuhub::lakefs::LakeFsClient;
use kohakuhub::s3::ObjectStore;
use kohakuhub::store::{AppState, pool};

#[derive(Debug, Parser)]
#[command(name = "kohakuhub", about = "Self-hosted HuggingFace-compatible hub")]
struct Args {
    /// Listen address, overrides KOHAKU_HUB_LISTEN.
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_env("KOHAKU_HUB_LOG").unwrap_or_else(|_| "info".into()))
        .with(fmt::layer())
        .init();

    let args = Args::parse();
    let mut cfg = Config::load();
    if let Some(listen) = args.listen {
        cfg.listen = listen;
    }

    let pool = pool::connect(&cfg.app.db_backend, &cfg.app.database_url).await?;
    let s3 = ObjectStore::new(&cfg.s3)?;
    let lakefs = LakeFsClient::new(
        &cfg.lakefs.endpoint,
        &cfg.lakefs.access_key,
        &cfg.lakefs.secret_key,
    );

    let state = AppState {
        pool,
        s3,
        lakefs,
        http: reqwest::Client::new(),
        fallback_cache: Arc::new(FallbackCache::new(
            cfg.fallback.cache_max_size,
            Duration::from_secs(cfg.fallback.cache_ttl_seconds),
        )),
        git_shas: Arc::new(GitShaCache::default()),
        config: Arc::new(cfg.clone()),
    };

    let app = kohakuhub::api::router()
        .route("/healthz", axum::routing::get(|| async { "ok" }))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive())
        // Commit payloads carry base64 file content; raise the default
        // extractor cap and enforce a hard ceiling.
        .layer(axum::extract::DefaultBodyLimit::max(1024 * 1024 * 1024))
        .layer(tower_http::limit::RequestBodyLimitLayer::new(1024 * 1024 * 1024))
        .with_state(state);

    let addr: SocketAddr = cfg.listen.parse()?;
    tracing::info!(%addr, "starting kohakuhub");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("kohakuhub stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("shutdown signal received");
}
