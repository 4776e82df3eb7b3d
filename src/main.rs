use std::sync::Arc;

use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vocalx_worker::{
    AppConfig, LoaderSet, ModelRegistry, ResourceGuard, audio::default_encoder, build_router,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Arc::new(AppConfig::from_env()?);
    let loaders = LoaderSet::standard(&config, ResourceGuard::system());
    let registry = Arc::new(ModelRegistry::new(config.artifacts.clone(), loaders));
    tracing::info!(paths = ?registry.paths(), "resolved model artifact directories");

    if !config.preload.is_empty() {
        let report = registry.load_many(&config.preload).await;
        for (backend, error) in &report.errors {
            tracing::warn!(%backend, %error, "preload failed; will retry on first use");
        }
    }

    let router = build_router(config.clone(), registry, default_encoder());

    let listener = TcpListener::bind(config.listen_addr).await?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "worker ready");

    axum::serve(listener, router).await?;

    Ok(())
}

fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,hyper=warn,axum::rejection=trace".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
