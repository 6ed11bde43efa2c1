use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use imggen_rs::config::{
    GenerationSettings, Options, RateLimitSettings, SinkSettings, WorkerSettings,
};
use imggen_rs::generate::GenerationService;
use imggen_rs::limiter::RpmLimiter;
use imggen_rs::rpm::ModelRpmService;
use imggen_rs::sink::ImageSink;
use imggen_rs::storage::channel::{ChannelStore, PgChannelStore, SqliteChannelStore};
use imggen_rs::storage::task::{PgTaskStore, SqliteTaskStore, TaskStore};
use imggen_rs::worker::WorkerPool;
use imggen_rs::AppContext;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    info!("starting image generation service");
    let opts = Options::from_env();

    let database_url = std::env::var("IMGGEN_DATABASE_URL")
        .unwrap_or_else(|_| "sqlite:./imggen_data/imggen.db?mode=rwc".to_string());

    let (task_store, channel_store): (Arc<dyn TaskStore>, Arc<dyn ChannelStore>) =
        if database_url.starts_with("postgres") {
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(10)
                .connect(&database_url)
                .await?;
            (
                Arc::new(PgTaskStore::new(pool.clone()).await?),
                Arc::new(PgChannelStore::new(pool).await?),
            )
        } else {
            std::fs::create_dir_all("./imggen_data")?;
            let pool = sqlx::sqlite::SqlitePoolOptions::new()
                .max_connections(5)
                .connect(&database_url)
                .await?;
            (
                Arc::new(SqliteTaskStore::new(pool.clone()).await?),
                Arc::new(SqliteChannelStore::new(pool).await?),
            )
        };

    let redis_url = std::env::var("IMGGEN_REDIS_URL").ok();
    let limiter = Arc::new(RpmLimiter::new(redis_url.as_deref())?);
    let rpm = Arc::new(ModelRpmService::new(
        limiter,
        RateLimitSettings::from_options(&opts),
    ));

    let sink = Arc::new(ImageSink::from_settings(&SinkSettings::from_options(&opts))?);
    let generation = Arc::new(GenerationService::new(
        channel_store,
        Some(sink),
        GenerationSettings::from_options(&opts),
    ));

    let pool = WorkerPool::new(
        task_store.clone(),
        generation,
        WorkerSettings::from_options(&opts),
    );
    pool.start().await?;

    let ctx = Arc::new(AppContext {
        store: task_store,
        rpm,
    });

    let port = std::env::var("IMGGEN_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(7300u16);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    imggen_rs::web::start_server(ctx, addr).await?;

    // The server returned: the shutdown signal fired. Drain the workers.
    pool.stop().await;
    info!("shut down cleanly");
    Ok(())
}
