use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gemen::bot::Bot;
use gemen::cache::{sync, CacheDefaults, CacheManager};
use gemen::chat::ChatPipeline;
use gemen::config::Config;
use gemen::db::Db;
use gemen::embeddings::EmbeddingClient;
use gemen::health::spawn_health_server;
use gemen::services::Services;
use gemen::telegram::TelegramClient;
use gemen::tools::{FetchTool, MemoryTool, SearchTool, ToolRegistry, TtsTool, WikipediaTool};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    let db = Arc::new(Db::connect(&config.database_url).await?);
    db.migrate().await?;

    let cache = Arc::new(CacheManager::new(CacheDefaults::from_config(&config)));
    sync::load_from_database(&db, &cache).await?;
    let sync_handle = sync::spawn_sync_loop(db.clone(), cache.clone());

    let embeddings = EmbeddingClient::from_config(&config);
    if embeddings.is_none() {
        info!("no embedding provider configured; memories will be stored without vectors");
    }
    let services = Services::new(cache.clone(), embeddings, &config);

    let tts = Arc::new(TtsTool::new(
        services.clone(),
        config.tts_api_key.clone(),
        config.tts_endpoint.clone(),
        config.tts_voice.clone(),
        config.tts_style.clone(),
    ));
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(MemoryTool::new(services.clone())));
    registry.register(Arc::new(SearchTool::new(
        config.browserless_token.clone(),
        config.ollama_api_key.clone(),
    )));
    registry.register(Arc::new(FetchTool::new(config.jina_api_key.clone())));
    registry.register(Arc::new(WikipediaTool::new()));
    registry.register(tts.clone());
    let registry = Arc::new(registry);

    let health_handle = spawn_health_server(config.health_port);

    let telegram = TelegramClient::new(&config.telegram_token, config.telegram_api_base.as_deref());
    let pipeline = ChatPipeline::new(services.clone(), registry, telegram.clone(), tts);
    let bot = Bot::new(telegram, pipeline, services).await?;

    let bot_handle = tokio::spawn(bot.run());

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    // Stop taking updates, give in-flight turns a moment, then flush.
    bot_handle.abort();
    tokio::time::sleep(Duration::from_secs(2)).await;
    sync_handle.abort();
    health_handle.abort();
    if let Err(e) = sync::sync_to_database(&db, &cache).await {
        warn!("final sync failed: {e:#}");
    }
    info!("shutdown complete");

    Ok(())
}
