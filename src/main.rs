use anyhow::{Context, Result};
use serenity::{model::gateway::GatewayIntents, Client};
use songbird::{SerenityInit, Songbird};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use voicecast::{
    audio::{
        encoder::{EncoderOptions, StreamEncoder},
        session::SessionRegistry,
        songbird_gateway::SongbirdGateway,
        MusicManager,
    },
    bot::{MusicManagerKey, VoicecastBot},
    cache::MusicCache,
    config::Config,
    sources::{SpotifyCatalog, TrackResolver, WorkerPool, YtDlpClient},
    storage::JsonStorage,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("voicecast=debug".parse()?)
                .add_directive("serenity=info".parse()?)
                .add_directive("songbird=info".parse()?),
        )
        .init();

    info!("🎵 Starting voicecast v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load()?;

    if std::env::args().any(|arg| arg == "--health-check") {
        return health_check(&config).await;
    }

    info!("{}", config.summary());

    let storage = Arc::new(JsonStorage::new(config.data_dir.clone()).await?);

    let shutdown = CancellationToken::new();
    let cache = Arc::new(MusicCache::with_ttl(config.cache_size, Some(config.cache_ttl)));
    let sweeper = cache.spawn_sweeper(config.cache_sweep_interval, shutdown.clone());

    let extractor = Arc::new(YtDlpClient::new(config.ytdlp_path.clone()));
    let mut resolver = TrackResolver::new(Arc::clone(&extractor) as _, Arc::clone(&cache));
    if let (Some(id), Some(secret)) = (&config.spotify_client_id, &config.spotify_client_secret) {
        let catalog = SpotifyCatalog::new(id.clone(), secret.clone())
            .context("creating catalog client")?;
        resolver = resolver.with_catalog(Arc::new(catalog));
        info!("🎧 Catalog lookups enabled");
    }
    let pool = Arc::new(WorkerPool::new(
        Arc::new(resolver),
        config.worker_threads,
        config.task_queue_size,
    ));

    let encoder = Arc::new(StreamEncoder::new(EncoderOptions {
        ytdlp_path: config.ytdlp_path.clone(),
        ffmpeg_path: config.ffmpeg_path.clone(),
        bitrate: config.opus_bitrate,
        application: config.opus_application,
    }));
    if let Err(e) = encoder.verify_dependencies().await {
        warn!("⚠️ Streaming tools not usable yet: {}", e);
    }

    let songbird = Songbird::serenity();
    let registry = SessionRegistry::new(
        config.session_settings(),
        Arc::new(SongbirdGateway::new(Arc::clone(&songbird))),
        encoder,
        pool,
    );
    let manager = Arc::new(
        MusicManager::new(registry, extractor, config.max_playlist_size).with_storage(storage),
    );

    let intents = GatewayIntents::GUILDS | GatewayIntents::GUILD_VOICE_STATES;
    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(VoicecastBot::new(Arc::clone(&manager)))
        .register_songbird_with(songbird)
        .await
        .context("building Discord client")?;

    {
        let mut data = client.data.write().await;
        data.insert::<MusicManagerKey>(Arc::clone(&manager));
    }

    let shard_manager = client.shard_manager.clone();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("⚠️ Shutdown signal received, closing..."),
            Err(e) => error!("Could not listen for Ctrl+C: {}", e),
        }
        signal_token.cancel();
        shard_manager.shutdown_all().await;
    });

    info!("🚀 Bot started");
    if let Err(why) = client.start().await {
        error!("Client error: {:?}", why);
    }

    shutdown.cancel();
    manager.shutdown().await;
    if let Err(e) = sweeper.await {
        warn!("Cache sweeper ended abnormally: {}", e);
    }
    info!("👋 Bye");
    Ok(())
}

async fn health_check(config: &Config) -> Result<()> {
    let encoder = StreamEncoder::new(EncoderOptions {
        ytdlp_path: config.ytdlp_path.clone(),
        ffmpeg_path: config.ffmpeg_path.clone(),
        ..Default::default()
    });
    encoder
        .verify_dependencies()
        .await
        .context("missing dependencies")?;
    println!("OK");
    Ok(())
}
