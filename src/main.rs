use faqdex::db::Database;
use faqdex::indexer::ChannelIndexer;
use faqdex::merge::MessageMerger;
use faqdex::scheduler::{PresenceStatus, SyncGate, SyncScheduler};
use faqdex::source::DiscordSource;
use faqdex::vecdb::ChromaClient;
use faqdex::worker::{WorkerContext, WorkerPool};
use faqdex::{commands, config::Config, Data};
use poise::serenity_prelude as serenity;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Everything that needs an orderly shutdown once the gateway is gone.
struct Runtime {
    db: Database,
    workers: Arc<WorkerPool>,
    scheduler: JoinHandle<()>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    info!("Configuration loaded: {:?}", config);
    let discord_token = config.discord_token.clone();
    let prefix = config.prefix.clone();

    let (stop_scheduler, shutdown) = watch::channel(false);
    let runtime: Arc<Mutex<Option<Runtime>>> = Arc::new(Mutex::new(None));
    let setup_runtime = Arc::clone(&runtime);

    let framework = poise::Framework::builder()
        .options(poise::FrameworkOptions {
            commands: commands::all(),
            prefix_options: poise::PrefixFrameworkOptions {
                prefix: Some(prefix),
                ..Default::default()
            },
            on_error: |error| Box::pin(commands::on_error(error)),
            event_handler: |_ctx, event, _framework, data| {
                Box::pin(async move {
                    let deleted = match event {
                        serenity::FullEvent::ChannelDelete { channel, .. } => Some(channel.id),
                        serenity::FullEvent::ThreadDelete { thread, .. } => Some(thread.id),
                        _ => None,
                    };
                    if let Some(channel_id) = deleted {
                        match data.indexer.forget_channel(channel_id.get()).await {
                            Ok(true) => info!("Deleted channel {} removed from index", channel_id),
                            Ok(false) => {}
                            Err(e) => error!("Could not forget deleted channel {}: {}", channel_id, e),
                        }
                    }
                    Ok(())
                })
            },
            ..Default::default()
        })
        .setup(move |ctx, ready, framework| {
            Box::pin(async move {
                info!("Bot is ready as {}", ready.user.name);
                poise::builtins::register_globally(ctx, &framework.options().commands).await?;

                let db = Database::open(&config.database_url, config.db_pool_size).await?;
                let workers = Arc::new(WorkerPool::start(config.worker_count, |_| {
                    WorkerContext::connect(&config)
                })?);
                let index = Arc::new(ChromaClient::new(
                    &config.vector_db_url,
                    Duration::from_secs(config.embedding_timeout_secs),
                )?);
                let source = Arc::new(DiscordSource::new(
                    Arc::clone(&ctx.http),
                    Arc::clone(&ctx.cache),
                ));

                let gate = SyncGate::new();
                let indexer = Arc::new(ChannelIndexer::new(
                    db.clone(),
                    index,
                    Arc::clone(&workers),
                    source,
                    MessageMerger::new(ready.user.id.get(), config.prefix.clone()),
                    config.chunk_size,
                    &config.vector_db_metric,
                    gate.clone(),
                ));

                let scheduler = Arc::new(SyncScheduler::new(
                    Arc::clone(&indexer),
                    gate,
                    Arc::new(PresenceStatus::new(ctx.clone())),
                    config.sync_interval,
                    config.status_syncing.clone(),
                    config.status_warning.clone(),
                ));
                let scheduler = tokio::spawn(scheduler.run(shutdown));

                *setup_runtime.lock().unwrap_or_else(|e| e.into_inner()) = Some(Runtime {
                    db,
                    workers,
                    scheduler,
                });

                Ok(Data { config, indexer })
            })
        })
        .build();

    let intents = serenity::GatewayIntents::non_privileged()
        | serenity::GatewayIntents::MESSAGE_CONTENT
        | serenity::GatewayIntents::GUILD_MESSAGES;

    let mut client = serenity::ClientBuilder::new(&discord_token, intents)
        .framework(framework)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create client: {}", e))?;

    let shard_manager = client.shard_manager.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Could not listen for Ctrl-C: {}", e);
            return;
        }
        info!("Ctrl-C received, shutting down");
        shard_manager.shutdown_all().await;
    });

    info!("Starting bot...");
    if let Err(why) = client.start().await {
        error!("Client error: {:?}", why);
    }

    let _ = stop_scheduler.send(true);
    let runtime = runtime.lock().unwrap_or_else(|e| e.into_inner()).take();
    if let Some(runtime) = runtime {
        if let Err(e) = runtime.scheduler.await {
            warn!("Sync scheduler ended abnormally: {}", e);
        }
        runtime.workers.shutdown().await;
        runtime.db.close().await;
    }
    info!("Shutdown complete");
    Ok(())
}
