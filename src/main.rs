mod backlog;
mod chat_adapter;
mod config;
mod discord;
mod error;
mod events;
mod message_log;
mod models;
mod policy_store;
mod registry;
#[cfg(test)]
mod testing;
mod worker;

use chat_adapter::ChatPlatform;
use config::load_config;
use discord::DiscordRest;
use events::{Bot, GatewayEvent, EVENT_QUEUE_DEPTH};
use policy_store::{PolicyStore, YamlPolicyStore};
use registry::ChannelRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenv::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("autodelete=debug".parse()?)
                .add_directive("info".parse()?),
        )
        .init();

    tracing::info!("Starting AutoDelete daemon v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = load_config()?;
    let settings = config.settings;
    tracing::info!(
        "Policies in {:?}, sweep every {}s, resync every {}s",
        settings.policy_dir,
        settings.sweep_interval_secs,
        settings.resync_interval_secs
    );

    let store: Arc<dyn PolicyStore> = Arc::new(YamlPolicyStore::new(&settings.policy_dir));
    let platform: Arc<dyn ChatPlatform> = Arc::new(DiscordRest::new(
        &config.bot_token,
        &settings.api_base,
        settings.backlog_limit,
    )?);

    let shutdown = CancellationToken::new();
    let registry = Arc::new(ChannelRegistry::new(
        platform.clone(),
        settings.worker_config(),
        shutdown.child_token(),
    ));
    let bot = Bot::new(registry.clone(), store, platform);

    // A gateway connection would feed this queue; in REST-only mode the
    // daemon produces the lifecycle events itself.
    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    let dispatch = tokio::spawn({
        let bot = bot.clone();
        let cancel = shutdown.clone();
        async move { bot.run(events_rx, cancel).await }
    });
    events_tx.send(GatewayEvent::Ready).await?;

    let resync = tokio::spawn(resync_timer(
        events_tx,
        settings.resync_interval(),
        shutdown.clone(),
    ));

    // Setup graceful shutdown
    tracing::info!("Daemon started. Press Ctrl+C to shutdown.");
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");

    shutdown.cancel();
    if let Err(e) = resync.await {
        tracing::error!("Resync timer task failed: {}", e);
    }
    if let Err(e) = dispatch.await {
        tracing::error!("Event dispatch task failed: {}", e);
    }

    let unfinished = registry.shutdown(settings.shutdown_timeout()).await;
    if unfinished > 0 {
        tracing::warn!("{} channel workers were still busy at exit", unfinished);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Periodically ask for a full reconciliation, standing in for gateway resumes
async fn resync_timer(
    events: mpsc::Sender<GatewayEvent>,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately and startup already sent Ready
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => match events.try_send(GatewayEvent::Resumed) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!("Event queue is full, skipping this resync");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            },
        }
    }
}
