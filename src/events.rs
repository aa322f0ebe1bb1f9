use crate::backlog::{BacklogLoader, BacklogReport, LoadOutcome};
use crate::chat_adapter::ChatPlatform;
use crate::models::IncomingMessage;
use crate::policy_store::PolicyStore;
use crate::registry::ChannelRegistry;
use crate::worker::WorkerHandle;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Events buffered between the transport and the dispatcher
pub const EVENT_QUEUE_DEPTH: usize = 1024;

/// Notifications delivered by the transport layer
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    MessageCreate(IncomingMessage),
    ChannelPinsUpdate {
        channel_id: String,
        /// Empty when the channel has no pins left
        last_pin_timestamp: String,
    },
    /// First connection is up
    Ready,
    /// Connection came back after a disconnect
    Resumed,
}

/// Routes transport notifications to the channel workers
#[derive(Clone)]
pub struct Bot {
    registry: Arc<ChannelRegistry>,
    store: Arc<dyn PolicyStore>,
    loader: BacklogLoader,
}

impl Bot {
    pub fn new(
        registry: Arc<ChannelRegistry>,
        store: Arc<dyn PolicyStore>,
        platform: Arc<dyn ChatPlatform>,
    ) -> Self {
        let loader = BacklogLoader::new(store.clone(), platform, registry.clone());
        Self {
            registry,
            store,
            loader,
        }
    }

    /// Consume events until the sender side closes or `cancel` fires.
    ///
    /// Backlog reloads run on a separate task so a slow fetch never holds up
    /// message dispatch. They are applied one at a time in the order received;
    /// a reload requested while another is still queued is folded into it.
    pub async fn run(&self, mut events: mpsc::Receiver<GatewayEvent>, cancel: CancellationToken) {
        let (reload_tx, mut reload_rx) = mpsc::channel::<GatewayEvent>(1);
        let reloads = tokio::spawn({
            let bot = self.clone();
            async move {
                while let Some(event) = reload_rx.recv().await {
                    bot.handle_event(event).await;
                }
            }
        });

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                GatewayEvent::Ready | GatewayEvent::Resumed => match reload_tx.try_send(event) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => debug!("backlog reload already queued"),
                    Err(TrySendError::Closed(_)) => warn!("backlog reload task is gone"),
                },
                event => self.handle_event(event).await,
            }
        }

        drop(reload_tx);
        if cancel.is_cancelled() {
            reloads.abort();
        }
        if let Err(e) = reloads.await {
            if !e.is_cancelled() {
                warn!(error = %e, "backlog reload task panicked");
            }
        }
        debug!("event dispatch stopped");
    }

    pub async fn handle_event(&self, event: GatewayEvent) {
        match event {
            GatewayEvent::MessageCreate(msg) => self.on_message(msg).await,
            GatewayEvent::ChannelPinsUpdate {
                channel_id,
                last_pin_timestamp,
            } => self.on_channel_pins(&channel_id, &last_pin_timestamp).await,
            GatewayEvent::Ready => {
                self.on_ready().await;
            }
            GatewayEvent::Resumed => {
                self.on_resume().await;
            }
        }
    }

    pub async fn on_message(&self, msg: IncomingMessage) {
        debug!(
            channel_id = %msg.channel_id,
            message_id = %msg.message_id,
            author = %msg.author,
            "message received"
        );
        let worker = match self.registry.resolve(&msg.channel_id) {
            Some(worker) => worker,
            None => match self.track_channel(&msg.channel_id).await {
                Some(worker) => worker,
                None => return,
            },
        };

        if let Err(e) = worker.add_message(msg.to_tracked()).await {
            warn!(
                channel_id = %msg.channel_id,
                message_id = %msg.message_id,
                error = %e,
                "could not queue message"
            );
        }
    }

    pub async fn on_channel_pins(&self, channel_id: &str, last_pin_timestamp: &str) {
        let Some(worker) = self.registry.resolve(channel_id) else {
            return;
        };
        info!(channel_id, last_pin_timestamp, "got pins update");
        if let Err(e) = worker.update_pins(last_pin_timestamp).await {
            warn!(channel_id, error = %e, "could not queue pins update");
        }
    }

    /// Load every configured channel
    pub async fn on_ready(&self) -> BacklogReport {
        info!("AutoDelete started, loading channel configs");
        self.loader.load_all_backlogs().await
    }

    /// Reconcile every channel; messages sent while disconnected are not
    /// replayed individually.
    pub async fn on_resume(&self) -> BacklogReport {
        info!("Reconnected, reloading backlogs");
        self.loader.load_all_backlogs().await
    }

    /// Start a worker for a channel seen for the first time, if it has a policy
    async fn track_channel(&self, channel_id: &str) -> Option<WorkerHandle> {
        let config = match self.store.load_policy(channel_id).await {
            Ok(Some(config)) => config,
            Ok(None) => return None,
            Err(e) => {
                warn!(channel_id, error = %e, "could not load channel policy");
                return None;
            }
        };
        let policy = match config.policy() {
            Ok(policy) => policy,
            Err(e) => {
                warn!(channel_id, error = %e, "ignoring channel with invalid policy");
                return None;
            }
        };

        let (worker, created) = self.registry.get_or_create(config.channel(), policy);
        if created {
            let loader = self.loader.clone();
            let channel_id = channel_id.to_string();
            tokio::spawn(async move {
                match loader.load_channel(&channel_id).await {
                    Ok(LoadOutcome::Loaded { messages }) => {
                        debug!(channel_id = %channel_id, messages, "initial backlog loaded")
                    }
                    Ok(LoadOutcome::Untracked) => {}
                    Err(e) => {
                        warn!(channel_id = %channel_id, error = %e, "initial backlog load failed")
                    }
                }
            });
        }
        Some(worker)
    }
}
