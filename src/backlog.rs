use crate::chat_adapter::ChatPlatform;
use crate::error::Result;
use crate::policy_store::PolicyStore;
use crate::registry::ChannelRegistry;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Channels loaded at once during a full backlog reload
const LOAD_CONCURRENCY: usize = 4;

/// Result of loading a single channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// The worker now tracks `messages` messages from the remote history
    Loaded { messages: usize },
    /// No policy is stored for the channel
    Untracked,
}

/// Summary of a full backlog reload
#[derive(Debug, Default)]
pub struct BacklogReport {
    pub loaded: Vec<String>,
    pub untracked: Vec<String>,
    /// (channel ID, error message)
    pub failed: Vec<(String, String)>,
}

/// Rebuilds channel workers from persisted policies and remote history.
///
/// Safe to run at any time and as often as needed: each load replaces the
/// worker's state with what the remote service reports right now.
#[derive(Clone)]
pub struct BacklogLoader {
    store: Arc<dyn PolicyStore>,
    platform: Arc<dyn ChatPlatform>,
    registry: Arc<ChannelRegistry>,
    /// Held for a whole reload so two reloads never interleave
    reload: Arc<Mutex<()>>,
}

impl BacklogLoader {
    pub fn new(
        store: Arc<dyn PolicyStore>,
        platform: Arc<dyn ChatPlatform>,
        registry: Arc<ChannelRegistry>,
    ) -> Self {
        Self {
            store,
            platform,
            registry,
            reload: Arc::new(Mutex::new(())),
        }
    }

    /// Load one channel's policy, history and pins, and hand them to its worker
    pub async fn load_channel(&self, channel_id: &str) -> Result<LoadOutcome> {
        let Some(config) = self.store.load_policy(channel_id).await? else {
            if self.registry.remove(channel_id) {
                info!(channel_id, "Policy removed, channel no longer tracked");
            }
            return Ok(LoadOutcome::Untracked);
        };
        let policy = match config.policy() {
            Ok(policy) => policy,
            Err(e) => {
                if self.registry.remove(channel_id) {
                    warn!(channel_id, error = %e, "Policy is invalid, channel no longer tracked");
                }
                return Err(e);
            }
        };

        // Pin updates the running worker sees after this point are newer than
        // the pinned set fetched below.
        let seen = self
            .registry
            .resolve(channel_id)
            .map(|worker| (worker.instance(), worker.pin_generation()));

        let history = self.platform.fetch_recent_messages(channel_id, None).await?;
        let pinned = self.platform.fetch_pinned_messages(channel_id).await?;
        let count = history.messages.len();
        debug!(
            channel_id,
            messages = count,
            truncated = history.truncated,
            pinned = pinned.len(),
            "fetched backlog"
        );

        let (worker, created) = self.registry.get_or_create(config.channel(), policy.clone());
        let pin_generation = match seen {
            Some((instance, generation)) if instance == worker.instance() => Some(generation),
            None if created => Some(0),
            _ => None,
        };
        worker.reconcile(history, pinned, policy, pin_generation).await?;

        Ok(LoadOutcome::Loaded { messages: count })
    }

    /// Reload every channel with a stored policy or a running worker.
    ///
    /// A failing channel is logged and reported; the others still load.
    pub async fn load_all_backlogs(&self) -> BacklogReport {
        let _reload = self.reload.lock().await;

        let mut channel_ids: BTreeSet<String> = match self.store.list_channels().await {
            Ok(ids) => ids.into_iter().collect(),
            Err(e) => {
                warn!(error = %e, "could not list stored policies");
                BTreeSet::new()
            }
        };
        channel_ids.extend(self.registry.channel_ids());

        info!("Loading backlogs for {} channels", channel_ids.len());

        let permits = Arc::new(Semaphore::new(LOAD_CONCURRENCY));
        let mut loads = JoinSet::new();
        for channel_id in channel_ids {
            let loader = self.clone();
            let permits = permits.clone();
            loads.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let outcome = loader.load_channel(&channel_id).await;
                (channel_id, outcome)
            });
        }

        let mut report = BacklogReport::default();
        while let Some(joined) = loads.join_next().await {
            match joined {
                Ok((channel_id, Ok(LoadOutcome::Loaded { .. }))) => {
                    report.loaded.push(channel_id)
                }
                Ok((channel_id, Ok(LoadOutcome::Untracked))) => {
                    report.untracked.push(channel_id)
                }
                Ok((channel_id, Err(e))) => {
                    warn!(
                        channel_id = %channel_id,
                        error = %e,
                        "backlog load failed, will retry on next reconnect"
                    );
                    report.failed.push((channel_id, e.to_string()));
                }
                Err(e) => warn!(error = %e, "backlog load task panicked"),
            }
        }
        report.loaded.sort();
        report.untracked.sort();
        report.failed.sort();

        info!(
            loaded = report.loaded.len(),
            untracked = report.untracked.len(),
            failed = report.failed.len(),
            "Backlog load complete"
        );
        report
    }
}
