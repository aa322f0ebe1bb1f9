use crate::chat_adapter::ChatPlatform;
use crate::models::{Channel, RetentionPolicy};
use crate::worker::{WorkerConfig, WorkerHandle};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Entry {
    handle: WorkerHandle,
    task: JoinHandle<()>,
}

/// Maps channel IDs to their running workers.
///
/// The lock only guards structural changes and lookups. It is never held
/// across an `.await`, and per-channel work happens inside the workers.
pub struct ChannelRegistry {
    workers: Arc<RwLock<HashMap<String, Entry>>>,
    platform: Arc<dyn ChatPlatform>,
    config: WorkerConfig,
    cancel: CancellationToken,
}

impl ChannelRegistry {
    pub fn new(
        platform: Arc<dyn ChatPlatform>,
        config: WorkerConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            workers: Arc::new(RwLock::new(HashMap::new())),
            platform,
            config,
            cancel,
        }
    }

    /// Look up the worker for a channel
    pub fn resolve(&self, channel_id: &str) -> Option<WorkerHandle> {
        let workers = self.workers.read().unwrap_or_else(|e| e.into_inner());
        workers
            .get(channel_id)
            .filter(|entry| !entry.handle.is_closed())
            .map(|entry| entry.handle.clone())
    }

    /// Get the channel's worker, spawning it if needed.
    ///
    /// Returns `true` alongside the handle when this call created the worker;
    /// that caller is responsible for loading its backlog.
    pub fn get_or_create(
        &self,
        channel: Channel,
        policy: RetentionPolicy,
    ) -> (WorkerHandle, bool) {
        if let Some(handle) = self.resolve(&channel.id) {
            return (handle, false);
        }

        let mut workers = self.workers.write().unwrap_or_else(|e| e.into_inner());
        // Another caller may have won the race between the two locks
        if let Some(entry) = workers.get(&channel.id) {
            if !entry.handle.is_closed() {
                return (entry.handle.clone(), false);
            }
            tracing::warn!(channel_id = %channel.id, "replacing stopped channel worker");
        }

        let channel_id = channel.id.clone();
        let (handle, task) = WorkerHandle::spawn(
            channel,
            policy,
            self.platform.clone(),
            self.config.clone(),
            self.cancel.child_token(),
        );
        tracing::info!(
            channel_id = %channel_id,
            instance = %handle.instance(),
            "Started channel worker"
        );
        workers.insert(
            channel_id,
            Entry {
                handle: handle.clone(),
                task,
            },
        );

        (handle, true)
    }

    /// Stop tracking a channel. Returns false if it was not tracked.
    pub fn remove(&self, channel_id: &str) -> bool {
        let entry = {
            let mut workers = self.workers.write().unwrap_or_else(|e| e.into_inner());
            workers.remove(channel_id)
        };

        match entry {
            Some(entry) => {
                entry.handle.stop();
                tracing::info!(channel_id, "Stopped channel worker");
                true
            }
            None => false,
        }
    }

    /// IDs of every tracked channel
    pub fn channel_ids(&self) -> Vec<String> {
        let workers = self.workers.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = workers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.workers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Stop every worker and wait up to `timeout` for in-flight deletes.
    ///
    /// Returns the number of workers that did not finish in time.
    pub async fn shutdown(&self, timeout: Duration) -> usize {
        let entries: Vec<Entry> = {
            let mut workers = self.workers.write().unwrap_or_else(|e| e.into_inner());
            workers.drain().map(|(_, entry)| entry).collect()
        };
        if entries.is_empty() {
            return 0;
        }

        tracing::info!("Stopping {} channel workers", entries.len());
        for entry in &entries {
            entry.handle.stop();
        }

        let deadline = tokio::time::Instant::now() + timeout;
        let mut unfinished = 0;
        for entry in entries {
            let channel_id = entry.handle.channel_id().to_string();
            match tokio::time::timeout_at(deadline, entry.task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(channel_id = %channel_id, error = %e, "channel worker panicked")
                }
                Err(_) => {
                    tracing::warn!(channel_id = %channel_id, "channel worker did not stop in time");
                    unfinished += 1;
                }
            }
        }
        unfinished
    }
}
