//! In-memory collaborators and builders shared by the unit tests.

use crate::chat_adapter::{ChatPlatform, DeleteOutcome, RecentHistory};
use crate::error::{AutodeleteError, Result};
use crate::models::{Channel, ChannelConfig, RetentionPolicy, TrackedMessage};
use crate::policy_store::PolicyStore;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

pub fn message(id: &str, created_at: DateTime<Utc>, pinned: bool) -> TrackedMessage {
    TrackedMessage {
        id: id.to_string(),
        created_at,
        pinned,
    }
}

pub fn policy(max_age: Option<Duration>, max_count: Option<usize>) -> RetentionPolicy {
    RetentionPolicy {
        max_age,
        max_count,
        exclude_pinned: true,
        keep_messages: HashSet::new(),
    }
}

pub fn channel(id: &str) -> Channel {
    Channel {
        id: id.to_string(),
        guild_id: "1".to_string(),
        name: format!("channel-{id}"),
    }
}

pub fn channel_config(
    id: &str,
    max_age_secs: Option<u64>,
    max_count: Option<usize>,
) -> ChannelConfig {
    ChannelConfig {
        channel_id: id.to_string(),
        guild_id: "1".to_string(),
        name: format!("channel-{id}"),
        max_age_secs,
        max_count,
        exclude_pinned: true,
        keep_messages: Vec::new(),
    }
}

#[derive(Default)]
struct PlatformState {
    history: HashMap<String, Vec<TrackedMessage>>,
    pinned: HashMap<String, HashSet<String>>,
    /// message ID -> remaining transient failures
    delete_failures: HashMap<String, u32>,
    missing: HashSet<String>,
    failing_history: HashSet<String>,
    fail_pin_fetches: bool,
    /// Newest messages a history fetch returns
    history_limit: Option<usize>,
    history_delay: Option<std::time::Duration>,
    /// Cancelled once the first delete succeeds
    cancel_on_delete: Option<CancellationToken>,
    delete_calls: Vec<String>,
    deleted: Vec<String>,
    pin_fetches: usize,
}

/// Scriptable stand-in for the remote chat service
#[derive(Default)]
pub struct FakePlatform {
    state: Mutex<PlatformState>,
    history_in_flight: AtomicUsize,
    max_history_in_flight: AtomicUsize,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, PlatformState> {
        self.state.lock().unwrap()
    }

    pub fn set_history(&self, channel_id: &str, messages: Vec<TrackedMessage>) {
        self.state().history.insert(channel_id.to_string(), messages);
    }

    pub fn set_pinned(&self, channel_id: &str, ids: &[&str]) {
        let ids = ids.iter().map(|id| id.to_string()).collect();
        self.state().pinned.insert(channel_id.to_string(), ids);
    }

    /// Fail the next `times` deletes of `message_id`
    pub fn fail_deletes(&self, message_id: &str, times: u32) {
        self.state()
            .delete_failures
            .insert(message_id.to_string(), times);
    }

    pub fn mark_missing(&self, message_id: &str) {
        self.state().missing.insert(message_id.to_string());
    }

    pub fn fail_history(&self, channel_id: &str) {
        self.state().failing_history.insert(channel_id.to_string());
    }

    pub fn fail_pin_fetches(&self, fail: bool) {
        self.state().fail_pin_fetches = fail;
    }

    pub fn limit_history(&self, limit: usize) {
        self.state().history_limit = Some(limit);
    }

    pub fn delay_history(&self, delay: std::time::Duration) {
        self.state().history_delay = Some(delay);
    }

    pub fn cancel_on_delete(&self, token: CancellationToken) {
        self.state().cancel_on_delete = Some(token);
    }

    /// Most history fetches that were ever running at the same time
    pub fn max_concurrent_history_fetches(&self) -> usize {
        self.max_history_in_flight.load(Ordering::SeqCst)
    }

    /// Every delete request received, in order
    pub fn delete_calls(&self) -> Vec<String> {
        self.state().delete_calls.clone()
    }

    /// Messages actually deleted, in order
    pub fn deleted(&self) -> Vec<String> {
        self.state().deleted.clone()
    }

    pub fn pin_fetches(&self) -> usize {
        self.state().pin_fetches
    }
}

#[async_trait]
impl ChatPlatform for FakePlatform {
    async fn delete_message(&self, channel_id: &str, message_id: &str) -> Result<DeleteOutcome> {
        let mut state = self.state();
        state.delete_calls.push(message_id.to_string());

        if let Some(remaining) = state.delete_failures.get_mut(message_id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(AutodeleteError::PlatformError("503 Service Unavailable".into()));
            }
        }
        if state.missing.contains(message_id) {
            return Ok(DeleteOutcome::NotFound);
        }
        if state
            .pinned
            .get(channel_id)
            .is_some_and(|pins| pins.contains(message_id))
        {
            panic!("pinned message {message_id} was deleted");
        }

        if let Some(history) = state.history.get_mut(channel_id) {
            history.retain(|m| m.id != message_id);
        }
        state.deleted.push(message_id.to_string());
        if let Some(token) = &state.cancel_on_delete {
            token.cancel();
        }
        Ok(DeleteOutcome::Deleted)
    }

    async fn fetch_pinned_messages(&self, channel_id: &str) -> Result<HashSet<String>> {
        let mut state = self.state();
        state.pin_fetches += 1;
        if state.fail_pin_fetches {
            return Err(AutodeleteError::PlatformError("pins unavailable".into()));
        }
        Ok(state.pinned.get(channel_id).cloned().unwrap_or_default())
    }

    async fn fetch_recent_messages(
        &self,
        channel_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<RecentHistory> {
        let delay = self.state().history_delay;
        if let Some(delay) = delay {
            let running = self.history_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_history_in_flight.fetch_max(running, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            self.history_in_flight.fetch_sub(1, Ordering::SeqCst);
        }

        let state = self.state();
        if state.failing_history.contains(channel_id) {
            return Err(AutodeleteError::PlatformError("history unavailable".into()));
        }
        let mut messages: Vec<TrackedMessage> = state
            .history
            .get(channel_id)
            .into_iter()
            .flatten()
            .filter(|m| since.map_or(true, |since| m.created_at >= since))
            .cloned()
            .collect();
        let truncated = state
            .history_limit
            .is_some_and(|limit| messages.len() > limit);
        if let Some(limit) = state.history_limit {
            let skip = messages.len().saturating_sub(limit);
            messages.drain(..skip);
        }
        Ok(RecentHistory {
            messages,
            truncated,
        })
    }
}

/// Policy store backed by a `HashMap`
#[derive(Default)]
pub struct MemoryPolicyStore {
    configs: Mutex<HashMap<String, ChannelConfig>>,
}

impl MemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remove(&self, channel_id: &str) {
        self.configs.lock().unwrap().remove(channel_id);
    }
}

#[async_trait]
impl PolicyStore for MemoryPolicyStore {
    async fn load_policy(&self, channel_id: &str) -> Result<Option<ChannelConfig>> {
        Ok(self.configs.lock().unwrap().get(channel_id).cloned())
    }

    async fn save_policy(&self, config: &ChannelConfig) -> Result<()> {
        self.configs
            .lock()
            .unwrap()
            .insert(config.channel_id.clone(), config.clone());
        Ok(())
    }

    async fn list_channels(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self.configs.lock().unwrap().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
