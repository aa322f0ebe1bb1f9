use crate::error::Result;
use crate::models::TrackedMessage;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;

/// Outcome of a delete request that reached the remote service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// The message was already gone
    NotFound,
}

/// A page-limited slice of channel history
#[derive(Debug, Clone, Default)]
pub struct RecentHistory {
    /// Oldest first
    pub messages: Vec<TrackedMessage>,
    /// The fetch stopped at its size limit, so older messages may exist that
    /// are not in `messages`
    pub truncated: bool,
}

/// Remote calls the retention engine needs from a chat platform (Discord, etc.)
///
/// Every error returned from these methods is treated as transient: the
/// caller retries or defers, and never gives up on the channel.
#[async_trait]
pub trait ChatPlatform: Send + Sync {
    /// Delete a single message
    async fn delete_message(&self, channel_id: &str, message_id: &str) -> Result<DeleteOutcome>;

    /// IDs of every message currently pinned in the channel
    async fn fetch_pinned_messages(&self, channel_id: &str) -> Result<HashSet<String>>;

    /// Recent channel history, oldest first
    ///
    /// # Arguments
    /// * `channel_id` - The channel ID
    /// * `since` - Stop at messages older than this, if set. The backlog
    ///   loader passes `None`: a reconcile needs the full window, since
    ///   messages older than any cutoff are the ones most overdue for deletion.
    async fn fetch_recent_messages(
        &self,
        channel_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<RecentHistory>;
}
