use crate::error::{AutodeleteError, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A monitored chat channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub id: String,
    pub guild_id: String,
    /// Display name, only used in log output
    pub name: String,
}

/// A message being tracked for deletion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedMessage {
    pub id: String,
    /// Creation time as reported by the remote service
    pub created_at: DateTime<Utc>,
    pub pinned: bool,
}

/// A new-message notification from the transport layer
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub channel_id: String,
    pub message_id: String,
    pub author: String,
    pub created_at: DateTime<Utc>,
    pub content: String,
}

impl IncomingMessage {
    pub fn to_tracked(&self) -> TrackedMessage {
        TrackedMessage {
            id: self.message_id.clone(),
            created_at: self.created_at,
            pinned: false,
        }
    }
}

/// Decides when a tracked message becomes eligible for deletion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_age: Option<Duration>,
    pub max_count: Option<usize>,
    /// When set, protected messages do not take up `max_count` slots
    pub exclude_pinned: bool,
    /// Message IDs that are never deleted, pinned or not
    pub keep_messages: HashSet<String>,
}

impl RetentionPolicy {
    /// Pinned and explicitly kept messages are never deleted.
    pub fn is_protected(&self, msg: &TrackedMessage) -> bool {
        msg.pinned || self.keep_messages.contains(&msg.id)
    }
}

/// Persisted per-channel configuration, one YAML document per channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub channel_id: String,
    #[serde(default)]
    pub guild_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_count: Option<usize>,
    #[serde(default = "default_exclude_pinned")]
    pub exclude_pinned: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keep_messages: Vec<String>,
}

fn default_exclude_pinned() -> bool {
    true
}

impl ChannelConfig {
    pub fn channel(&self) -> Channel {
        Channel {
            id: self.channel_id.clone(),
            guild_id: self.guild_id.clone(),
            name: self.name.clone(),
        }
    }

    /// Validate the stored limits and build the runtime policy
    pub fn policy(&self) -> Result<RetentionPolicy> {
        let invalid = |reason: &str| AutodeleteError::InvalidPolicy {
            channel_id: self.channel_id.clone(),
            reason: reason.to_string(),
        };

        if self.max_age_secs.is_none() && self.max_count.is_none() {
            return Err(invalid("neither max_age_secs nor max_count is set"));
        }
        if self.max_count == Some(0) {
            return Err(invalid("max_count must be at least 1"));
        }

        let max_age = match self.max_age_secs {
            Some(0) => return Err(invalid("max_age_secs must be at least 1")),
            Some(secs) => Some(
                i64::try_from(secs)
                    .ok()
                    .and_then(Duration::try_seconds)
                    .ok_or_else(|| invalid("max_age_secs is out of range"))?,
            ),
            None => None,
        };

        Ok(RetentionPolicy {
            max_age,
            max_count: self.max_count,
            exclude_pinned: self.exclude_pinned,
            keep_messages: self.keep_messages.iter().cloned().collect(),
        })
    }
}
