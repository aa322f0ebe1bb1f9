use crate::models::{RetentionPolicy, TrackedMessage};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};

/// Messages tracked for one channel, oldest first.
///
/// Entries are ordered by their remote creation time. Equal timestamps keep
/// insertion order. Each message ID appears at most once.
#[derive(Debug, Default)]
pub struct MessageLog {
    entries: VecDeque<TrackedMessage>,
    /// message ID -> pinned flag, kept in sync with `entries`
    index: HashMap<String, bool>,
    pinned_count: usize,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a log from an arbitrary batch, sorting it and dropping duplicate IDs
    pub fn from_messages(messages: impl IntoIterator<Item = TrackedMessage>) -> Self {
        let mut messages: Vec<TrackedMessage> = messages.into_iter().collect();
        messages.sort_by_key(|m| m.created_at);

        let mut log = Self::new();
        for msg in messages {
            log.insert(msg);
        }
        log
    }

    /// Insert a message at its chronological position.
    ///
    /// Returns false if a message with the same ID is already tracked.
    pub fn insert(&mut self, msg: TrackedMessage) -> bool {
        if self.index.contains_key(&msg.id) {
            return false;
        }

        self.index.insert(msg.id.clone(), msg.pinned);
        if msg.pinned {
            self.pinned_count += 1;
        }

        let in_order = self
            .entries
            .back()
            .map_or(true, |last| last.created_at <= msg.created_at);
        if in_order {
            self.entries.push_back(msg);
        } else {
            let pos = self
                .entries
                .partition_point(|m| m.created_at <= msg.created_at);
            self.entries.insert(pos, msg);
        }
        true
    }

    /// Remove a message by ID. Deletions are oldest first, so the search
    /// almost always ends at the front.
    pub fn remove(&mut self, id: &str) -> Option<TrackedMessage> {
        let pinned = self.index.remove(id)?;
        if pinned {
            self.pinned_count -= 1;
        }
        let pos = self.entries.iter().position(|m| m.id == id)?;
        self.entries.remove(pos)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrackedMessage> {
        self.entries.iter()
    }

    pub fn pinned_ids(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(|m| m.pinned)
            .map(|m| m.id.as_str())
    }

    /// Overwrite every pinned flag from the authoritative pinned set
    pub fn apply_pins(&mut self, pinned: &HashSet<String>) {
        self.pinned_count = 0;
        for msg in self.entries.iter_mut() {
            msg.pinned = pinned.contains(&msg.id);
            if msg.pinned {
                self.pinned_count += 1;
            }
            self.index.insert(msg.id.clone(), msg.pinned);
        }
    }

    /// Forget every pin; used when the channel reports it has none left
    pub fn clear_pins(&mut self) {
        if self.pinned_count == 0 {
            return;
        }
        for msg in self.entries.iter_mut() {
            msg.pinned = false;
        }
        for pinned in self.index.values_mut() {
            *pinned = false;
        }
        self.pinned_count = 0;
    }

    /// Number of entries that take up a `max_count` slot
    pub fn countable(&self, policy: &RetentionPolicy) -> usize {
        if !policy.exclude_pinned {
            return self.entries.len();
        }
        let kept_unpinned = policy
            .keep_messages
            .iter()
            .filter(|id| self.index.get(id.as_str()) == Some(&false))
            .count();
        self.entries.len() - self.pinned_count - kept_unpinned
    }

    /// Collect the messages that violate `policy` at `now`, oldest first.
    ///
    /// Protected entries are skipped. The scan stops at the first unprotected
    /// entry inside both the age and the count window: every later entry is
    /// newer and therefore inside them too.
    pub fn expired(&self, policy: &RetentionPolicy, now: DateTime<Utc>) -> Vec<TrackedMessage> {
        let mut excess = policy
            .max_count
            .map_or(0, |max| self.countable(policy).saturating_sub(max));

        let mut expired = Vec::new();
        for msg in &self.entries {
            if policy.is_protected(msg) {
                continue;
            }

            let over_count = excess > 0;
            let over_age = policy
                .max_age
                .is_some_and(|max_age| now - msg.created_at >= max_age);
            if !over_count && !over_age {
                break;
            }

            excess = excess.saturating_sub(1);
            expired.push(msg.clone());
        }
        expired
    }

    /// When the oldest unprotected message crosses the age limit
    pub fn next_deadline(&self, policy: &RetentionPolicy) -> Option<DateTime<Utc>> {
        let max_age = policy.max_age?;
        self.entries
            .iter()
            .find(|m| !policy.is_protected(m))
            .map(|m| m.created_at + max_age)
    }
}
