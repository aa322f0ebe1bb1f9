use crate::chat_adapter::{ChatPlatform, DeleteOutcome, RecentHistory};
use crate::error::{AutodeleteError, Result};
use crate::message_log::MessageLog;
use crate::models::{Channel, RetentionPolicy, TrackedMessage};
use chrono::Utc;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

/// How many confirmed deletions a worker remembers for reconciliation
const RECENT_DELETIONS: usize = 512;
/// Commands buffered per channel before senders wait
const QUEUE_DEPTH: usize = 256;
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(60);

/// Tunables shared by every channel worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Upper bound between two expiry evaluations of an idle channel
    pub sweep_interval: Duration,
    /// Retries after the first failed delete attempt
    pub delete_retries: u32,
    /// Delay before the first retry, doubled on each further retry
    pub retry_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(300),
            delete_retries: 3,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

impl WorkerConfig {
    /// Wait before retry number `attempt` (zero-based)
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        self.retry_backoff
            .checked_mul(2u32.saturating_pow(attempt))
            .map_or(MAX_RETRY_BACKOFF, |delay| {
                std::cmp::min(delay, MAX_RETRY_BACKOFF)
            })
    }
}

enum WorkerCommand {
    AddMessage(TrackedMessage),
    UpdatePins(String),
    UpdatePolicy(RetentionPolicy),
    Reconcile {
        history: RecentHistory,
        pinned: HashSet<String>,
        policy: RetentionPolicy,
        pin_generation: Option<u64>,
        done: oneshot::Sender<()>,
    },
    Sweep,
    Snapshot(oneshot::Sender<Vec<TrackedMessage>>),
}

/// Cheap, cloneable handle to a running channel worker
#[derive(Clone)]
pub struct WorkerHandle {
    channel_id: String,
    instance: Uuid,
    tx: mpsc::Sender<WorkerCommand>,
    /// Bumped on every pin update sent to the worker
    pin_generation: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl WorkerHandle {
    /// Spawn the worker task for `channel`
    pub fn spawn(
        channel: Channel,
        policy: RetentionPolicy,
        platform: Arc<dyn ChatPlatform>,
        config: WorkerConfig,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let instance = Uuid::new_v4();
        let pin_generation = Arc::new(AtomicU64::new(0));
        let handle = Self {
            channel_id: channel.id.clone(),
            instance,
            tx,
            pin_generation: pin_generation.clone(),
            cancel: cancel.clone(),
        };

        let span = tracing::info_span!(
            "worker",
            channel_id = %channel.id,
            channel = %channel.name,
            guild_id = %channel.guild_id,
            instance = %instance
        );
        let worker = ChannelWorker {
            channel,
            policy,
            log: MessageLog::new(),
            pins: PinCursor::default(),
            pin_generation,
            recently_deleted: RecentDeletions::default(),
            retry_at: None,
            platform,
            config,
            cancel,
        };
        let task = tokio::spawn(worker.run(rx).instrument(span));

        (handle, task)
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn instance(&self) -> Uuid {
        self.instance
    }

    /// The task has exited and no longer accepts commands
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub async fn add_message(&self, msg: TrackedMessage) -> Result<()> {
        self.send(WorkerCommand::AddMessage(msg)).await
    }

    /// An empty timestamp means the channel has no pins left
    pub async fn update_pins(&self, last_pin_timestamp: &str) -> Result<()> {
        self.pin_generation.fetch_add(1, Ordering::SeqCst);
        self.send(WorkerCommand::UpdatePins(last_pin_timestamp.to_string())).await
    }

    /// Capture before fetching pins for [`reconcile`](Self::reconcile)
    pub fn pin_generation(&self) -> u64 {
        self.pin_generation.load(Ordering::SeqCst)
    }

    pub async fn update_policy(&self, policy: RetentionPolicy) -> Result<()> {
        self.send(WorkerCommand::UpdatePolicy(policy)).await
    }

    pub async fn sweep(&self) -> Result<()> {
        self.send(WorkerCommand::Sweep).await
    }

    /// Replace the message log and policy with an authoritative fetch.
    ///
    /// `pin_generation` is the value of [`pin_generation`](Self::pin_generation)
    /// taken before `pinned` was fetched, or `None` if unknown. If a pin update
    /// may have arrived since, the fetched set is not trusted on its own and
    /// the pins are refetched before anything is deleted.
    ///
    /// Resolves once the worker has applied it, before any resulting deletes.
    pub async fn reconcile(
        &self,
        history: RecentHistory,
        pinned: HashSet<String>,
        policy: RetentionPolicy,
        pin_generation: Option<u64>,
    ) -> Result<()> {
        let (done, applied) = oneshot::channel();
        self.send(WorkerCommand::Reconcile {
            history,
            pinned,
            policy,
            pin_generation,
            done,
        })
        .await?;
        applied.await.map_err(|_| self.gone())
    }

    /// Copy of the current message log, oldest first
    pub async fn snapshot(&self) -> Result<Vec<TrackedMessage>> {
        let (reply, rx) = oneshot::channel();
        self.send(WorkerCommand::Snapshot(reply)).await?;
        rx.await.map_err(|_| self.gone())
    }

    /// Ask the worker to exit after any in-flight delete completes
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    async fn send(&self, cmd: WorkerCommand) -> Result<()> {
        self.tx.send(cmd).await.map_err(|_| self.gone())
    }

    fn gone(&self) -> AutodeleteError {
        AutodeleteError::WorkerGone(self.channel_id.clone())
    }
}

/// Tracks whether the log's pinned flags reflect the channel's latest pin marker
#[derive(Debug, Default)]
struct PinCursor {
    last_pin_timestamp: String,
    stale: bool,
}

impl PinCursor {
    /// Record a pin update. Returns true when the channel has no pins at all.
    fn update(&mut self, last_pin_timestamp: &str) -> bool {
        if last_pin_timestamp.is_empty() {
            self.last_pin_timestamp.clear();
            self.stale = false;
            return true;
        }
        if self.last_pin_timestamp != last_pin_timestamp {
            self.last_pin_timestamp = last_pin_timestamp.to_string();
            self.stale = true;
        }
        false
    }

    fn mark_synced(&mut self) {
        self.stale = false;
    }

    fn mark_stale(&mut self) {
        self.stale = true;
    }
}

/// Bounded memory of message IDs confirmed gone from the remote side
#[derive(Debug, Default)]
struct RecentDeletions {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl RecentDeletions {
    fn insert(&mut self, id: String) {
        if !self.ids.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        if self.order.len() > RECENT_DELETIONS {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }
}

/// Owns one channel's state. Runs as a single task, so every command for the
/// channel is applied in order and no two evaluations overlap.
struct ChannelWorker {
    channel: Channel,
    policy: RetentionPolicy,
    log: MessageLog,
    pins: PinCursor,
    pin_generation: Arc<AtomicU64>,
    recently_deleted: RecentDeletions,
    /// Set after a failed pass so an idle channel does not spin on it
    retry_at: Option<Instant>,
    platform: Arc<dyn ChatPlatform>,
    config: WorkerConfig,
    cancel: CancellationToken,
}

impl ChannelWorker {
    async fn run(mut self, mut rx: mpsc::Receiver<WorkerCommand>) {
        debug!("channel worker started");
        loop {
            let wake = self.next_wake();
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd).await,
                    None => break,
                },
                _ = tokio::time::sleep_until(wake) => self.evaluate_expiry().await,
            }
        }
        debug!(tracked = self.log.len(), "channel worker stopped");
    }

    async fn handle(&mut self, cmd: WorkerCommand) {
        match cmd {
            WorkerCommand::AddMessage(msg) => {
                if self.recently_deleted.contains(&msg.id) {
                    return;
                }
                let message_id = msg.id.clone();
                if self.log.insert(msg) {
                    debug!(message_id = %message_id, "tracking message");
                }
            }
            WorkerCommand::UpdatePins(last_pin_timestamp) => {
                if self.pins.update(&last_pin_timestamp) {
                    self.log.clear_pins();
                    debug!("channel has no pins, all messages follow the policy");
                }
            }
            WorkerCommand::UpdatePolicy(policy) => {
                self.policy = policy;
            }
            WorkerCommand::Reconcile {
                history,
                pinned,
                policy,
                pin_generation,
                done,
            } => {
                self.reconcile(history, pinned, policy, pin_generation);
                let _ = done.send(());
            }
            WorkerCommand::Sweep => {}
            WorkerCommand::Snapshot(reply) => {
                let _ = reply.send(self.log.iter().cloned().collect());
                return;
            }
        }
        self.evaluate_expiry().await;
    }

    fn reconcile(
        &mut self,
        history: RecentHistory,
        mut pinned: HashSet<String>,
        policy: RetentionPolicy,
        pin_generation: Option<u64>,
    ) {
        let RecentHistory {
            mut messages,
            truncated,
        } = history;
        let fetched = messages.len();
        pinned.extend(messages.iter().filter(|m| m.pinned).map(|m| m.id.clone()));

        // Only the fetched window is authoritative; anything older that the
        // log still tracks is kept.
        if truncated {
            if let Some(oldest) = messages.iter().map(|m| m.created_at).min() {
                messages.extend(self.log.iter().filter(|m| m.created_at < oldest).cloned());
            }
        }

        // A pin update arrived after `pinned` was fetched
        let current = self.pin_generation.load(Ordering::SeqCst);
        let pins_moved = pin_generation != Some(current);
        if pins_moved {
            pinned.extend(self.log.pinned_ids().map(str::to_string));
        }

        let recently_deleted = &self.recently_deleted;
        self.log = MessageLog::from_messages(
            messages
                .into_iter()
                .filter(|m| !recently_deleted.contains(&m.id)),
        );
        self.log.apply_pins(&pinned);
        if pins_moved {
            self.pins.mark_stale();
        } else {
            self.pins.mark_synced();
        }
        self.policy = policy;
        self.retry_at = None;

        info!(
            fetched,
            truncated,
            tracked = self.log.len(),
            pinned = pinned.len(),
            pins_moved,
            "backlog reconciled"
        );
    }

    fn next_wake(&self) -> Instant {
        let now = Instant::now();
        let mut wake = now + self.config.sweep_interval;
        if let Some(deadline) = self.log.next_deadline(&self.policy) {
            let wait = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            wake = wake.min(now + wait);
        }
        if let Some(retry_at) = self.retry_at {
            wake = wake.max(retry_at);
        }
        wake
    }

    fn defer(&mut self) {
        self.retry_at = Some(Instant::now() + self.config.sweep_interval);
    }

    async fn evaluate_expiry(&mut self) {
        if self.log.is_empty() {
            return;
        }

        // A pin marker changed since the flags were last synced; one of the
        // candidates may have just been pinned.
        if self.pins.stale && !self.refresh_pins().await {
            self.defer();
            return;
        }

        let expired = self.log.expired(&self.policy, Utc::now());
        if expired.is_empty() {
            self.retry_at = None;
            return;
        }
        debug!(count = expired.len(), "messages expired");

        for msg in expired {
            if self.cancel.is_cancelled() {
                return;
            }
            match self.delete_with_retry(&msg.id).await {
                Ok(outcome) => {
                    self.log.remove(&msg.id);
                    self.recently_deleted.insert(msg.id.clone());
                    match outcome {
                        DeleteOutcome::Deleted => debug!(message_id = %msg.id, "deleted message"),
                        DeleteOutcome::NotFound => {
                            debug!(message_id = %msg.id, "message already gone")
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        message_id = %msg.id,
                        error = %e,
                        "delete failed, deferring to the next cycle"
                    );
                    self.defer();
                    return;
                }
            }
        }
        self.retry_at = None;
    }

    async fn refresh_pins(&mut self) -> bool {
        match self.platform.fetch_pinned_messages(&self.channel.id).await {
            Ok(pinned) => {
                self.log.apply_pins(&pinned);
                self.pins.mark_synced();
                debug!(pinned = pinned.len(), "refreshed pinned messages");
                true
            }
            Err(e) => {
                warn!(error = %e, "could not fetch pinned messages, holding deletes");
                false
            }
        }
    }

    async fn delete_with_retry(&self, message_id: &str) -> Result<DeleteOutcome> {
        let mut attempt = 0;
        loop {
            match self
                .platform
                .delete_message(&self.channel.id, message_id)
                .await
            {
                Ok(outcome) => return Ok(outcome),
                Err(e) if attempt < self.config.delete_retries => {
                    let delay = self.config.retry_delay(attempt);
                    debug!(
                        message_id,
                        attempt,
                        error = %e,
                        "delete failed, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
