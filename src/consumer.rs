//! Per-instance consumer loop.
//!
//! One run polls until it claims a message, runs out of `max_duration`,
//! exhausts its store-error budget, or is cancelled, then returns. The
//! host decides whether and when to start the next run.
//!
//! ```text
//! Polling ──claim──▶ Delivered
//!    │
//!    ├──deadline──▶ TimedOut
//!    ├──N store errors──▶ Failed
//!    └──cancel──▶ Cancelled
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::db::{Db, Message};
use crate::error::{BusError, Result};
use crate::notify::NotificationSurface;

/// Timing and error budget of one consumer run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub poll_interval: Duration,
    /// Hard timeout for the whole run.
    pub max_duration: Duration,
    /// Consecutive store failures tolerated before giving up.
    pub max_consecutive_errors: u32,
}

impl Default for PollSettings {
    /// - `poll_interval = 3s`
    /// - `max_duration = 10min`
    /// - `max_consecutive_errors = 3`
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            max_duration: Duration::from_secs(600),
            max_consecutive_errors: 3,
        }
    }
}

/// Terminal state of a consumer run.
#[derive(Debug)]
pub enum PollOutcome {
    Delivered(Message),
    /// Nothing was claimable before `max_duration` elapsed.
    TimedOut,
    /// The store kept failing; the host may respawn now or back off.
    Failed(BusError),
    Cancelled,
}

impl PollOutcome {
    pub fn as_label(&self) -> &'static str {
        match self {
            PollOutcome::Delivered(_) => "delivered",
            PollOutcome::TimedOut => "timed_out",
            PollOutcome::Failed(_) => "failed",
            PollOutcome::Cancelled => "cancelled",
        }
    }

    pub fn into_message(self) -> Option<Message> {
        match self {
            PollOutcome::Delivered(msg) => Some(msg),
            _ => None,
        }
    }
}

pub struct Consumer {
    db: Arc<Db>,
    instance_id: String,
    settings: PollSettings,
    wake: Arc<Notify>,
    cancel: CancellationToken,
    surface: Option<NotificationSurface>,
}

impl Consumer {
    pub fn new(db: Arc<Db>, instance_id: impl Into<String>, settings: PollSettings) -> Self {
        Self {
            db,
            instance_id: instance_id.into(),
            settings,
            wake: Arc::new(Notify::new()),
            cancel: CancellationToken::new(),
            surface: None,
        }
    }

    /// Use a shared wake handle, e.g. one from [`crate::escalation::WakeHub::subscribe`].
    pub fn with_wake(mut self, wake: Arc<Notify>) -> Self {
        self.wake = wake;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Write marker and content files on delivery.
    pub fn with_notification_surface(mut self, surface: NotificationSurface) -> Self {
        self.surface = Some(surface);
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn settings(&self) -> PollSettings {
        self.settings
    }

    /// Notifying this handle ends the current sleep and polls immediately.
    pub fn wake_handle(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the loop on a background task.
    pub fn spawn(self) -> JoinHandle<PollOutcome> {
        tokio::spawn(async move { self.run().await })
    }

    pub async fn run(&self) -> PollOutcome {
        let started = Instant::now();
        let deadline = started + self.settings.max_duration;
        let mut consecutive_errors = 0u32;
        let mut polls = 0u64;

        tracing::debug!(
            instance = %self.instance_id,
            poll_interval = ?self.settings.poll_interval,
            max_duration = ?self.settings.max_duration,
            "consumer loop started"
        );

        loop {
            if self.cancel.is_cancelled() {
                return PollOutcome::Cancelled;
            }

            polls += 1;
            let mut retry_now = false;
            match self.claim(deadline).await {
                Ok(Some(msg)) => {
                    self.publish(&msg);
                    self.heartbeat(deadline).await;
                    tracing::info!(
                        instance = %self.instance_id,
                        message_id = msg.id,
                        polls,
                        elapsed = ?started.elapsed(),
                        "message delivered"
                    );
                    return PollOutcome::Delivered(msg);
                }
                Ok(None) => consecutive_errors = 0,
                Err(e) if e.is_retryable() => {
                    consecutive_errors += 1;
                    retry_now = matches!(e, BusError::ClaimConflict { .. });
                    if consecutive_errors >= self.settings.max_consecutive_errors {
                        tracing::error!(
                            instance = %self.instance_id,
                            errors = consecutive_errors,
                            "consumer giving up: {e}"
                        );
                        return PollOutcome::Failed(e);
                    }
                    tracing::warn!(
                        instance = %self.instance_id,
                        errors = consecutive_errors,
                        label = e.as_label(),
                        "poll failed, continuing: {e}"
                    );
                }
                Err(e) => {
                    tracing::error!(instance = %self.instance_id, "consumer cannot poll: {e}");
                    return PollOutcome::Failed(e);
                }
            }

            self.heartbeat(deadline).await;

            let now = Instant::now();
            if now >= deadline {
                tracing::debug!(instance = %self.instance_id, polls, "consumer loop timed out");
                return PollOutcome::TimedOut;
            }
            if retry_now {
                continue;
            }

            let nap = self.settings.poll_interval.min(deadline - now);
            tokio::select! {
                _ = tokio::time::sleep(nap) => {}
                _ = self.wake.notified() => {
                    tracing::debug!(instance = %self.instance_id, "woken before poll interval");
                }
                _ = self.cancel.cancelled() => {
                    tracing::debug!(instance = %self.instance_id, "consumer loop cancelled");
                    return PollOutcome::Cancelled;
                }
            }
        }
    }

    /// Store calls never wait on a locked store past the run's deadline. At
    /// the deadline itself the budget is zero: one attempt, no waiting.
    async fn claim(&self, deadline: Instant) -> Result<Option<Message>> {
        let db = self.db.clone();
        let instance_id = self.instance_id.clone();
        let budget = deadline.saturating_duration_since(Instant::now());
        tokio::task::spawn_blocking(move || db.claim_next_within(&instance_id, budget))
            .await
            .map_err(|e| BusError::TaskJoin(e.to_string()))?
    }

    async fn heartbeat(&self, deadline: Instant) {
        let db = self.db.clone();
        let instance_id = self.instance_id.clone();
        let budget = deadline.saturating_duration_since(Instant::now());
        let task = tokio::task::spawn_blocking(move || db.heartbeat_within(&instance_id, budget));
        if let Err(e) = task.await {
            tracing::warn!(instance = %self.instance_id, "heartbeat task failed: {e}");
        }
    }

    fn publish(&self, msg: &Message) {
        if let Some(surface) = &self.surface {
            if let Err(e) = surface.write_delivery(&self.instance_id, msg) {
                tracing::warn!(
                    instance = %self.instance_id,
                    message_id = msg.id,
                    "failed to write notification files: {e:#}"
                );
            }
        }
    }
}
