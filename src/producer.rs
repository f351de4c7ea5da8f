use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::db::{Audience, Db, MessageType, NewMessage};
use crate::error::{BusError, Result};
use crate::escalation::{Escalation, EscalationTarget};

/// Which instances a broadcast reaches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BroadcastPolicy {
    /// Instances active (and fresh) when the broadcast is enqueued.
    #[default]
    Snapshot,
    /// Any active instance that polls, including later registrations.
    Open,
}

impl fmt::Display for BroadcastPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BroadcastPolicy::Snapshot => f.write_str("snapshot"),
            BroadcastPolicy::Open => f.write_str("open"),
        }
    }
}

impl FromStr for BroadcastPolicy {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "snapshot" => Ok(BroadcastPolicy::Snapshot),
            "open" => Ok(BroadcastPolicy::Open),
            other => Err(BusError::invalid(format!(
                "unknown broadcast policy '{other}'. Valid values: snapshot, open"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Escalate after the message is stored.
    pub urgent: bool,
    /// Overrides the type's default priority.
    pub priority: Option<i64>,
}

impl SendOptions {
    pub fn urgent() -> Self {
        Self {
            urgent: true,
            priority: None,
        }
    }

    pub fn with_priority(priority: i64) -> Self {
        Self {
            urgent: false,
            priority: Some(priority),
        }
    }
}

/// Producer side of the bus: enqueue, then escalate urgent messages.
pub struct Producer {
    db: Arc<Db>,
    escalation: Arc<dyn Escalation>,
    policy: BroadcastPolicy,
    stale_after: Duration,
}

impl Producer {
    pub fn new(db: Arc<Db>, escalation: Arc<dyn Escalation>) -> Self {
        Self {
            db,
            escalation,
            policy: BroadcastPolicy::default(),
            stale_after: Duration::from_secs(6),
        }
    }

    pub fn with_policy(mut self, policy: BroadcastPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Heartbeat age beyond which an instance is left out of snapshot broadcasts.
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn policy(&self) -> BroadcastPolicy {
        self.policy
    }

    /// Send a targeted message. Returns the message id.
    pub fn send(
        &self,
        from: &str,
        to: &str,
        message_type: MessageType,
        payload: impl Into<Vec<u8>>,
        opts: SendOptions,
    ) -> Result<i64> {
        self.enqueue(
            from,
            Audience::Instance(to.to_string()),
            message_type,
            payload.into(),
            opts,
        )
    }

    /// Send to every instance selected by the broadcast policy.
    pub fn broadcast(
        &self,
        from: &str,
        message_type: MessageType,
        payload: impl Into<Vec<u8>>,
        opts: SendOptions,
    ) -> Result<i64> {
        let audience = match self.policy {
            BroadcastPolicy::Snapshot => Audience::Snapshot {
                stale_after: self.stale_after,
            },
            BroadcastPolicy::Open => Audience::Open,
        };
        self.enqueue(from, audience, message_type, payload.into(), opts)
    }

    fn enqueue(
        &self,
        from: &str,
        audience: Audience,
        message_type: MessageType,
        payload: Vec<u8>,
        opts: SendOptions,
    ) -> Result<i64> {
        let urgent = opts.urgent || message_type == MessageType::Urgent;
        let priority = opts.priority.or_else(|| {
            urgent.then(|| MessageType::Urgent.default_priority())
        });
        let target = match &audience {
            Audience::Instance(to) => EscalationTarget::Instance(to.clone()),
            Audience::Snapshot { .. } | Audience::Open => EscalationTarget::All,
        };

        let msg = self.db.enqueue(&NewMessage {
            from_instance: from.to_string(),
            audience,
            message_type,
            priority,
            payload,
        })?;

        if urgent {
            if let Err(e) = self.escalation.notify(&target, msg.id) {
                tracing::warn!(message_id = msg.id, target = %target, "escalation failed: {e:#}");
            }
        }
        Ok(msg.id)
    }
}
