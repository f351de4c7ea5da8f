//! Escalation port: how the bus tells the outside world that an urgent
//! message is waiting.
//!
//! Escalation is advisory. Consumer loops claim every message eventually
//! by polling, so the producer logs escalation failures and moves on.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

use crate::db::Db;
use crate::notify::NotificationSurface;

/// Who an urgent message concerns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscalationTarget {
    Instance(String),
    /// A broadcast: everyone who might be idle.
    All,
}

impl fmt::Display for EscalationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EscalationTarget::Instance(id) => f.write_str(id),
            EscalationTarget::All => f.write_str("*"),
        }
    }
}

/// Called synchronously after an urgent message is durably stored.
pub trait Escalation: Send + Sync {
    fn notify(&self, target: &EscalationTarget, message_id: i64) -> anyhow::Result<()>;
}

/// Discards every escalation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEscalation;

impl Escalation for NoopEscalation {
    fn notify(&self, _target: &EscalationTarget, _message_id: i64) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Records escalations in the log only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEscalation;

impl Escalation for LogEscalation {
    fn notify(&self, target: &EscalationTarget, message_id: i64) -> anyhow::Result<()> {
        tracing::info!(message_id, target = %target, "urgent message escalated");
        Ok(())
    }
}

/// In-process wake-up: consumer loops subscribe a [`Notify`] per instance
/// and the hub cuts their current sleep short.
#[derive(Default)]
pub struct WakeHub {
    handles: Mutex<HashMap<String, Arc<Notify>>>,
}

impl WakeHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// The wake handle for `instance_id`, created on first use.
    pub fn subscribe(&self, instance_id: &str) -> Arc<Notify> {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        handles
            .entry(instance_id.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    pub fn unsubscribe(&self, instance_id: &str) {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        handles.remove(instance_id);
    }

    /// Wake one instance. Returns false if nobody subscribed under that id.
    /// A wake sent while the loop is busy is stored and ends its next sleep.
    pub fn wake(&self, instance_id: &str) -> bool {
        let handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        match handles.get(instance_id) {
            Some(notify) => {
                notify.notify_one();
                true
            }
            None => false,
        }
    }

    /// Wake every subscribed instance. Returns how many were woken.
    pub fn wake_all(&self) -> usize {
        let handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        for notify in handles.values() {
            notify.notify_one();
        }
        handles.len()
    }
}

impl Escalation for WakeHub {
    fn notify(&self, target: &EscalationTarget, message_id: i64) -> anyhow::Result<()> {
        match target {
            EscalationTarget::Instance(id) => {
                if !self.wake(id) {
                    tracing::debug!(message_id, instance = %id, "no local consumer to wake");
                }
            }
            EscalationTarget::All => {
                let woken = self.wake_all();
                tracing::debug!(message_id, woken, "woke local consumers");
            }
        }
        Ok(())
    }
}

/// Cross-process wake-up: touches the `check_now` marker that an external
/// watcher (or `recv --wait`) polls for.
///
/// With a registry attached, a broadcast marks every instance that could
/// still claim it. Without one, only instances that already have a
/// notification directory are marked.
pub struct MarkerEscalation {
    surface: NotificationSurface,
    registry: Option<(Arc<Db>, Duration)>,
}

impl MarkerEscalation {
    pub fn new(surface: NotificationSurface) -> Self {
        Self {
            surface,
            registry: None,
        }
    }

    /// Resolve broadcast recipients from the store.
    pub fn with_registry(mut self, db: Arc<Db>, stale_after: Duration) -> Self {
        self.registry = Some((db, stale_after));
        self
    }

    fn broadcast_recipients(&self, message_id: i64) -> anyhow::Result<Vec<String>> {
        match &self.registry {
            Some((db, stale_after)) => Ok(db.awaiting_recipients(message_id, *stale_after)?),
            None => self.surface.known_instances(),
        }
    }
}

impl Escalation for MarkerEscalation {
    fn notify(&self, target: &EscalationTarget, message_id: i64) -> anyhow::Result<()> {
        match target {
            EscalationTarget::Instance(id) => self.surface.touch_marker(id)?,
            EscalationTarget::All => {
                for id in self.broadcast_recipients(message_id)? {
                    self.surface.touch_marker(&id)?;
                }
            }
        }
        tracing::debug!(message_id, target = %target, "escalation marker written");
        Ok(())
    }
}

/// Forwards to several ports; one failing does not stop the others.
#[derive(Default)]
pub struct FanoutEscalation {
    ports: Vec<Arc<dyn Escalation>>,
}

impl FanoutEscalation {
    pub fn new(ports: Vec<Arc<dyn Escalation>>) -> Self {
        Self { ports }
    }

    pub fn push(&mut self, port: Arc<dyn Escalation>) {
        self.ports.push(port);
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }
}

impl Escalation for FanoutEscalation {
    fn notify(&self, target: &EscalationTarget, message_id: i64) -> anyhow::Result<()> {
        let mut failures = 0usize;
        for port in &self.ports {
            if let Err(e) = port.notify(target, message_id) {
                tracing::warn!(message_id, target = %target, "escalation port failed: {e:#}");
                failures += 1;
            }
        }
        if failures > 0 {
            anyhow::bail!("{failures} of {} escalation ports failed", self.ports.len());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Failing;

    impl Escalation for Failing {
        fn notify(&self, _target: &EscalationTarget, _message_id: i64) -> anyhow::Result<()> {
            anyhow::bail!("terminal is gone")
        }
    }

    #[tokio::test]
    async fn wake_hub_stores_a_permit_for_busy_consumers() {
        let hub = WakeHub::new();
        let handle = hub.subscribe("w1");
        assert!(hub.wake("w1"));
        // The permit was stored before anyone waited.
        tokio::time::timeout(Duration::from_secs(1), handle.notified())
            .await
            .expect("stored wake should resolve immediately");
    }

    #[test]
    fn wake_hub_unknown_and_all() {
        let hub = WakeHub::new();
        assert!(!hub.wake("ghost"));
        hub.subscribe("a");
        hub.subscribe("b");
        assert_eq!(hub.wake_all(), 2);
        hub.unsubscribe("a");
        assert_eq!(hub.wake_all(), 1);
        hub.notify(&EscalationTarget::Instance("ghost".into()), 1)
            .unwrap();
    }

    #[test]
    fn subscribe_returns_same_handle() {
        let hub = WakeHub::new();
        let a = hub.subscribe("w1");
        let b = hub.subscribe("w1");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn marker_escalation_touches_markers() {
        let tmp = TempDir::new().unwrap();
        let surface = NotificationSurface::new(tmp.path());
        surface.touch_marker("b").unwrap();
        surface.clear_marker("b").unwrap();
        std::fs::create_dir_all(tmp.path().join("c")).unwrap();

        let port = MarkerEscalation::new(surface.clone());
        port.notify(&EscalationTarget::Instance("a".into()), 1).unwrap();
        assert!(surface.has_marker("a"));
        assert!(!surface.has_marker("b"));

        port.notify(&EscalationTarget::All, 2).unwrap();
        assert!(surface.has_marker("b"));
        assert!(surface.has_marker("c"));
    }

    #[test]
    fn marker_broadcast_reaches_registered_instances_without_directories() {
        use crate::db::{Audience, MessageType, NewMessage, Registration};

        let tmp = TempDir::new().unwrap();
        let surface = NotificationSurface::new(tmp.path());
        let db = Arc::new(Db::open_in_memory().unwrap());
        for id in ["a", "b", "c"] {
            db.register(&Registration::new(id, "pane")).unwrap();
        }
        let broadcast = |audience| NewMessage {
            from_instance: "a".into(),
            audience,
            message_type: MessageType::Urgent,
            priority: None,
            payload: b"halt".to_vec(),
        };
        let port = MarkerEscalation::new(surface.clone())
            .with_registry(db.clone(), Duration::from_secs(60));

        let snapshot = db
            .enqueue(&broadcast(Audience::Snapshot {
                stale_after: Duration::from_secs(60),
            }))
            .unwrap();
        port.notify(&EscalationTarget::All, snapshot.id).unwrap();
        assert!(surface.has_marker("b"));
        assert!(surface.has_marker("c"));
        assert!(!surface.has_marker("a"));

        // Instances that already claimed are not marked again.
        surface.clear_marker("b").unwrap();
        surface.clear_marker("c").unwrap();
        db.claim_next("b").unwrap().unwrap();
        port.notify(&EscalationTarget::All, snapshot.id).unwrap();
        assert!(!surface.has_marker("b"));
        assert!(surface.has_marker("c"));

        surface.clear_marker("c").unwrap();
        let open = db.enqueue(&broadcast(Audience::Open)).unwrap();
        port.notify(&EscalationTarget::All, open.id).unwrap();
        assert!(surface.has_marker("b"));
        assert!(surface.has_marker("c"));
        assert!(!surface.has_marker("a"));
    }

    #[test]
    fn fanout_reaches_every_port_despite_failures() {
        let hub = Arc::new(WakeHub::new());
        let handle = hub.subscribe("w1");
        let ports: Vec<Arc<dyn Escalation>> = vec![
            Arc::new(Failing) as Arc<dyn Escalation>,
            hub.clone() as Arc<dyn Escalation>,
            Arc::new(LogEscalation) as Arc<dyn Escalation>,
        ];
        let fanout = FanoutEscalation::new(ports);
        assert_eq!(fanout.len(), 3);

        let err = fanout
            .notify(&EscalationTarget::Instance("w1".into()), 9)
            .unwrap_err();
        assert!(err.to_string().contains("1 of 3"));

        tokio_test::block_on(async {
            tokio::time::timeout(Duration::from_secs(1), handle.notified())
                .await
                .expect("hub behind a failing port still fires");
        });
    }
}
