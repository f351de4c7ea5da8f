//! Wiring of config, store, producer and consumer for one process.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::BusConfig;
use crate::consumer::{Consumer, PollSettings};
use crate::db::{BusStatus, Db, Instance, Registration};
use crate::error::{BusError, Result};
use crate::escalation::{Escalation, FanoutEscalation, LogEscalation, MarkerEscalation};
use crate::notify::{NotificationSurface, MARKER_WATCH_INTERVAL};
use crate::producer::Producer;

pub struct Bus {
    db: Arc<Db>,
    config: BusConfig,
    escalation: Arc<dyn Escalation>,
    surface: Option<NotificationSurface>,
}

impl Bus {
    /// Open an existing store. Fails with `InvalidArgument` if it was never
    /// initialized.
    pub fn open(config: BusConfig) -> Result<Self> {
        let path = config.store_path()?;
        if !path.exists() {
            return Err(BusError::invalid(format!(
                "no bus store at {}; run `agentbus init` first",
                path.display()
            )));
        }
        let db = Db::open(&path, config.busy_timeout())?;
        Self::with_db(Arc::new(db), config)
    }

    /// Create the store (and its directory) if needed, then open it.
    pub fn init(config: BusConfig) -> Result<Self> {
        let path = config.store_path()?;
        let db = Db::create(&path, config.busy_timeout())?;
        tracing::info!(path = %path.display(), "bus store ready");
        Self::with_db(Arc::new(db), config)
    }

    /// Use an already opened store.
    pub fn with_db(db: Arc<Db>, config: BusConfig) -> Result<Self> {
        config.validate()?;
        let surface = config.notify_dir()?.map(NotificationSurface::new);
        let escalation: Arc<dyn Escalation> = match &surface {
            Some(surface) => Arc::new(FanoutEscalation::new(vec![
                Arc::new(LogEscalation) as Arc<dyn Escalation>,
                Arc::new(
                    MarkerEscalation::new(surface.clone())
                        .with_registry(db.clone(), config.stale_after()),
                ) as Arc<dyn Escalation>,
            ])),
            None => Arc::new(LogEscalation),
        };
        Ok(Self {
            db,
            config,
            escalation,
            surface,
        })
    }

    /// Replace the default escalation port.
    pub fn with_escalation(mut self, escalation: Arc<dyn Escalation>) -> Self {
        self.escalation = escalation;
        self
    }

    pub fn db(&self) -> &Arc<Db> {
        &self.db
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn store_path(&self) -> PathBuf {
        self.db.db_path().to_path_buf()
    }

    pub fn notification_surface(&self) -> Option<&NotificationSurface> {
        self.surface.as_ref()
    }

    pub fn producer(&self) -> Producer {
        Producer::new(self.db.clone(), self.escalation.clone())
            .with_policy(self.config.broadcast.policy)
            .with_stale_after(self.config.stale_after())
    }

    pub fn consumer(&self, instance_id: &str) -> Consumer {
        self.consumer_with(instance_id, self.config.poll_settings())
    }

    pub fn consumer_with(&self, instance_id: &str, settings: PollSettings) -> Consumer {
        let consumer = Consumer::new(self.db.clone(), instance_id, settings);
        match &self.surface {
            Some(surface) => consumer.with_notification_surface(surface.clone()),
            None => consumer,
        }
    }

    /// Wake `consumer` whenever its `check_now` marker is touched, so an
    /// urgent send from another process cuts the poll sleep short. Runs until
    /// `stop` or the consumer's own token is cancelled. `None` without a
    /// notification directory.
    pub fn watch_markers(
        &self,
        consumer: &Consumer,
        stop: &CancellationToken,
    ) -> Option<JoinHandle<()>> {
        let surface = self.surface.clone()?;
        let cancel = consumer.cancel_token();
        let watch = surface.watch_marker(
            consumer.instance_id().to_string(),
            consumer.wake_handle(),
            MARKER_WATCH_INTERVAL,
            stop.clone(),
        );
        Some(tokio::spawn(async move {
            tokio::select! {
                _ = watch => {}
                _ = cancel.cancelled() => {}
            }
        }))
    }

    pub fn register(&self, reg: &Registration) -> Result<()> {
        self.db.register(reg)
    }

    pub fn unregister(&self, instance_id: &str) -> Result<bool> {
        self.db.unregister(instance_id)
    }

    pub fn heartbeat(&self, instance_id: &str) -> Result<bool> {
        self.db.try_heartbeat(instance_id)
    }

    pub fn get_instance(&self, instance_id: &str) -> Result<Option<Instance>> {
        self.db.get_instance(instance_id, self.config.stale_after())
    }

    pub fn list_instances(&self, active_only: bool) -> Result<Vec<Instance>> {
        self.db.list_instances(active_only, self.config.stale_after())
    }

    pub fn status(&self) -> Result<BusStatus> {
        self.db.status(self.config.stale_after())
    }
}
