use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use super::messages::validate_instance_id;
use super::{fmt_ts, stale_cutoff, ts_column, Db};
use crate::error::{Result, StoreContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Active,
    Stopped,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Active => "active",
            InstanceStatus::Stopped => "stopped",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registry row with the derived staleness view.
#[derive(Debug, Clone, Serialize)]
pub struct Instance {
    pub instance_id: String,
    pub location_handle: String,
    pub description: String,
    pub initiative_tag: String,
    pub workdir: String,
    pub status: InstanceStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    /// Derived at read time: `last_heartbeat` older than the threshold.
    pub stale: bool,
}

impl Instance {
    /// Active and heartbeat fresh.
    pub fn is_live(&self) -> bool {
        self.status == InstanceStatus::Active && !self.stale
    }

    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_heartbeat).to_std().unwrap_or_default()
    }
}

/// Parameters for `register`.
#[derive(Debug, Clone, Default)]
pub struct Registration {
    pub instance_id: String,
    pub location_handle: String,
    pub description: String,
    pub initiative_tag: String,
    pub workdir: String,
}

impl Registration {
    pub fn new(instance_id: impl Into<String>, location_handle: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            location_handle: location_handle.into(),
            ..Self::default()
        }
    }
}

const INSTANCE_COLUMNS: &str = "instance_id, location_handle, description, initiative_tag, workdir, \
     status, last_heartbeat, registered_at";

impl Db {
    /// Upsert an instance. Re-registering refreshes metadata, status and
    /// heartbeat; `registered_at` keeps its first value.
    pub fn register(&self, reg: &Registration) -> Result<()> {
        validate_instance_id("instance id", &reg.instance_id)?;
        let now = fmt_ts(Utc::now());

        let conn = self.lock();
        conn.execute(
            "INSERT INTO instances (instance_id, location_handle, description, initiative_tag, workdir, status, last_heartbeat, registered_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'active', ?6, ?6)
             ON CONFLICT(instance_id) DO UPDATE SET
                location_handle = excluded.location_handle,
                description = excluded.description,
                initiative_tag = excluded.initiative_tag,
                workdir = excluded.workdir,
                status = 'active',
                last_heartbeat = excluded.last_heartbeat",
            params![
                reg.instance_id,
                reg.location_handle,
                reg.description,
                reg.initiative_tag,
                reg.workdir,
                now,
            ],
        )
        .with_store_context(|| format!("Failed to register instance '{}'", reg.instance_id))?;

        tracing::info!(instance = %reg.instance_id, location = %reg.location_handle, "instance registered");
        Ok(())
    }

    /// Mark an instance stopped. The row is kept for auditing.
    /// Returns false if the instance was never registered.
    pub fn unregister(&self, instance_id: &str) -> Result<bool> {
        validate_instance_id("instance id", instance_id)?;
        let conn = self.lock();
        let rows = conn
            .execute(
                "UPDATE instances SET status = 'stopped' WHERE instance_id = ?1",
                params![instance_id],
            )
            .store_context("Failed to unregister instance")?;
        if rows > 0 {
            tracing::info!(instance = instance_id, "instance stopped");
        }
        Ok(rows > 0)
    }

    /// Refresh `last_heartbeat`. Returns false for unknown instances.
    pub fn try_heartbeat(&self, instance_id: &str) -> Result<bool> {
        self.try_heartbeat_within(instance_id, self.busy_timeout())
    }

    /// [`Db::try_heartbeat`], waiting at most `budget` for the write lock.
    pub fn try_heartbeat_within(&self, instance_id: &str, budget: Duration) -> Result<bool> {
        self.with_busy_budget(budget, |conn| {
            let rows = conn
                .execute(
                    "UPDATE instances SET last_heartbeat = ?1 WHERE instance_id = ?2",
                    params![fmt_ts(Utc::now()), instance_id],
                )
                .store_context("Failed to write heartbeat")?;
            Ok(rows > 0)
        })
    }

    /// Best-effort heartbeat: failures are logged, never returned.
    pub fn heartbeat(&self, instance_id: &str) {
        self.heartbeat_within(instance_id, self.busy_timeout());
    }

    pub fn heartbeat_within(&self, instance_id: &str, budget: Duration) {
        match self.try_heartbeat_within(instance_id, budget) {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(instance = instance_id, "heartbeat for unregistered instance ignored");
            }
            Err(e) => tracing::warn!(instance = instance_id, "heartbeat failed: {e}"),
        }
    }

    /// Get an instance by ID.
    pub fn get_instance(&self, instance_id: &str, stale_after: Duration) -> Result<Option<Instance>> {
        let cutoff = stale_cutoff(Utc::now(), stale_after);
        let conn = self.lock();
        conn.query_row(
            &format!("SELECT {INSTANCE_COLUMNS} FROM instances WHERE instance_id = ?1"),
            params![instance_id],
            |row| row_to_instance(row, cutoff),
        )
        .optional()
        .store_context("Failed to query instance")
    }

    /// List instances ordered by id. With `active_only`, keeps only active
    /// instances whose heartbeat is fresh.
    pub fn list_instances(&self, active_only: bool, stale_after: Duration) -> Result<Vec<Instance>> {
        let cutoff = stale_cutoff(Utc::now(), stale_after);
        let conn = self.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {INSTANCE_COLUMNS} FROM instances ORDER BY instance_id"
            ))
            .store_context("Failed to prepare instance query")?;
        let rows = stmt
            .query_map([], |row| row_to_instance(row, cutoff))
            .store_context("Failed to list instances")?;

        let mut instances = Vec::new();
        for row in rows {
            let inst = row.store_context("Failed to read instance row")?;
            if !active_only || inst.is_live() {
                instances.push(inst);
            }
        }
        Ok(instances)
    }
}

fn row_to_instance(row: &rusqlite::Row<'_>, cutoff: DateTime<Utc>) -> rusqlite::Result<Instance> {
    let status: String = row.get(5)?;
    let last_heartbeat = ts_column(row, 6)?;
    Ok(Instance {
        instance_id: row.get(0)?,
        location_handle: row.get(1)?,
        description: row.get(2)?,
        initiative_tag: row.get(3)?,
        workdir: row.get(4)?,
        status: if status == "active" {
            InstanceStatus::Active
        } else {
            InstanceStatus::Stopped
        },
        last_heartbeat,
        registered_at: ts_column(row, 7)?,
        stale: last_heartbeat < cutoff,
    })
}
