//! Durable store for the bus: one SQLite file holding the `instances`,
//! `messages` and `deliveries` tables.
//!
//! Message Store operations live in [`messages`], Registry and liveness
//! operations in [`instances`]. Both are `impl` blocks on [`Db`] so that a
//! single connection (and a single lock discipline) backs the whole bus in
//! one process, while SQLite's own file locking coordinates processes.

pub mod instances;
pub mod messages;

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;

use crate::error::{BusError, Result, StoreContext};

pub use instances::{Instance, InstanceStatus, Registration};
pub use messages::{Audience, Message, MessageType, NewMessage};

/// Bumped whenever the table layout changes.
pub const SCHEMA_VERSION: i64 = 1;

/// Default SQLite busy timeout when the caller does not pick one.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

/// Fixed-width timestamp format: lexical order equals time order.
const TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

/// SQLite-backed bus store.
///
/// Thread safety: wraps `Connection` in `Mutex`. A process shares one `Db`
/// across async tasks via `Arc<Db>`; separate processes open their own.
pub struct Db {
    conn: Mutex<Connection>,
    db_path: PathBuf,
    busy_timeout: Duration,
}

impl Db {
    /// Open (or create) the store at the given path.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path)
            .with_store_context(|| format!("Failed to open bus store: {}", path.display()))?;
        conn.busy_timeout(busy_timeout)
            .store_context("Failed to set busy timeout")?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .store_context("Failed to set SQLite pragmas")?;

        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
            busy_timeout,
        })
    }

    /// Create the parent directory if needed, then open the store.
    pub fn create(path: &Path, busy_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                BusError::invalid(format!(
                    "cannot create store directory {}: {e}",
                    parent.display()
                ))
            })?;
        }
        Self::open(path, busy_timeout)
    }

    /// Create an in-memory store (for tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().store_context("Failed to open in-memory store")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .store_context("Failed to set SQLite pragmas")?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            db_path: PathBuf::from(":memory:"),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn busy_timeout(&self) -> Duration {
        self.busy_timeout
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` with the SQLite busy timeout lowered to `budget` (never raised
    /// above the configured one), then restore it.
    pub(crate) fn with_busy_budget<T>(
        &self,
        budget: Duration,
        f: impl FnOnce(&mut Connection) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.lock();
        let budget = budget.min(self.busy_timeout);
        if budget == self.busy_timeout {
            return f(&mut conn);
        }

        conn.busy_timeout(budget)
            .store_context("Failed to lower busy timeout")?;
        let result = f(&mut conn);
        if let Err(e) = conn.busy_timeout(self.busy_timeout) {
            tracing::warn!("failed to restore busy timeout: {e}");
        }
        result
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        let version: i64 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .store_context("Failed to read schema version")?;
        if version > SCHEMA_VERSION {
            return Err(BusError::invalid(format!(
                "store schema version {version} is newer than supported version {SCHEMA_VERSION}"
            )));
        }

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS instances (
                instance_id     TEXT PRIMARY KEY NOT NULL,
                location_handle TEXT NOT NULL,
                description     TEXT NOT NULL DEFAULT '',
                initiative_tag  TEXT NOT NULL DEFAULT '',
                workdir         TEXT NOT NULL DEFAULT '',
                status          TEXT NOT NULL DEFAULT 'active'
                                CHECK (status IN ('active', 'stopped')),
                last_heartbeat  TEXT NOT NULL,
                registered_at   TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_instances_status_heartbeat
                ON instances(status, last_heartbeat);

            CREATE TABLE IF NOT EXISTS messages (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                from_instance TEXT NOT NULL,
                to_instance   TEXT,
                message_type  TEXT NOT NULL,
                priority      INTEGER NOT NULL,
                payload       BLOB NOT NULL,
                fanout        TEXT NOT NULL DEFAULT 'direct'
                              CHECK (fanout IN ('direct', 'snapshot', 'open')),
                created_at    TEXT NOT NULL,
                CHECK ((to_instance IS NULL) = (fanout != 'direct'))
            );
            CREATE INDEX IF NOT EXISTS idx_messages_to_order
                ON messages(to_instance, priority, created_at, id);
            CREATE INDEX IF NOT EXISTS idx_messages_fanout
                ON messages(fanout, priority, created_at, id);

            CREATE TABLE IF NOT EXISTS deliveries (
                message_id   INTEGER NOT NULL REFERENCES messages(id),
                instance_id  TEXT NOT NULL,
                delivered_at TEXT,
                PRIMARY KEY (message_id, instance_id)
            );
            CREATE INDEX IF NOT EXISTS idx_deliveries_instance
                ON deliveries(instance_id, delivered_at);",
        )
        .store_context("Failed to initialize bus schema")?;

        // Messages are immutable facts; deliveries are written once.
        conn.execute_batch(
            "CREATE TRIGGER IF NOT EXISTS prevent_messages_update
            BEFORE UPDATE ON messages
            BEGIN
                SELECT RAISE(ABORT, 'messages are immutable: UPDATE not allowed');
            END;

            CREATE TRIGGER IF NOT EXISTS prevent_messages_delete
            BEFORE DELETE ON messages
            BEGIN
                SELECT RAISE(ABORT, 'messages are immutable: DELETE not allowed');
            END;

            CREATE TRIGGER IF NOT EXISTS prevent_delivery_rewrite
            BEFORE UPDATE ON deliveries
            WHEN OLD.delivered_at IS NOT NULL
            BEGIN
                SELECT RAISE(ABORT, 'delivery already recorded: UPDATE not allowed');
            END;

            CREATE TRIGGER IF NOT EXISTS prevent_deliveries_delete
            BEFORE DELETE ON deliveries
            BEGIN
                SELECT RAISE(ABORT, 'deliveries are append-only: DELETE not allowed');
            END;",
        )
        .store_context("Failed to create immutability triggers")?;

        if version < SCHEMA_VERSION {
            conn.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION};"))
                .store_context("Failed to record schema version")?;
        }
        Ok(())
    }

    // ── Status ───────────────────────────────────────────────────

    /// Queue depth and instance counts for the `status` command.
    pub fn status(&self, stale_after: Duration) -> Result<BusStatus> {
        let (messages_total, open_broadcasts, deliveries, queue_depth) = {
            let conn = self.lock();
            conn.query_row(
                "SELECT
                    (SELECT COUNT(*) FROM messages),
                    (SELECT COUNT(*) FROM messages WHERE fanout = 'open'),
                    (SELECT COUNT(*) FROM deliveries WHERE delivered_at IS NOT NULL),
                    (SELECT COUNT(*) FROM messages m
                        WHERE m.fanout = 'direct'
                        AND NOT EXISTS (SELECT 1 FROM deliveries d WHERE d.message_id = m.id))
                    + (SELECT COUNT(*) FROM deliveries WHERE delivered_at IS NULL)",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)? as u64,
                        row.get::<_, i64>(1)? as u64,
                        row.get::<_, i64>(2)? as u64,
                        row.get::<_, i64>(3)? as u64,
                    ))
                },
            )
            .store_context("Failed to query queue counts")?
        };

        let instances = self.list_instances(false, stale_after)?;
        let mut counts = InstanceCounts::default();
        let mut pending = Vec::new();
        for inst in &instances {
            counts.total += 1;
            match inst.status {
                InstanceStatus::Stopped => counts.stopped += 1,
                InstanceStatus::Active => {
                    counts.active += 1;
                    if inst.stale {
                        counts.stale += 1;
                    } else {
                        counts.fresh += 1;
                    }
                    pending.push(PendingCount {
                        instance_id: inst.instance_id.clone(),
                        pending: self.pending_count(&inst.instance_id)?,
                    });
                }
            }
        }

        Ok(BusStatus {
            messages_total,
            queue_depth,
            open_broadcasts,
            deliveries,
            instances: counts,
            pending,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstanceCounts {
    pub total: u64,
    pub active: u64,
    pub fresh: u64,
    pub stale: u64,
    pub stopped: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingCount {
    pub instance_id: String,
    pub pending: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BusStatus {
    pub messages_total: u64,
    /// Undelivered targeted messages plus undelivered snapshot placeholders.
    pub queue_depth: u64,
    pub open_broadcasts: u64,
    pub deliveries: u64,
    pub instances: InstanceCounts,
    /// Eligible messages per active instance.
    pub pending: Vec<PendingCount>,
}

// ── Timestamps ───────────────────────────────────────────────────

pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.format(TS_FORMAT).to_string()
}

pub(crate) fn parse_ts(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, TS_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Oldest heartbeat still considered fresh. Heartbeats strictly older are stale.
pub(crate) fn stale_cutoff(now: DateTime<Utc>, stale_after: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(stale_after)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Read a timestamp column, surfacing malformed values as a conversion error.
pub(crate) fn ts_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("malformed timestamp '{raw}'").into(),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn timestamps_roundtrip_and_sort_lexically() {
        let a = Utc::now();
        let b = a + chrono::Duration::microseconds(1);
        let (sa, sb) = (fmt_ts(a), fmt_ts(b));
        assert_eq!(sa.len(), sb.len());
        assert!(sa < sb);
        assert_eq!(parse_ts(&sa).unwrap().timestamp_micros(), a.timestamp_micros());
        assert!(parse_ts("yesterday").is_none());
    }

    #[test]
    fn open_creates_schema_and_version() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("bus.db");
        let db = Db::create(&path, DEFAULT_BUSY_TIMEOUT).unwrap();
        assert_eq!(db.db_path(), path.as_path());

        let conn = db.lock();
        let version: i64 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();
        for expected in ["deliveries", "instances", "messages"] {
            assert!(tables.iter().any(|t| t == expected), "missing table {expected}");
        }
    }

    #[test]
    fn reopening_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bus.db");
        drop(Db::create(&path, DEFAULT_BUSY_TIMEOUT).unwrap());
        drop(Db::open(&path, DEFAULT_BUSY_TIMEOUT).unwrap());
    }

    #[test]
    fn newer_schema_version_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bus.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch("PRAGMA user_version = 99;").unwrap();
        }
        let err = Db::open(&path, DEFAULT_BUSY_TIMEOUT).err().unwrap();
        assert!(matches!(err, BusError::InvalidArgument(_)));
        assert!(err.to_string().contains("newer"));
    }

    #[test]
    fn busy_budget_is_restored_after_call() {
        let tmp = TempDir::new().unwrap();
        let db = Db::create(&tmp.path().join("bus.db"), Duration::from_millis(4000)).unwrap();
        let read = |conn: &mut Connection| -> Result<i64> {
            conn.query_row("PRAGMA busy_timeout", [], |row| row.get(0))
                .store_context("read busy timeout")
        };

        assert_eq!(db.with_busy_budget(Duration::from_millis(250), read).unwrap(), 250);
        assert_eq!(db.with_busy_budget(Duration::from_secs(60), read).unwrap(), 4000);
        assert_eq!(read(&mut *db.lock()).unwrap(), 4000);
    }

    #[test]
    fn status_on_empty_store() {
        let db = Db::open_in_memory().unwrap();
        let status = db.status(Duration::from_secs(6)).unwrap();
        assert_eq!(status.messages_total, 0);
        assert_eq!(status.queue_depth, 0);
        assert_eq!(status.instances, InstanceCounts::default());
        assert!(status.pending.is_empty());
    }
}
