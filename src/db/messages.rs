use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};

use super::{fmt_ts, parse_ts, stale_cutoff, ts_column, Db};
use crate::error::{BusError, Result, StoreContext};

/// Payloads are opaque, but a runaway producer should not be able to bloat
/// the shared store.
pub const MAX_PAYLOAD_BYTES: usize = 1024 * 1024; // 1 MiB

/// How many times `claim_next` re-selects after losing a claim race.
const MAX_CLAIM_ATTEMPTS: usize = 3;

// ── Message types ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Guidance,
    Completion,
    Broadcast,
    Query,
    Response,
    Urgent,
    Heartbeat,
}

impl MessageType {
    pub const ALL: [MessageType; 7] = [
        MessageType::Guidance,
        MessageType::Completion,
        MessageType::Broadcast,
        MessageType::Query,
        MessageType::Response,
        MessageType::Urgent,
        MessageType::Heartbeat,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Guidance => "guidance",
            MessageType::Completion => "completion",
            MessageType::Broadcast => "broadcast",
            MessageType::Query => "query",
            MessageType::Response => "response",
            MessageType::Urgent => "urgent",
            MessageType::Heartbeat => "heartbeat",
        }
    }

    /// Priority used when the producer does not pick one. Lower is served first.
    pub fn default_priority(&self) -> i64 {
        match self {
            MessageType::Urgent => 1,
            MessageType::Guidance => 2,
            MessageType::Query | MessageType::Response => 3,
            MessageType::Completion => 4,
            MessageType::Broadcast => 5,
            MessageType::Heartbeat => 9,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self> {
        let lowered = s.trim().to_ascii_lowercase();
        if lowered == "announcement" {
            return Ok(MessageType::Broadcast);
        }
        MessageType::ALL
            .into_iter()
            .find(|t| t.as_str() == lowered)
            .ok_or_else(|| {
                BusError::invalid(format!(
                    "unknown message type '{s}'. Valid values: guidance, completion, broadcast, query, response, urgent, heartbeat"
                ))
            })
    }
}

// ── Records ──────────────────────────────────────────────────────

/// How the recipients of a message are resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    /// Exactly one recipient.
    Instance(String),
    /// Every active instance with a fresh heartbeat at enqueue time, sender
    /// excluded. Instances registering later never see the message.
    Snapshot { stale_after: Duration },
    /// Every active instance that polls, including ones registered after
    /// the message was sent. Sender excluded.
    Open,
}

impl Audience {
    fn fanout(&self) -> &'static str {
        match self {
            Audience::Instance(_) => "direct",
            Audience::Snapshot { .. } => "snapshot",
            Audience::Open => "open",
        }
    }
}

/// Parameters for creating a new message.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub from_instance: String,
    pub audience: Audience,
    pub message_type: MessageType,
    /// `None` falls back to [`MessageType::default_priority`].
    pub priority: Option<i64>,
    pub payload: Vec<u8>,
}

/// An immutable message row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: i64,
    pub from_instance: String,
    /// `None` for broadcasts.
    pub to_instance: Option<String>,
    pub message_type: MessageType,
    pub priority: i64,
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn is_broadcast(&self) -> bool {
        self.to_instance.is_none()
    }

    pub fn payload_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// Per-recipient delivery record. `delivered_at` is `None` for a snapshot
/// placeholder that has not been claimed yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub message_id: i64,
    pub instance_id: String,
    pub delivered_at: Option<DateTime<Utc>>,
}

const MESSAGE_COLUMNS: &str =
    "m.id, m.from_instance, m.to_instance, m.message_type, m.priority, m.payload, m.created_at";

/// Messages `?1` may still claim: its own undelivered targeted messages,
/// its unclaimed snapshot placeholders, and open broadcasts it has not
/// claimed yet (only while registered as active).
const ELIGIBLE_FROM: &str = "FROM messages m
     LEFT JOIN deliveries d ON d.message_id = m.id AND d.instance_id = ?1
     WHERE (m.fanout = 'direct' AND m.to_instance = ?1 AND d.message_id IS NULL)
        OR (m.fanout = 'snapshot' AND d.message_id IS NOT NULL AND d.delivered_at IS NULL)
        OR (m.fanout = 'open' AND d.message_id IS NULL AND m.from_instance != ?1
            AND EXISTS (SELECT 1 FROM instances i
                        WHERE i.instance_id = ?1 AND i.status = 'active'))";

/// Conditional write: succeeds for a fresh pair or an unclaimed placeholder,
/// changes nothing if the pair was already delivered.
const CLAIM_SQL: &str = "INSERT INTO deliveries (message_id, instance_id, delivered_at)
     VALUES (?1, ?2, ?3)
     ON CONFLICT(message_id, instance_id) DO UPDATE SET delivered_at = excluded.delivered_at
     WHERE deliveries.delivered_at IS NULL";

pub(crate) fn validate_instance_id(kind: &str, id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(BusError::invalid(format!("{kind} must not be empty")));
    }
    if id.chars().any(char::is_whitespace) {
        return Err(BusError::invalid(format!(
            "{kind} '{id}' must not contain whitespace"
        )));
    }
    Ok(())
}

impl Db {
    /// Persist a message and, for snapshot broadcasts, one placeholder
    /// delivery per recipient, in a single transaction.
    pub fn enqueue(&self, msg: &NewMessage) -> Result<Message> {
        validate_instance_id("from instance", &msg.from_instance)?;
        if let Audience::Instance(to) = &msg.audience {
            validate_instance_id("to instance", to)?;
        }
        if msg.payload.len() > MAX_PAYLOAD_BYTES {
            return Err(BusError::invalid(format!(
                "payload exceeds maximum size of {} bytes ({} bytes)",
                MAX_PAYLOAD_BYTES,
                msg.payload.len()
            )));
        }

        let priority = msg
            .priority
            .unwrap_or_else(|| msg.message_type.default_priority());
        let to_instance = match &msg.audience {
            Audience::Instance(to) => Some(to.as_str()),
            _ => None,
        };
        let now = Utc::now();
        let created_at = fmt_ts(now);

        let mut conn = self.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .store_context("Failed to begin enqueue transaction")?;

        tx.execute(
            "INSERT INTO messages (from_instance, to_instance, message_type, priority, payload, fanout, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                msg.from_instance,
                to_instance,
                msg.message_type.as_str(),
                priority,
                msg.payload,
                msg.audience.fanout(),
                created_at,
            ],
        )
        .store_context("Failed to enqueue message")?;
        let id = tx.last_insert_rowid();

        let recipients = match &msg.audience {
            Audience::Snapshot { stale_after } => tx
                .execute(
                    "INSERT INTO deliveries (message_id, instance_id, delivered_at)
                     SELECT ?1, instance_id, NULL FROM instances
                     WHERE status = 'active' AND last_heartbeat >= ?2 AND instance_id != ?3",
                    params![id, fmt_ts(stale_cutoff(now, *stale_after)), msg.from_instance],
                )
                .store_context("Failed to record broadcast recipients")?,
            Audience::Instance(_) => 1,
            Audience::Open => 0,
        };

        tx.commit().store_context("Failed to commit enqueue")?;

        tracing::info!(
            message_id = id,
            from = %msg.from_instance,
            to = to_instance.unwrap_or("*"),
            message_type = %msg.message_type,
            priority,
            recipients,
            "message enqueued"
        );

        Ok(Message {
            id,
            from_instance: msg.from_instance.clone(),
            to_instance: to_instance.map(str::to_string),
            message_type: msg.message_type,
            priority,
            payload: msg.payload.clone(),
            created_at: parse_ts(&created_at).unwrap_or(now),
        })
    }

    /// Atomically claim the next eligible message for `instance_id`:
    /// lowest priority value first, then oldest. Returns `None` when
    /// nothing is eligible.
    pub fn claim_next(&self, instance_id: &str) -> Result<Option<Message>> {
        self.claim_next_within(instance_id, self.busy_timeout())
    }

    /// [`Db::claim_next`], waiting at most `budget` for another writer's
    /// lock before failing with `StoreUnavailable`.
    pub fn claim_next_within(&self, instance_id: &str, budget: Duration) -> Result<Option<Message>> {
        validate_instance_id("instance id", instance_id)?;
        self.with_busy_budget(budget, |conn| claim_locked(conn, instance_id))
    }

    /// Same selection as [`Db::claim_next`], without recording a delivery.
    pub fn peek(&self, instance_id: &str) -> Result<Option<Message>> {
        validate_instance_id("instance id", instance_id)?;
        let conn = self.lock();
        select_eligible(&conn, instance_id)
    }

    /// Number of messages `instance_id` could still claim.
    pub fn pending_count(&self, instance_id: &str) -> Result<u64> {
        let conn = self.lock();
        conn.query_row(
            &format!("SELECT COUNT(*) {ELIGIBLE_FROM}"),
            params![instance_id],
            |row| row.get::<_, i64>(0),
        )
        .map(|n| n as u64)
        .store_context("Failed to count pending messages")
    }

    /// Get a message by ID.
    pub fn get_message(&self, id: i64) -> Result<Option<Message>> {
        let conn = self.lock();
        conn.query_row(
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages m WHERE m.id = ?1"),
            params![id],
            row_to_message,
        )
        .optional()
        .store_context("Failed to query message")
    }

    /// All delivery records for a message, placeholders included.
    pub fn deliveries_for(&self, message_id: i64) -> Result<Vec<Delivery>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT message_id, instance_id, delivered_at FROM deliveries
                 WHERE message_id = ?1 ORDER BY instance_id",
            )
            .store_context("Failed to prepare delivery query")?;
        let rows = stmt
            .query_map(params![message_id], |row| {
                let delivered_at: Option<String> = row.get(2)?;
                Ok(Delivery {
                    message_id: row.get(0)?,
                    instance_id: row.get(1)?,
                    delivered_at: delivered_at.as_deref().and_then(parse_ts),
                })
            })
            .store_context("Failed to query deliveries")?;

        let mut deliveries = Vec::new();
        for row in rows {
            deliveries.push(row.store_context("Failed to read delivery row")?);
        }
        Ok(deliveries)
    }

    /// Instances that could still claim `message_id`: pending snapshot
    /// recipients, the unclaimed target of a direct message, or for an open
    /// broadcast every active fresh instance that has not claimed it yet.
    pub fn awaiting_recipients(
        &self,
        message_id: i64,
        stale_after: Duration,
    ) -> Result<Vec<String>> {
        let cutoff = fmt_ts(stale_cutoff(Utc::now(), stale_after));
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT d.instance_id FROM deliveries d
                 WHERE d.message_id = ?1 AND d.delivered_at IS NULL
                 UNION
                 SELECT m.to_instance FROM messages m
                 WHERE m.id = ?1 AND m.fanout = 'direct'
                   AND NOT EXISTS (SELECT 1 FROM deliveries d
                                   WHERE d.message_id = m.id AND d.delivered_at IS NOT NULL)
                 UNION
                 SELECT i.instance_id FROM messages m JOIN instances i
                 WHERE m.id = ?1 AND m.fanout = 'open'
                   AND i.status = 'active' AND i.last_heartbeat >= ?2
                   AND i.instance_id != m.from_instance
                   AND NOT EXISTS (SELECT 1 FROM deliveries d
                                   WHERE d.message_id = m.id AND d.instance_id = i.instance_id)
                 ORDER BY 1",
            )
            .store_context("Failed to prepare recipient query")?;
        let rows = stmt
            .query_map(params![message_id, cutoff], |row| row.get::<_, String>(0))
            .store_context("Failed to query recipients")?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(row.store_context("Failed to read recipient row")?);
        }
        Ok(ids)
    }
}

fn claim_locked(conn: &mut Connection, instance_id: &str) -> Result<Option<Message>> {
    let mut last_conflict = None;
    for attempt in 1..=MAX_CLAIM_ATTEMPTS {
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .store_context("Failed to begin claim transaction")?;

        let Some(msg) = select_eligible(&tx, instance_id)? else {
            return Ok(None);
        };

        let changed = tx
            .execute(CLAIM_SQL, params![msg.id, instance_id, fmt_ts(Utc::now())])
            .store_context("Failed to record delivery")?;
        if changed == 1 {
            tx.commit().store_context("Failed to commit claim")?;
            tracing::info!(
                message_id = msg.id,
                instance = instance_id,
                "message claimed"
            );
            return Ok(Some(msg));
        }

        tracing::debug!(
            message_id = msg.id,
            instance = instance_id,
            attempt,
            "claim lost to a concurrent poller, retrying"
        );
        last_conflict = Some(msg.id);
    }

    Err(BusError::ClaimConflict {
        message_id: last_conflict.unwrap_or_default(),
        instance_id: instance_id.to_string(),
    })
}

fn select_eligible(conn: &Connection, instance_id: &str) -> Result<Option<Message>> {
    conn.query_row(
        &format!(
            "SELECT {MESSAGE_COLUMNS} {ELIGIBLE_FROM}
             ORDER BY m.priority ASC, m.created_at ASC, m.id ASC
             LIMIT 1"
        ),
        params![instance_id],
        row_to_message,
    )
    .optional()
    .store_context("Failed to select eligible message")
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let raw_type: String = row.get(3)?;
    let message_type = raw_type.parse::<MessageType>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            e.to_string().into(),
        )
    })?;
    Ok(Message {
        id: row.get(0)?,
        from_instance: row.get(1)?,
        to_instance: row.get(2)?,
        message_type,
        priority: row.get(4)?,
        payload: row.get(5)?,
        created_at: ts_column(row, 6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Registration;

    const FRESH: Duration = Duration::from_secs(60);

    fn direct(from: &str, to: &str, message_type: MessageType, payload: &str) -> NewMessage {
        NewMessage {
            from_instance: from.into(),
            audience: Audience::Instance(to.into()),
            message_type,
            priority: None,
            payload: payload.as_bytes().to_vec(),
        }
    }

    fn register(db: &Db, id: &str) {
        db.register(&Registration::new(id, format!("pane:{id}")))
            .unwrap();
    }

    #[test]
    fn message_type_parsing() {
        assert_eq!("guidance".parse::<MessageType>().unwrap(), MessageType::Guidance);
        assert_eq!("URGENT".parse::<MessageType>().unwrap(), MessageType::Urgent);
        assert_eq!(
            "announcement".parse::<MessageType>().unwrap(),
            MessageType::Broadcast
        );
        let err = "gossip".parse::<MessageType>().unwrap_err();
        assert!(matches!(err, BusError::InvalidArgument(_)));
    }

    #[test]
    fn every_type_has_a_default_priority() {
        for t in MessageType::ALL {
            assert!(t.default_priority() > 0, "{t}");
        }
        assert!(MessageType::Urgent.default_priority() < MessageType::Guidance.default_priority());
    }

    #[test]
    fn targeted_message_is_claimed_once() {
        let db = Db::open_in_memory().unwrap();
        let sent = db
            .enqueue(&direct("sup", "w1", MessageType::Guidance, "do the thing"))
            .unwrap();
        assert_eq!(sent.priority, MessageType::Guidance.default_priority());

        let got = db.claim_next("w1").unwrap().unwrap();
        assert_eq!(got, sent);
        assert!(db.claim_next("w1").unwrap().is_none());
    }

    #[test]
    fn targeted_message_invisible_to_others() {
        let db = Db::open_in_memory().unwrap();
        db.enqueue(&direct("sup", "w1", MessageType::Guidance, "x"))
            .unwrap();
        assert!(db.claim_next("w2").unwrap().is_none());
        assert!(db.claim_next("sup").unwrap().is_none());
        assert!(db.claim_next("w1").unwrap().is_some());
    }

    #[test]
    fn priority_beats_arrival_order() {
        let db = Db::open_in_memory().unwrap();
        let mut low = direct("sup", "w1", MessageType::Guidance, "later");
        low.priority = Some(5);
        let mut high = direct("sup", "w1", MessageType::Guidance, "sooner");
        high.priority = Some(1);
        let low = db.enqueue(&low).unwrap();
        let high = db.enqueue(&high).unwrap();

        assert_eq!(db.claim_next("w1").unwrap().unwrap().id, high.id);
        assert_eq!(db.claim_next("w1").unwrap().unwrap().id, low.id);
    }

    #[test]
    fn equal_priority_is_fifo() {
        let db = Db::open_in_memory().unwrap();
        let ids: Vec<i64> = (0..4)
            .map(|i| {
                db.enqueue(&direct("sup", "w1", MessageType::Query, &format!("q{i}")))
                    .unwrap()
                    .id
            })
            .collect();
        let claimed: Vec<i64> = std::iter::from_fn(|| db.claim_next("w1").unwrap())
            .map(|m| m.id)
            .collect();
        assert_eq!(claimed, ids);
    }

    #[test]
    fn ids_are_monotonic() {
        let db = Db::open_in_memory().unwrap();
        let a = db.enqueue(&direct("a", "b", MessageType::Query, "1")).unwrap();
        let b = db.enqueue(&direct("a", "b", MessageType::Query, "2")).unwrap();
        assert!(b.id > a.id);
    }

    #[test]
    fn payload_bytes_survive_storage() {
        let db = Db::open_in_memory().unwrap();
        let payload: Vec<u8> = (0u8..=255).chain([0, 0, 0xff]).collect();
        db.enqueue(&NewMessage {
            from_instance: "a".into(),
            audience: Audience::Instance("b".into()),
            message_type: MessageType::Response,
            priority: None,
            payload: payload.clone(),
        })
        .unwrap();
        let got = db.claim_next("b").unwrap().unwrap();
        assert_eq!(got.payload, payload);
        assert!(got.payload_text().is_none());
    }

    #[test]
    fn oversized_payload_rejected() {
        let db = Db::open_in_memory().unwrap();
        let mut msg = direct("a", "b", MessageType::Query, "");
        msg.payload = vec![b'x'; MAX_PAYLOAD_BYTES + 1];
        let err = db.enqueue(&msg).unwrap_err();
        assert!(matches!(err, BusError::InvalidArgument(_)));
    }

    #[test]
    fn empty_ids_rejected() {
        let db = Db::open_in_memory().unwrap();
        assert!(matches!(
            db.enqueue(&direct("", "b", MessageType::Query, "x")).unwrap_err(),
            BusError::InvalidArgument(_)
        ));
        assert!(matches!(
            db.enqueue(&direct("a", " ", MessageType::Query, "x")).unwrap_err(),
            BusError::InvalidArgument(_)
        ));
        assert!(matches!(
            db.claim_next("").unwrap_err(),
            BusError::InvalidArgument(_)
        ));
    }

    #[test]
    fn peek_has_no_side_effect() {
        let db = Db::open_in_memory().unwrap();
        let sent = db
            .enqueue(&direct("sup", "w1", MessageType::Guidance, "x"))
            .unwrap();
        assert_eq!(db.peek("w1").unwrap().unwrap().id, sent.id);
        assert_eq!(db.peek("w1").unwrap().unwrap().id, sent.id);
        assert!(db.deliveries_for(sent.id).unwrap().is_empty());
        assert_eq!(db.claim_next("w1").unwrap().unwrap().id, sent.id);
        assert!(db.peek("w1").unwrap().is_none());
    }

    #[test]
    fn snapshot_broadcast_fans_out_to_each_active_instance() {
        let db = Db::open_in_memory().unwrap();
        for id in ["sup", "b", "c", "d"] {
            register(&db, id);
        }
        let msg = db
            .enqueue(&NewMessage {
                from_instance: "sup".into(),
                audience: Audience::Snapshot { stale_after: FRESH },
                message_type: MessageType::Broadcast,
                priority: None,
                payload: b"hello all".to_vec(),
            })
            .unwrap();
        assert!(msg.is_broadcast());

        let placeholders = db.deliveries_for(msg.id).unwrap();
        let recipients: Vec<&str> = placeholders.iter().map(|d| d.instance_id.as_str()).collect();
        assert_eq!(recipients, ["b", "c", "d"]);
        assert!(placeholders.iter().all(|d| d.delivered_at.is_none()));

        // One recipient claiming does not consume the message for the others.
        assert_eq!(db.claim_next("c").unwrap().unwrap().id, msg.id);
        assert!(db.claim_next("c").unwrap().is_none());
        assert_eq!(db.claim_next("b").unwrap().unwrap().id, msg.id);
        assert_eq!(db.claim_next("d").unwrap().unwrap().id, msg.id);
        assert!(db.claim_next("sup").unwrap().is_none());
        assert!(db.claim_next("stranger").unwrap().is_none());

        assert!(db
            .deliveries_for(msg.id)
            .unwrap()
            .iter()
            .all(|d| d.delivered_at.is_some()));
    }

    #[test]
    fn snapshot_broadcast_skips_late_and_stopped_instances() {
        let db = Db::open_in_memory().unwrap();
        register(&db, "b");
        register(&db, "gone");
        db.unregister("gone").unwrap();

        db.enqueue(&NewMessage {
            from_instance: "sup".into(),
            audience: Audience::Snapshot { stale_after: FRESH },
            message_type: MessageType::Broadcast,
            priority: None,
            payload: b"x".to_vec(),
        })
        .unwrap();
        register(&db, "late");

        assert!(db.claim_next("b").unwrap().is_some());
        assert!(db.claim_next("gone").unwrap().is_none());
        assert!(db.claim_next("late").unwrap().is_none());
    }

    #[test]
    fn snapshot_broadcast_skips_stale_instances() {
        let db = Db::open_in_memory().unwrap();
        register(&db, "fresh");
        register(&db, "stale");
        db.lock()
            .execute(
                "UPDATE instances SET last_heartbeat = '2000-01-01T00:00:00.000000Z' WHERE instance_id = 'stale'",
                [],
            )
            .unwrap();

        let msg = db
            .enqueue(&NewMessage {
                from_instance: "sup".into(),
                audience: Audience::Snapshot { stale_after: FRESH },
                message_type: MessageType::Broadcast,
                priority: None,
                payload: b"x".to_vec(),
            })
            .unwrap();
        let recipients: Vec<String> = db
            .deliveries_for(msg.id)
            .unwrap()
            .into_iter()
            .map(|d| d.instance_id)
            .collect();
        assert_eq!(recipients, ["fresh"]);
    }

    #[test]
    fn open_broadcast_reaches_late_registrants() {
        let db = Db::open_in_memory().unwrap();
        register(&db, "sup");
        register(&db, "b");
        let msg = db
            .enqueue(&NewMessage {
                from_instance: "sup".into(),
                audience: Audience::Open,
                message_type: MessageType::Broadcast,
                priority: None,
                payload: b"x".to_vec(),
            })
            .unwrap();
        register(&db, "late");

        assert_eq!(db.claim_next("b").unwrap().unwrap().id, msg.id);
        assert_eq!(db.claim_next("late").unwrap().unwrap().id, msg.id);
        assert!(db.claim_next("late").unwrap().is_none());
        // Sender and never-registered instances are excluded.
        assert!(db.claim_next("sup").unwrap().is_none());
        assert!(db.claim_next("stranger").unwrap().is_none());
    }

    #[test]
    fn awaiting_recipients_shrink_as_claims_land() {
        let db = Db::open_in_memory().unwrap();
        for id in ["sup", "b", "c"] {
            register(&db, id);
        }
        let to_b = db.enqueue(&direct("sup", "b", MessageType::Urgent, "x")).unwrap();
        let open = db
            .enqueue(&NewMessage {
                from_instance: "sup".into(),
                audience: Audience::Open,
                message_type: MessageType::Urgent,
                priority: None,
                payload: b"x".to_vec(),
            })
            .unwrap();

        assert_eq!(db.awaiting_recipients(to_b.id, FRESH).unwrap(), ["b"]);
        assert_eq!(db.awaiting_recipients(open.id, FRESH).unwrap(), ["b", "c"]);

        db.claim_next("b").unwrap().unwrap();
        db.claim_next("b").unwrap().unwrap();
        assert!(db.awaiting_recipients(to_b.id, FRESH).unwrap().is_empty());
        assert_eq!(db.awaiting_recipients(open.id, FRESH).unwrap(), ["c"]);
        assert!(db.awaiting_recipients(999, FRESH).unwrap().is_empty());
    }

    #[test]
    fn claim_sql_is_conditional() {
        let db = Db::open_in_memory().unwrap();
        let msg = db
            .enqueue(&direct("a", "b", MessageType::Query, "x"))
            .unwrap();
        let conn = db.lock();
        let now = fmt_ts(Utc::now());
        assert_eq!(conn.execute(CLAIM_SQL, params![msg.id, "b", now]).unwrap(), 1);
        assert_eq!(conn.execute(CLAIM_SQL, params![msg.id, "b", now]).unwrap(), 0);
    }

    #[test]
    fn messages_are_immutable() {
        let db = Db::open_in_memory().unwrap();
        let msg = db
            .enqueue(&direct("a", "b", MessageType::Query, "x"))
            .unwrap();
        let conn = db.lock();
        let err = conn
            .execute("UPDATE messages SET payload = x'00' WHERE id = ?1", params![msg.id])
            .unwrap_err();
        assert!(err.to_string().contains("immutable"));
        let err = conn
            .execute("DELETE FROM messages WHERE id = ?1", params![msg.id])
            .unwrap_err();
        assert!(err.to_string().contains("immutable"));
    }

    #[test]
    fn recorded_delivery_cannot_be_rewritten() {
        let db = Db::open_in_memory().unwrap();
        let msg = db
            .enqueue(&direct("a", "b", MessageType::Query, "x"))
            .unwrap();
        db.claim_next("b").unwrap().unwrap();
        let conn = db.lock();
        let err = conn
            .execute(
                "UPDATE deliveries SET delivered_at = NULL WHERE message_id = ?1",
                params![msg.id],
            )
            .unwrap_err();
        assert!(err.to_string().contains("already recorded"));
    }

    #[test]
    fn pending_count_tracks_eligibility() {
        let db = Db::open_in_memory().unwrap();
        register(&db, "w1");
        db.enqueue(&direct("sup", "w1", MessageType::Guidance, "1"))
            .unwrap();
        db.enqueue(&NewMessage {
            from_instance: "sup".into(),
            audience: Audience::Snapshot { stale_after: FRESH },
            message_type: MessageType::Broadcast,
            priority: None,
            payload: b"2".to_vec(),
        })
        .unwrap();
        assert_eq!(db.pending_count("w1").unwrap(), 2);
        db.claim_next("w1").unwrap();
        assert_eq!(db.pending_count("w1").unwrap(), 1);
        db.claim_next("w1").unwrap();
        assert_eq!(db.pending_count("w1").unwrap(), 0);
    }

    #[test]
    fn get_message_by_id() {
        let db = Db::open_in_memory().unwrap();
        let msg = db
            .enqueue(&direct("a", "b", MessageType::Completion, "done"))
            .unwrap();
        assert_eq!(db.get_message(msg.id).unwrap().unwrap(), msg);
        assert!(db.get_message(msg.id + 100).unwrap().is_none());
    }
}
