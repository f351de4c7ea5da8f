//! Local message bus between cooperating agent instances.
//!
//! A supervisor and its workers share one SQLite file. Producers enqueue
//! targeted or broadcast messages; each instance runs a short-lived
//! consumer loop that claims the next message addressed to it, exactly
//! once, in priority order. Urgent messages additionally go through an
//! escalation port so an idle instance can be woken.

pub mod bus;
pub mod config;
pub mod consumer;
pub mod db;
pub mod error;
pub mod escalation;
pub mod notify;
pub mod producer;

pub use bus::Bus;
pub use config::BusConfig;
pub use consumer::{Consumer, PollOutcome, PollSettings};
pub use db::{Db, Instance, Message, MessageType, Registration};
pub use error::{BusError, Result};
pub use escalation::{Escalation, EscalationTarget};
pub use producer::{BroadcastPolicy, Producer, SendOptions};
