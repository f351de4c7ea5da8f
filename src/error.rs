//! Error taxonomy for the bus.
//!
//! [`BusError`] is what every library operation returns. The variants map
//! directly onto what a caller should do next:
//!
//! - [`BusError::StoreUnavailable`]: transient, retry later.
//! - [`BusError::InvalidArgument`]: caller mistake, never retried.
//! - [`BusError::ClaimConflict`]: lost a claim race, retry immediately.
//! - [`BusError::Config`]: configuration could not be loaded.
//! - [`BusError::TaskJoin`]: a blocking store call died; treated as transient.
//!
//! A consumer loop that runs out of time is *not* an error; see
//! [`crate::consumer::PollOutcome::TimedOut`].

use thiserror::Error;

pub type Result<T, E = BusError> = std::result::Result<T, E>;

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum BusError {
    /// The durable store could not be opened, read or written.
    #[error("store unavailable: {context}: {source}")]
    StoreUnavailable {
        context: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Another poller delivered the same (message, instance) pair first.
    #[error("claim conflict on message {message_id} for instance '{instance_id}'")]
    ClaimConflict { message_id: i64, instance_id: String },

    #[error("configuration error: {0}")]
    Config(String),

    /// A blocking store call panicked or was aborted.
    #[error("task join error: {0}")]
    TaskJoin(String),
}

impl BusError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Whether a caller may retry the same call and expect it to succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BusError::StoreUnavailable { .. }
                | BusError::ClaimConflict { .. }
                | BusError::TaskJoin(_)
        )
    }

    /// Short stable label (snake_case) for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            BusError::StoreUnavailable { .. } => "store_unavailable",
            BusError::InvalidArgument(_) => "invalid_argument",
            BusError::ClaimConflict { .. } => "claim_conflict",
            BusError::Config(_) => "config",
            BusError::TaskJoin(_) => "task_join",
        }
    }

    /// Process exit code used by the CLI: 1 = transient, 2 = caller error.
    pub fn exit_code(&self) -> i32 {
        if self.is_retryable() {
            1
        } else {
            2
        }
    }
}

/// Attach a human-readable context to a rusqlite result.
pub(crate) trait StoreContext<T> {
    fn store_context(self, context: &str) -> Result<T>;

    fn with_store_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T> StoreContext<T> for std::result::Result<T, rusqlite::Error> {
    fn store_context(self, context: &str) -> Result<T> {
        self.map_err(|source| BusError::StoreUnavailable {
            context: context.to_string(),
            source,
        })
    }

    fn with_store_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|source| BusError::StoreUnavailable {
            context: f(),
            source,
        })
    }
}
