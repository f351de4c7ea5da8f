//! Per-instance notification artifacts, kept outside the durable store:
//!
//! ```text
//! <root>/<instance_id>/check_now     marker: existence means "check now"
//! <root>/<instance_id>/message.json  the last delivered message
//! ```
//!
//! An external watcher decides what to do with them (e.g. wake an idle
//! terminal). [`NotificationSurface::watch_marker`] is the in-crate watcher
//! that `recv --wait` uses to cut its poll sleep short.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::db::{Message, MessageType};

pub const MARKER_FILE: &str = "check_now";
pub const CONTENT_FILE: &str = "message.json";

/// How often [`NotificationSurface::watch_marker`] looks at the marker.
pub const MARKER_WATCH_INTERVAL: Duration = Duration::from_millis(200);

/// JSON form of a delivered message. UTF-8 payloads are written as text,
/// anything else as base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub id: i64,
    pub from_instance: String,
    pub to_instance: Option<String>,
    pub message_type: MessageType,
    pub priority: i64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_b64: Option<String>,
}

impl MessageEnvelope {
    pub fn from_message(msg: &Message) -> Self {
        let (payload, payload_b64) = match msg.payload_text() {
            Some(text) => (Some(text.to_string()), None),
            None => (
                None,
                Some(base64::engine::general_purpose::STANDARD.encode(&msg.payload)),
            ),
        };
        Self {
            id: msg.id,
            from_instance: msg.from_instance.clone(),
            to_instance: msg.to_instance.clone(),
            message_type: msg.message_type,
            priority: msg.priority,
            created_at: msg.created_at,
            payload,
            payload_b64,
        }
    }

    /// The original payload bytes.
    pub fn payload_bytes(&self) -> Result<Vec<u8>> {
        match (&self.payload, &self.payload_b64) {
            (Some(text), _) => Ok(text.as_bytes().to_vec()),
            (None, Some(encoded)) => base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .context("payload_b64 is not valid base64"),
            (None, None) => Ok(Vec::new()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NotificationSurface {
    root: PathBuf,
}

impl NotificationSurface {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn instance_dir(&self, instance_id: &str) -> Result<PathBuf> {
        if instance_id.is_empty()
            || instance_id == "."
            || instance_id == ".."
            || instance_id.contains(['/', '\\'])
        {
            anyhow::bail!("instance id '{instance_id}' cannot be used as a directory name");
        }
        Ok(self.root.join(instance_id))
    }

    /// Write the content file (atomically) and then the marker.
    pub fn write_delivery(&self, instance_id: &str, msg: &Message) -> Result<()> {
        let dir = self.instance_dir(instance_id)?;
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        let body = serde_json::to_vec_pretty(&MessageEnvelope::from_message(msg))?;
        let tmp = dir.join(format!("{CONTENT_FILE}.tmp"));
        let dest = dir.join(CONTENT_FILE);
        std::fs::write(&tmp, body).with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &dest)
            .with_context(|| format!("Failed to move {} into place", dest.display()))?;

        self.touch_marker(instance_id)
    }

    /// Read the last delivered message, if any.
    pub fn read_delivery(&self, instance_id: &str) -> Result<Option<MessageEnvelope>> {
        let path = self.instance_dir(instance_id)?.join(CONTENT_FILE);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(
                serde_json::from_slice(&bytes)
                    .with_context(|| format!("Malformed {}", path.display()))?,
            )),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    pub fn touch_marker(&self, instance_id: &str) -> Result<()> {
        let dir = self.instance_dir(instance_id)?;
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let marker = dir.join(MARKER_FILE);
        std::fs::write(&marker, Utc::now().to_rfc3339())
            .with_context(|| format!("Failed to write {}", marker.display()))
    }

    /// Contents of the marker (the time it was last touched), if present.
    pub fn marker_stamp(&self, instance_id: &str) -> Option<String> {
        let marker = self.instance_dir(instance_id).ok()?.join(MARKER_FILE);
        std::fs::read_to_string(marker).ok()
    }

    /// Notify `wake` whenever the marker is touched after the watch started,
    /// until `stop` is cancelled. A marker that is already present does not
    /// count.
    pub async fn watch_marker(
        self,
        instance_id: String,
        wake: Arc<Notify>,
        every: Duration,
        stop: CancellationToken,
    ) {
        let mut seen = self.marker_stamp(&instance_id);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(every) => {}
                _ = stop.cancelled() => return,
            }
            let current = self.marker_stamp(&instance_id);
            if current.is_some() && current != seen {
                tracing::debug!(instance = %instance_id, "check_now marker touched");
                wake.notify_one();
            }
            seen = current;
        }
    }

    pub fn has_marker(&self, instance_id: &str) -> bool {
        self.instance_dir(instance_id)
            .map(|dir| dir.join(MARKER_FILE).exists())
            .unwrap_or(false)
    }

    /// Remove the marker. Returns whether one was present.
    pub fn clear_marker(&self, instance_id: &str) -> Result<bool> {
        let marker = self.instance_dir(instance_id)?.join(MARKER_FILE);
        match std::fs::remove_file(&marker) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", marker.display())),
        }
    }

    /// Instance directories present under the root.
    pub fn known_instances(&self) -> Result<Vec<String>> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read {}", self.root.display()))
            }
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    ids.push(name.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}
