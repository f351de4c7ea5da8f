//! Bus configuration, read from `config.toml`.
//!
//! Every key has a default, so a missing file is the same as an empty one.
//! CLI flags override individual values for one invocation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::consumer::PollSettings;
use crate::error::{BusError, Result};
use crate::producer::BroadcastPolicy;

pub const CONFIG_FILE: &str = "config.toml";
pub const DEFAULT_STORE_FILE: &str = "bus.db";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BusConfig {
    /// Store file. `~` and `$VAR` are expanded.
    pub store_path: Option<String>,
    /// Root of per-instance notification artifacts. Unset disables them.
    pub notify_dir: Option<String>,
    pub consumer: ConsumerConfig,
    pub registry: RegistryConfig,
    pub broadcast: BroadcastConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConsumerConfig {
    pub poll_interval_secs: u64,
    pub max_duration_secs: u64,
    pub max_consecutive_errors: u32,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 3,
            max_duration_secs: 600,
            max_consecutive_errors: 3,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegistryConfig {
    /// Defaults to twice the poll interval.
    pub stale_after_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BroadcastConfig {
    pub policy: BroadcastPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5000,
        }
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("dev", "agentbus", "agentbus")
}

/// `<config_dir>/config.toml` for this platform, if a home directory exists.
pub fn default_config_path() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().join(CONFIG_FILE))
}

fn expand_path(raw: &str) -> Result<PathBuf> {
    shellexpand::full(raw)
        .map(|expanded| PathBuf::from(expanded.as_ref()))
        .map_err(|e| BusError::Config(format!("cannot expand path '{raw}': {e}")))
}

impl BusConfig {
    /// Load from `path`, or from the default location when `None`.
    ///
    /// An explicit path must exist; the default file is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match default_config_path() {
                Some(p) => (p, false),
                None => return Ok(Self::default()),
            },
        };

        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                let config = Self::from_toml_str(&contents).map_err(|e| match e {
                    BusError::Config(msg) => BusError::Config(format!("{}: {msg}", path.display())),
                    other => other,
                })?;
                tracing::debug!(path = %path.display(), "loaded config");
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(BusError::Config(format!(
                "cannot read {}: {e}",
                path.display()
            ))),
        }
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(contents).map_err(|e| BusError::Config(e.message().to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.consumer.poll_interval_secs == 0 {
            return Err(BusError::invalid("consumer.poll_interval_secs must be > 0"));
        }
        if self.consumer.max_duration_secs == 0 {
            return Err(BusError::invalid("consumer.max_duration_secs must be > 0"));
        }
        if self.consumer.max_consecutive_errors == 0 {
            return Err(BusError::invalid(
                "consumer.max_consecutive_errors must be > 0",
            ));
        }
        if self.registry.stale_after_secs == Some(0) {
            return Err(BusError::invalid("registry.stale_after_secs must be > 0"));
        }
        Ok(())
    }

    pub fn store_path(&self) -> Result<PathBuf> {
        match &self.store_path {
            Some(raw) => expand_path(raw),
            None => project_dirs()
                .map(|dirs| dirs.data_dir().join(DEFAULT_STORE_FILE))
                .ok_or_else(|| {
                    BusError::Config(
                        "no home directory found; set store_path or pass --store".into(),
                    )
                }),
        }
    }

    pub fn notify_dir(&self) -> Result<Option<PathBuf>> {
        self.notify_dir.as_deref().map(expand_path).transpose()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.consumer.poll_interval_secs)
    }

    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.consumer.max_duration_secs)
    }

    pub fn stale_after(&self) -> Duration {
        match self.registry.stale_after_secs {
            Some(secs) => Duration::from_secs(secs),
            None => self.poll_interval() * 2,
        }
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.store.busy_timeout_ms)
    }

    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            poll_interval: self.poll_interval(),
            max_duration: self.max_duration(),
            max_consecutive_errors: self.consumer.max_consecutive_errors,
        }
    }
}
