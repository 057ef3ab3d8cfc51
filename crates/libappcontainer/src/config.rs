//! Node-wide settings for lifecycle operations, persisted next to the records
use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::eradicate::RetryPolicy;
use crate::reclaim::TerminationPolicy;

const CONFIG_FILE: &str = "node.json";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to save config")]
    SaveIO {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("failed to encode config")]
    SaveEncode {
        source: serde_json::Error,
        path: PathBuf,
    },
    #[error("failed to load config")]
    LoadIO {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("failed to parse config {path:?}")]
    LoadParse {
        source: serde_json::Error,
        path: PathBuf,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeConfig {
    // How long processes may take to exit after SIGTERM
    pub grace_period_ms: u64,
    // How long to wait for the kernel to reap after SIGKILL
    pub kill_wait_ms: u64,
    pub poll_interval_ms: u64,
    pub erase_retries: u32,
    pub erase_backoff_ms: u64,
    // Defaults to <state root>/ports
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_dir: Option<PathBuf>,
    // Directories that may hold symlinks into container roots
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub link_dirs: Vec<PathBuf>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 10_000,
            kill_wait_ms: 2_000,
            poll_interval_ms: 50,
            erase_retries: 4,
            erase_backoff_ms: 100,
            port_dir: None,
            link_dirs: Vec::new(),
        }
    }
}

impl NodeConfig {
    pub fn path<P: AsRef<Path>>(state_root: P) -> PathBuf {
        state_root.as_ref().join(CONFIG_FILE)
    }

    /// Reads `node.json` from the state root, falling back to the defaults
    /// when there is none.
    pub fn load<P: AsRef<Path>>(state_root: P) -> Result<Self> {
        let path = Self::path(state_root);
        let file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(?path, "no node config, using defaults");
                return Ok(Self::default());
            }
            Err(source) => return Err(ConfigError::LoadIO { source, path }),
        };
        let config: Self = serde_json::from_reader(BufReader::new(file))
            .map_err(|source| ConfigError::LoadParse {
                source,
                path: path.to_owned(),
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, state_root: P) -> Result<()> {
        let path = Self::path(state_root);
        let file = fs::File::create(&path).map_err(|source| ConfigError::SaveIO {
            source,
            path: path.to_owned(),
        })?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self).map_err(|source| {
            ConfigError::SaveEncode {
                source,
                path: path.to_owned(),
            }
        })?;
        writer
            .flush()
            .map_err(|source| ConfigError::SaveIO { source, path })?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.erase_retries == 0 {
            return Err(ConfigError::Invalid(
                "eraseRetries must be at least 1".to_owned(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "pollIntervalMs must be greater than 0".to_owned(),
            ));
        }
        if let Some(dir) = self.link_dirs.iter().find(|dir| !dir.is_absolute()) {
            return Err(ConfigError::Invalid(format!(
                "link directory {dir:?} is not absolute"
            )));
        }
        Ok(())
    }

    pub fn port_dir<P: AsRef<Path>>(&self, state_root: P) -> PathBuf {
        self.port_dir
            .to_owned()
            .unwrap_or_else(|| state_root.as_ref().join("ports"))
    }

    pub fn termination_policy(&self) -> TerminationPolicy {
        TerminationPolicy {
            grace_period: Duration::from_millis(self.grace_period_ms),
            kill_wait: Duration::from_millis(self.kill_wait_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }

    pub fn erase_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.erase_retries,
            backoff_limit: Duration::from_millis(self.erase_backoff_ms),
        }
    }
}
