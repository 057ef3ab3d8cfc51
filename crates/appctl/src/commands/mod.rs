use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use libappcontainer::config::NodeConfig;
use libappcontainer::container::{LifecycleManager, StateStore};
use libappcontainer::host::linux::LinuxHost;

pub mod destroy;
pub mod list;
pub mod recover;
pub mod state;

const RECORDS_DIR: &str = "containers";

/// Node config from the state root with command line overrides applied
fn node_config<P: AsRef<Path>>(root_path: P, grace_period: Option<u64>) -> Result<NodeConfig> {
    let root_path = root_path.as_ref();
    let mut config = NodeConfig::load(root_path)
        .with_context(|| format!("failed to load node config from {}", root_path.display()))?;
    if let Some(seconds) = grace_period {
        config.grace_period_ms = seconds.saturating_mul(1000);
    }
    Ok(config)
}

pub fn lifecycle_manager<P: AsRef<Path>>(
    root_path: P,
    grace_period: Option<u64>,
) -> Result<LifecycleManager> {
    let root_path = root_path.as_ref();
    let config = node_config(root_path, grace_period)?;
    let store = StateStore::open(root_path.join(RECORDS_DIR))
        .with_context(|| format!("failed to open state store in {}", root_path.display()))?;
    let host = LinuxHost::new(config.port_dir(root_path)).with_cgroup_retries(
        config.erase_retries,
        Duration::from_millis(config.erase_backoff_ms),
    );

    tracing::debug!(root = ?root_path, ?config, "opened state root");
    LifecycleManager::new(Arc::new(store), Arc::new(host), config)
        .context("failed to set up lifecycle manager")
}
