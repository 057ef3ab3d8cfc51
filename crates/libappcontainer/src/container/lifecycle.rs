use std::sync::Arc;

use super::record::ContainerRecord;
use super::store::StateStore;
use crate::config::NodeConfig;
use crate::eradicate::Eradicator;
use crate::error::LibappcontainerError;
use crate::host::Host;
use crate::identity::{self, ContainerIdentity, IdentityHints};
use crate::reclaim::ResourceReclaimer;

/// Entry point for lifecycle operations on the containers of one node.
///
/// The manager is cheap to share between threads: destroys of different
/// containers run in parallel, destroys of the same container are serialized
/// by the store's per-record lock.
pub struct LifecycleManager {
    store: Arc<StateStore>,
    host: Arc<dyn Host>,
    config: NodeConfig,
}

impl LifecycleManager {
    pub fn new(
        store: Arc<StateStore>,
        host: Arc<dyn Host>,
        config: NodeConfig,
    ) -> Result<Self, LibappcontainerError> {
        config.validate()?;
        Ok(Self {
            store,
            host,
            config,
        })
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn host(&self) -> &dyn Host {
        self.host.as_ref()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn resolve(&self, hints: &IdentityHints) -> Result<ContainerIdentity, LibappcontainerError> {
        Ok(identity::resolve(&self.store, hints)?)
    }

    /// Records of every container on the node, sorted by uuid
    pub fn list(&self) -> Result<Vec<ContainerRecord>, LibappcontainerError> {
        Ok(self.store.list()?)
    }

    pub fn load(&self, container_uuid: &str) -> Result<Option<ContainerRecord>, LibappcontainerError> {
        Ok(self.store.load(container_uuid)?)
    }

    pub(super) fn reclaimer(&self) -> ResourceReclaimer<'_> {
        ResourceReclaimer::new(self.host.as_ref(), self.config.termination_policy())
    }

    pub(super) fn eradicator(&self) -> Eradicator {
        Eradicator::new(self.config.erase_retry_policy())
    }
}
