use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::field;

use super::record::{ContainerRecord, LifecycleState};
use super::LifecycleManager;
use crate::error::LibappcontainerError;
use crate::identity::{IdentityHints, ResolveError};
use crate::reclaim::{ReleaseError, ResourceFailure, ResourceKind};

/// Outcome of one destroy call. Partial teardown is reported here and never
/// as an error.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DestroyResult {
    pub succeeded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_uuid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub reclaimed_resources: BTreeSet<ResourceKind>,
    pub errors: Vec<ResourceFailure>,
}

impl DestroyResult {
    pub(super) fn new(container_uuid: Option<&str>, request_id: Option<&str>) -> Self {
        Self {
            succeeded: true,
            container_uuid: container_uuid.map(str::to_owned),
            request_id: request_id.map(str::to_owned),
            ..Default::default()
        }
    }

    pub(super) fn fail<E: std::fmt::Display>(&mut self, kind: ResourceKind, cause: E) {
        tracing::warn!(%kind, %cause, "teardown step failed");
        self.errors.push(ResourceFailure::new(kind, cause));
    }
}

impl LifecycleManager {
    /// Tears down the container identified by `hints` and releases every node
    /// resource it holds.
    ///
    /// Destroying a container that does not exist (any more) succeeds with
    /// nothing reclaimed. A failed step is recorded in the result and the
    /// remaining steps still run; the record then stays in `Destroying` with
    /// only the unreleased resources, so calling destroy again resumes.
    ///
    /// Only resolution errors and failures to write the `Destroying` marker
    /// are returned as errors.
    pub fn destroy(&self, hints: &IdentityHints) -> Result<DestroyResult, LibappcontainerError> {
        let request_id = hints.request_id.as_deref();
        let span = tracing::info_span!(
            "destroy",
            request_id,
            container_uuid = field::Empty,
            cartridge = hints.cartridge.name.as_deref(),
            cartridge_vendor = hints.cartridge.vendor.as_deref(),
            component = hints.cartridge.component.as_deref(),
            software_version = hints.cartridge.software_version.as_deref(),
        );
        let _enter = span.enter();

        let identity = match self.resolve(hints) {
            Ok(identity) => identity,
            Err(LibappcontainerError::Resolve(ResolveError::NotFound(described))) => {
                tracing::info!(hints = %described, "container does not exist, nothing to destroy");
                return Ok(DestroyResult::new(hints.container_uuid.as_deref(), request_id));
            }
            Err(err) => return Err(err),
        };
        span.record("container_uuid", identity.container_uuid.as_str());

        self.destroy_container(&identity.container_uuid, request_id)
    }

    pub(super) fn destroy_container(
        &self,
        container_uuid: &str,
        request_id: Option<&str>,
    ) -> Result<DestroyResult, LibappcontainerError> {
        let mut result = DestroyResult::new(Some(container_uuid), request_id);

        let _lock = self.store().lock(container_uuid)?;
        // whoever held the lock before us may have finished the job
        let Some(mut record) = self.store().load(container_uuid)? else {
            tracing::info!("container was destroyed concurrently");
            return Ok(result);
        };
        tracing::debug!(state = %record.state(), "container state");
        if record.state().is_destroying() {
            tracing::info!("resuming an interrupted destroy");
        }
        // nothing irreversible may happen before this is on disk
        record.set_state(LifecycleState::Destroying);
        self.store().save(&record)?;

        let report = self.reclaimer().reclaim(&mut record);
        let processes_gone = report.processes_terminated();
        result.reclaimed_resources.extend(report.released);
        result.errors.extend(report.failures);

        if processes_gone {
            self.erase_filesystem(&record, &mut result);
        } else {
            // a live process could swap directories for links under our feet
            result.fail(ResourceKind::Filesystem, ReleaseError::OwnerStillRunning);
        }

        if result.errors.is_empty() {
            if let Err(err) = self.store().remove(container_uuid) {
                result.fail(ResourceKind::Record, err);
            }
        } else if let Err(err) = self.store().save(&record) {
            result.fail(ResourceKind::Record, err);
        }

        result.succeeded = result.errors.is_empty();
        if result.succeeded {
            tracing::info!(reclaimed = ?result.reclaimed_resources, "container destroyed");
        } else {
            tracing::warn!(
                errors = result.errors.len(),
                "container partially destroyed, record kept for a retry"
            );
        }
        Ok(result)
    }

    fn erase_filesystem(&self, record: &ContainerRecord, result: &mut DestroyResult) {
        let eradicator = self.eradicator();
        let root = record.filesystem_root();
        let mut found = false;
        let mut failed = false;

        match eradicator.remove_links(&self.config().link_dirs, root) {
            Ok(removed) => found |= removed > 0,
            Err(err) => {
                failed = true;
                result.fail(ResourceKind::Filesystem, err);
            }
        }

        match eradicator.erase(root) {
            Ok(existed) => found |= existed,
            Err(err) => {
                failed = true;
                result.fail(ResourceKind::Filesystem, err);
            }
        }

        if found && !failed {
            result.reclaimed_resources.insert(ResourceKind::Filesystem);
        }
    }
}
