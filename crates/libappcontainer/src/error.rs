use crate::config::ConfigError;
use crate::container::store::StoreError;
use crate::identity::ResolveError;

/// Hard failures of a lifecycle operation. Partial teardown is never reported
/// through this type; see [`crate::container::DestroyResult`].
#[derive(Debug, thiserror::Error)]
pub enum LibappcontainerError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}
