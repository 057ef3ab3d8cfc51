//! Container management
/// A container is described by a durable record in the state store. This
/// module owns those records and the lifecycle operations on them; tearing a
/// container down is the only operation that touches the node itself.
mod container_destroy;
mod container_recover;
mod lifecycle;
pub mod record;
pub mod store;
pub use container_destroy::DestroyResult;
pub use lifecycle::LifecycleManager;
pub use record::{ContainerRecord, LifecycleState};
pub use store::{StateStore, StoreError};
