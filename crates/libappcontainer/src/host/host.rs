//! An interface trait so that the reclaimer can release node resources
//! without having to worry about how they are implemented
use std::any::Any;
use std::path::Path;

use nix::sys::signal::Signal;
use nix::unistd::{Pid, Uid};

use super::Result;
use crate::container::record::{PortAllocation, Principal, Quota};

/// Node-level operations needed to tear a container down. Every removal must
/// treat an already absent resource as success.
pub trait Host: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    /// Live processes owned by `owner`. Without an owner, the live processes
    /// listed in `tracked`. Pids get recycled, so a tracked pid that now
    /// belongs to another user is never returned.
    fn live_processes(&self, owner: Option<Uid>, tracked: &[Pid]) -> Result<Vec<Pid>>;
    fn signal(&self, pid: Pid, signal: Signal) -> Result<()>;
    fn is_alive(&self, pid: Pid) -> bool;
    fn remove_cgroup(&self, path: &Path) -> Result<()>;
    fn remove_netns(&self, path: &Path) -> Result<()>;
    /// Releases `port` if, and only if, it is reserved for `owner`.
    fn release_port(&self, port: &PortAllocation, owner: &str) -> Result<()>;
    fn clear_quota(&self, principal: &Principal, quota: &Quota) -> Result<()>;
    fn remove_principal(&self, principal: &Principal) -> Result<()>;
}
