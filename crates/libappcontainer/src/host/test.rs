//! In-memory node used by tests. It keeps track of processes, cgroups,
//! namespaces, port reservations and accounts, records every call and can be
//! told to fail a given call a number of times.
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::{Mutex, MutexGuard, PoisonError};

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::{Pid, Uid};

use super::{Host, HostError, Result};
use crate::container::record::{PortAllocation, Principal, Quota};

#[derive(PartialEq, Eq, Hash, Copy, Clone, Debug)]
pub enum HostCall {
    LiveProcesses,
    Signal,
    RemoveCgroup,
    RemoveNetns,
    ReleasePort,
    ClearQuota,
    RemovePrincipal,
}

/// A call that changed (or tried to change) the node, in call order
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Call {
    Signal(Pid, Signal),
    RemoveCgroup(PathBuf),
    RemoveNetns(PathBuf),
    ReleasePort(String),
    ClearQuota(u32),
    RemovePrincipal(u32),
}

#[derive(Debug)]
struct SimProcess {
    owner: Uid,
    alive: bool,
    ignores_term: bool,
    unkillable: bool,
}

#[derive(Default)]
struct Node {
    processes: HashMap<Pid, SimProcess>,
    cgroups: HashSet<PathBuf>,
    netns: HashSet<PathBuf>,
    ports: HashMap<String, String>,
    users: HashSet<u32>,
    quotas: HashSet<u32>,
    failures: HashMap<HostCall, usize>,
    calls: Vec<Call>,
}

impl Node {
    fn should_fail(&mut self, call: HostCall) -> bool {
        match self.failures.get_mut(&call) {
            Some(times) if *times > 0 => {
                *times -= 1;
                true
            }
            _ => false,
        }
    }
}

#[derive(Default)]
pub struct TestHost {
    node: Mutex<Node>,
}

fn command_failure(program: &'static str, args: Vec<String>) -> HostError {
    HostError::Command {
        program,
        args,
        status: ExitStatus::from_raw(1 << 8),
        stderr: "injected failure".to_owned(),
    }
}

impl TestHost {
    fn node(&self) -> MutexGuard<'_, Node> {
        self.node.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add_process(&self, pid: i32, owner: u32, ignores_term: bool, unkillable: bool) {
        self.node().processes.insert(
            Pid::from_raw(pid),
            SimProcess {
                owner: Uid::from_raw(owner),
                alive: true,
                ignores_term,
                unkillable,
            },
        );
    }

    /// A process that exits on SIGTERM.
    pub fn spawn_process(&self, pid: i32, owner: u32) -> &Self {
        self.add_process(pid, owner, false, false);
        self
    }

    /// A process that ignores SIGTERM and only dies on SIGKILL.
    pub fn spawn_stubborn_process(&self, pid: i32, owner: u32) -> &Self {
        self.add_process(pid, owner, true, false);
        self
    }

    /// A process stuck in the kernel that survives every signal.
    pub fn spawn_unkillable_process(&self, pid: i32, owner: u32) -> &Self {
        self.add_process(pid, owner, true, true);
        self
    }

    pub fn add_cgroup<P: Into<PathBuf>>(&self, path: P) -> &Self {
        self.node().cgroups.insert(path.into());
        self
    }

    pub fn add_netns<P: Into<PathBuf>>(&self, path: P) -> &Self {
        self.node().netns.insert(path.into());
        self
    }

    pub fn reserve_port(&self, port: &PortAllocation, owner: &str) -> &Self {
        self.node()
            .ports
            .insert(port.reservation_name(), owner.to_owned());
        self
    }

    pub fn add_user(&self, uid: u32) -> &Self {
        self.node().users.insert(uid);
        self
    }

    pub fn add_quota(&self, uid: u32) -> &Self {
        self.node().quotas.insert(uid);
        self
    }

    pub fn set_ret_err(&self, call: HostCall) {
        self.set_ret_err_times(call, 1);
    }

    pub fn set_ret_err_times(&self, call: HostCall, times: usize) {
        self.node().failures.insert(call, times);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.node().calls.clone()
    }

    pub fn live_pids(&self) -> Vec<Pid> {
        let mut pids: Vec<Pid> = self
            .node()
            .processes
            .iter()
            .filter(|(_, process)| process.alive)
            .map(|(pid, _)| *pid)
            .collect();
        pids.sort_by_key(|pid| pid.as_raw());
        pids
    }

    pub fn has_cgroup(&self, path: &Path) -> bool {
        self.node().cgroups.contains(path)
    }

    pub fn has_netns(&self, path: &Path) -> bool {
        self.node().netns.contains(path)
    }

    pub fn port_holder(&self, port: &PortAllocation) -> Option<String> {
        self.node().ports.get(&port.reservation_name()).cloned()
    }

    pub fn has_user(&self, uid: u32) -> bool {
        self.node().users.contains(&uid)
    }

    pub fn has_quota(&self, uid: u32) -> bool {
        self.node().quotas.contains(&uid)
    }
}

impl Host for TestHost {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn live_processes(&self, owner: Option<Uid>, tracked: &[Pid]) -> Result<Vec<Pid>> {
        let mut node = self.node();
        if node.should_fail(HostCall::LiveProcesses) {
            return Err(HostError::ListProcesses(procfs::ProcError::Other(
                "injected failure".to_owned(),
            )));
        }
        let mut pids: Vec<Pid> = node
            .processes
            .iter()
            .filter(|(pid, process)| {
                process.alive
                    && match owner {
                        Some(uid) => process.owner == uid,
                        None => tracked.contains(pid),
                    }
            })
            .map(|(pid, _)| *pid)
            .collect();
        pids.sort_by_key(|pid| pid.as_raw());
        Ok(pids)
    }

    fn signal(&self, pid: Pid, signal: Signal) -> Result<()> {
        let mut node = self.node();
        node.calls.push(Call::Signal(pid, signal));
        if node.should_fail(HostCall::Signal) {
            return Err(HostError::Signal {
                pid,
                signal,
                errno: Errno::EPERM,
            });
        }
        if let Some(process) = node.processes.get_mut(&pid) {
            let dies = match signal {
                Signal::SIGKILL => !process.unkillable,
                Signal::SIGTERM => !process.ignores_term,
                _ => false,
            };
            if dies {
                process.alive = false;
            }
        }
        Ok(())
    }

    fn is_alive(&self, pid: Pid) -> bool {
        self.node()
            .processes
            .get(&pid)
            .map(|process| process.alive)
            .unwrap_or(false)
    }

    fn remove_cgroup(&self, path: &Path) -> Result<()> {
        let mut node = self.node();
        node.calls.push(Call::RemoveCgroup(path.to_owned()));
        if node.should_fail(HostCall::RemoveCgroup) {
            return Err(HostError::RemoveCgroup {
                path: path.to_owned(),
                source: std::io::Error::from_raw_os_error(libc::EBUSY),
            });
        }
        node.cgroups.remove(path);
        Ok(())
    }

    fn remove_netns(&self, path: &Path) -> Result<()> {
        let mut node = self.node();
        node.calls.push(Call::RemoveNetns(path.to_owned()));
        if node.should_fail(HostCall::RemoveNetns) {
            return Err(HostError::UnmountNamespace {
                path: path.to_owned(),
                errno: Errno::EBUSY,
            });
        }
        node.netns.remove(path);
        Ok(())
    }

    fn release_port(&self, port: &PortAllocation, owner: &str) -> Result<()> {
        let name = port.reservation_name();
        let mut node = self.node();
        node.calls.push(Call::ReleasePort(name.to_owned()));
        if node.should_fail(HostCall::ReleasePort) {
            return Err(HostError::ReleasePort {
                path: PathBuf::from(name),
                source: std::io::Error::from_raw_os_error(libc::EACCES),
            });
        }
        if node.ports.get(&name).map(String::as_str) == Some(owner) {
            node.ports.remove(&name);
        }
        Ok(())
    }

    fn clear_quota(&self, principal: &Principal, _quota: &Quota) -> Result<()> {
        let mut node = self.node();
        node.calls.push(Call::ClearQuota(principal.uid));
        if node.should_fail(HostCall::ClearQuota) {
            return Err(command_failure(
                "setquota",
                vec!["-u".to_owned(), principal.user_name.to_owned()],
            ));
        }
        node.quotas.remove(&principal.uid);
        Ok(())
    }

    fn remove_principal(&self, principal: &Principal) -> Result<()> {
        if principal.uid == 0 {
            return Err(HostError::PrivilegedPrincipal(principal.uid));
        }
        let mut node = self.node();
        node.calls.push(Call::RemovePrincipal(principal.uid));
        if node.should_fail(HostCall::RemovePrincipal) {
            return Err(command_failure(
                "userdel",
                vec![principal.user_name.to_owned()],
            ));
        }
        node.users.remove(&principal.uid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::record::Protocol;

    #[test]
    fn test_signals() {
        let host = TestHost::default();
        host.spawn_process(10, 1500)
            .spawn_stubborn_process(11, 1500)
            .spawn_unkillable_process(12, 1500);

        for pid in [10, 11, 12] {
            host.signal(Pid::from_raw(pid), Signal::SIGTERM).unwrap();
        }
        assert_eq!(host.live_pids(), vec![Pid::from_raw(11), Pid::from_raw(12)]);

        for pid in [11, 12] {
            host.signal(Pid::from_raw(pid), Signal::SIGKILL).unwrap();
        }
        assert_eq!(host.live_pids(), vec![Pid::from_raw(12)]);
    }

    #[test]
    fn test_ret_err_times() {
        let host = TestHost::default();
        host.add_cgroup("/sys/fs/cgroup/c-1");
        host.set_ret_err_times(HostCall::RemoveCgroup, 2);

        let path = Path::new("/sys/fs/cgroup/c-1");
        assert!(host.remove_cgroup(path).is_err());
        assert!(host.remove_cgroup(path).is_err());
        assert!(host.has_cgroup(path));
        assert!(host.remove_cgroup(path).is_ok());
        assert!(!host.has_cgroup(path));
        assert_eq!(host.calls().len(), 3);
    }

    #[test]
    fn test_port_owner() {
        let host = TestHost::default();
        let port = PortAllocation {
            port: 8080,
            protocol: Protocol::Tcp,
        };
        host.reserve_port(&port, "c-2");
        host.release_port(&port, "c-1").unwrap();
        assert_eq!(host.port_holder(&port), Some("c-2".to_owned()));
    }
}
