//! Releases the node resources a container holds, in dependency order
use std::collections::BTreeSet;
use std::fmt::Display;
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use nix::unistd::{Pid, Uid};
use serde::{Deserialize, Serialize};

use crate::container::record::{ContainerRecord, PortAllocation};
use crate::host::{Host, HostError};

/// Kind of node resource a container can hold
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "camelCase")]
pub enum ResourceKind {
    Process,
    Cgroup,
    Namespace,
    Port,
    Quota,
    Principal,
    Filesystem,
    // Only ever reported as a failure: the record could not be updated or removed
    Record,
}

impl Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let print = match *self {
            Self::Process => "process",
            Self::Cgroup => "cgroup",
            Self::Namespace => "namespace",
            Self::Port => "port",
            Self::Quota => "quota",
            Self::Principal => "principal",
            Self::Filesystem => "filesystem",
            Self::Record => "record",
        };

        write!(f, "{print}")
    }
}

/// One teardown step that did not complete
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceFailure {
    pub kind: ResourceKind,
    pub cause: String,
}

impl ResourceFailure {
    pub fn new<E: Display>(kind: ResourceKind, cause: E) -> Self {
        Self {
            kind,
            cause: cause.to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReleaseError {
    #[error("processes {0:?} survived SIGKILL")]
    ProcessesSurvived(Vec<i32>),
    #[error("owning processes still alive")]
    OwnerStillRunning,
    #[error("port {port}/{protocol}: {source}")]
    Port {
        port: u16,
        protocol: crate::container::record::Protocol,
        source: HostError,
    },
    #[error(transparent)]
    Host(#[from] HostError),
}

/// How long processes are given to exit before and after SIGKILL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminationPolicy {
    pub grace_period: Duration,
    pub kill_wait: Duration,
    pub poll_interval: Duration,
}

impl Default for TerminationPolicy {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(10),
            kill_wait: Duration::from_secs(2),
            poll_interval: Duration::from_millis(50),
        }
    }
}

/// What a reclaim pass released and what it could not release
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReclaimReport {
    pub released: BTreeSet<ResourceKind>,
    pub failures: Vec<ResourceFailure>,
}

impl ReclaimReport {
    fn fail<E: Display>(&mut self, kind: ResourceKind, cause: E) {
        tracing::warn!(%kind, %cause, "failed to release resource");
        self.failures.push(ResourceFailure::new(kind, cause));
    }

    pub fn processes_terminated(&self) -> bool {
        !self
            .failures
            .iter()
            .any(|failure| failure.kind == ResourceKind::Process)
    }
}

pub struct ResourceReclaimer<'a> {
    host: &'a dyn Host,
    policy: TerminationPolicy,
}

impl<'a> ResourceReclaimer<'a> {
    pub fn new(host: &'a dyn Host, policy: TerminationPolicy) -> Self {
        Self { host, policy }
    }

    /// uid 0 never identifies a container's processes
    fn owner(record: &ContainerRecord) -> Option<Uid> {
        record
            .principal
            .as_ref()
            .filter(|principal| principal.uid != 0)
            .map(|principal| Uid::from_raw(principal.uid))
    }

    /// Polls until every pid in `pids` is gone or `timeout` expires and
    /// returns the ones still alive.
    fn wait_for_exit(&self, pids: &[Pid], timeout: Duration) -> Vec<Pid> {
        let deadline = Instant::now() + timeout;
        loop {
            let alive: Vec<Pid> = pids
                .iter()
                .copied()
                .filter(|pid| self.host.is_alive(*pid))
                .collect();
            if alive.is_empty() || Instant::now() >= deadline {
                return alive;
            }
            thread::sleep(self.policy.poll_interval);
        }
    }

    fn signal_all(&self, pids: &[Pid], signal: Signal) {
        for pid in pids {
            // a failed signal shows up as a survivor
            if let Err(err) = self.host.signal(*pid, signal) {
                tracing::warn!(%pid, %signal, %err, "failed to signal process");
            }
        }
    }

    /// Sends SIGTERM to every live process of the container, waits for the
    /// grace period, SIGKILLs the rest and enumerates again to catch
    /// processes forked in between. Returns the number of processes found.
    pub fn terminate_processes(&self, record: &ContainerRecord) -> Result<usize, ReleaseError> {
        let owner = Self::owner(record);
        let tracked = record.tracked_pids();
        let live = self.host.live_processes(owner, &tracked)?;
        if live.is_empty() {
            tracing::debug!("no live processes");
            return Ok(0);
        }

        tracing::debug!(?live, "terminating processes");
        self.signal_all(&live, Signal::SIGTERM);
        let stubborn = self.wait_for_exit(&live, self.policy.grace_period);
        if !stubborn.is_empty() {
            tracing::info!(?stubborn, "grace period expired, killing");
            self.signal_all(&stubborn, Signal::SIGKILL);
            self.wait_for_exit(&stubborn, self.policy.kill_wait);
        }

        let survivors = self.host.live_processes(owner, &tracked)?;
        if !survivors.is_empty() {
            // forked during the grace period, give them the same treatment
            self.signal_all(&survivors, Signal::SIGKILL);
            let survivors = self.wait_for_exit(&survivors, self.policy.kill_wait);
            if !survivors.is_empty() {
                return Err(ReleaseError::ProcessesSurvived(
                    survivors.iter().map(|pid| pid.as_raw()).collect(),
                ));
            }
        }

        Ok(live.len())
    }

    /// Releases everything the record holds except the filesystem. Released
    /// resources are pruned from `record` so that a retry only sees what is
    /// left.
    pub fn reclaim(&self, record: &mut ContainerRecord) -> ReclaimReport {
        let mut report = ReclaimReport::default();

        match self.terminate_processes(record) {
            Ok(found) => {
                if found > 0 || !record.pids.is_empty() {
                    report.released.insert(ResourceKind::Process);
                }
                record.forget(ResourceKind::Process);
            }
            Err(err) => report.fail(ResourceKind::Process, err),
        }
        let processes_gone = report.processes_terminated();

        if let Some(path) = record.cgroup_path.clone() {
            if !processes_gone {
                report.fail(ResourceKind::Cgroup, ReleaseError::OwnerStillRunning);
            } else {
                match self.host.remove_cgroup(&path) {
                    Ok(()) => {
                        report.released.insert(ResourceKind::Cgroup);
                        record.forget(ResourceKind::Cgroup);
                    }
                    Err(err) => report.fail(ResourceKind::Cgroup, ReleaseError::from(err)),
                }
            }
        }

        if let Some(path) = record.netns_path.clone() {
            if !processes_gone {
                report.fail(ResourceKind::Namespace, ReleaseError::OwnerStillRunning);
            } else {
                match self.host.remove_netns(&path) {
                    Ok(()) => {
                        report.released.insert(ResourceKind::Namespace);
                        record.forget(ResourceKind::Namespace);
                    }
                    Err(err) => report.fail(ResourceKind::Namespace, ReleaseError::from(err)),
                }
            }
        }

        if !record.ports.is_empty() {
            if !processes_gone {
                report.fail(ResourceKind::Port, ReleaseError::OwnerStillRunning);
            } else {
                self.release_ports(record, &mut report);
            }
        }

        // setquota addresses the user by name, so this goes before the principal
        if let (Some(principal), Some(quota)) = (record.principal.clone(), record.quota.clone()) {
            match self.host.clear_quota(&principal, &quota) {
                Ok(()) => {
                    report.released.insert(ResourceKind::Quota);
                    record.forget(ResourceKind::Quota);
                }
                Err(err) => report.fail(ResourceKind::Quota, ReleaseError::from(err)),
            }
        } else if record.quota.is_some() {
            // nobody to clear it for
            record.forget(ResourceKind::Quota);
        }

        if let Some(principal) = record.principal.clone() {
            if !processes_gone {
                report.fail(ResourceKind::Principal, ReleaseError::OwnerStillRunning);
            } else {
                match self.host.remove_principal(&principal) {
                    Ok(()) => {
                        report.released.insert(ResourceKind::Principal);
                        record.forget(ResourceKind::Principal);
                    }
                    Err(err) => report.fail(ResourceKind::Principal, ReleaseError::from(err)),
                }
            }
        }

        report
    }

    fn release_ports(&self, record: &mut ContainerRecord, report: &mut ReclaimReport) {
        let owner = record.container_uuid.clone();
        let mut remaining: Vec<PortAllocation> = Vec::new();
        for port in record.ports.drain(..) {
            if let Err(source) = self.host.release_port(&port, &owner) {
                report.fail(
                    ResourceKind::Port,
                    ReleaseError::Port {
                        port: port.port,
                        protocol: port.protocol,
                        source,
                    },
                );
                remaining.push(port);
            }
        }
        if remaining.is_empty() {
            report.released.insert(ResourceKind::Port);
        }
        record.ports = remaining;
    }
}
