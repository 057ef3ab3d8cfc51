//! Implements the Host trait for Linux nodes
use std::any::Any;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::Duration;

use nix::errno::Errno;
use nix::mount::{umount2, MntFlags};
use nix::sys::signal::{self, Signal};
use nix::unistd::{getpid, Gid, Group, Pid, Uid, User};
use procfs::process::{ProcState, Process};

use super::{Host, HostError, Result};
use crate::container::record::{PortAllocation, Principal, Quota};
use crate::utils;

// userdel and groupdel exit status for an account that does not exist
const ACCOUNT_MISSING: i32 = 6;

/// Host backed by procfs, nix and the shadow utilities. Port reservations
/// are files named after the port inside `port_dir`.
#[derive(Debug, Clone)]
pub struct LinuxHost {
    port_dir: PathBuf,
    cgroup_retries: u32,
    cgroup_backoff: Duration,
}

impl LinuxHost {
    pub fn new<P: Into<PathBuf>>(port_dir: P) -> Self {
        Self {
            port_dir: port_dir.into(),
            cgroup_retries: 4,
            cgroup_backoff: Duration::from_millis(100),
        }
    }

    pub fn with_cgroup_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.cgroup_retries = retries.max(1);
        self.cgroup_backoff = backoff;
        self
    }

    fn remove_cgroup_dir(&self, path: &Path) -> std::io::Result<()> {
        let entries = match fs::read_dir(path) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err),
        };
        // child cgroups have to go first, the kernel refuses to remove a parent
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                self.remove_cgroup_dir(&entry.path())?;
            }
        }

        tracing::debug!(?path, "remove cgroup");
        utils::retry_removal(
            || fs::remove_dir(path),
            self.cgroup_retries,
            self.cgroup_backoff,
        )
    }
}

fn is_running(process: &Process) -> bool {
    process
        .stat()
        .and_then(|stat| stat.state())
        .map(|state| !matches!(state, ProcState::Zombie | ProcState::Dead))
        .unwrap_or(false)
}

fn run(program: &'static str, args: &[&str]) -> Result<Output> {
    tracing::debug!(program, ?args, "running");
    Command::new(program)
        .args(args)
        .output()
        .map_err(|source| HostError::Spawn { program, source })
}

fn check(program: &'static str, args: &[&str], output: Output) -> Result<()> {
    if output.status.success() || output.status.code() == Some(ACCOUNT_MISSING) {
        return Ok(());
    }
    Err(HostError::Command {
        program,
        args: args.iter().map(|arg| arg.to_string()).collect(),
        status: output.status,
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
    })
}

impl Host for LinuxHost {
    /// To enable dynamic typing,
    /// see <https://doc.rust-lang.org/std/any/index.html> for more information
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn live_processes(&self, owner: Option<Uid>, tracked: &[Pid]) -> Result<Vec<Pid>> {
        let me = getpid();
        let mut found = Vec::new();
        for process in procfs::process::all_processes()? {
            // processes come and go while we iterate
            let Ok(process) = process else {
                continue;
            };
            let pid = Pid::from_raw(process.pid);
            if pid == me {
                continue;
            }
            let ours = match owner {
                Some(uid) => process
                    .uid()
                    .map(|proc_uid| proc_uid == uid.as_raw())
                    .unwrap_or(false),
                None => tracked.contains(&pid),
            };
            if ours && is_running(&process) {
                found.push(pid);
            }
        }

        Ok(found)
    }

    fn signal(&self, pid: Pid, signal: Signal) -> Result<()> {
        tracing::debug!("kill signal {} to {}", signal, pid);
        match signal::kill(pid, signal) {
            // the process does not exist, which is what we want
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(HostError::Signal { pid, signal, errno }),
        }
    }

    fn is_alive(&self, pid: Pid) -> bool {
        // Note that Process::new does not spawn a new process but reads the
        // information of the process with the given pid from procfs
        Process::new(pid.as_raw())
            .map(|process| is_running(&process))
            .unwrap_or(false)
    }

    fn remove_cgroup(&self, path: &Path) -> Result<()> {
        self.remove_cgroup_dir(path)
            .map_err(|source| HostError::RemoveCgroup {
                path: path.to_owned(),
                source,
            })
    }

    fn remove_netns(&self, path: &Path) -> Result<()> {
        match umount2(path, MntFlags::MNT_DETACH) {
            // EINVAL: not a mount point any more
            Ok(()) | Err(Errno::EINVAL) | Err(Errno::ENOENT) => {}
            Err(errno) => {
                return Err(HostError::UnmountNamespace {
                    path: path.to_owned(),
                    errno,
                })
            }
        }
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(HostError::RemoveNamespace {
                path: path.to_owned(),
                source,
            }),
        }
    }

    fn release_port(&self, port: &PortAllocation, owner: &str) -> Result<()> {
        let path = self.port_dir.join(port.reservation_name());
        let holder = match fs::read_to_string(&path) {
            Ok(holder) => holder,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(source) => return Err(HostError::ReleasePort { path, source }),
        };
        if holder.trim() != owner {
            tracing::warn!(
                ?path,
                holder = holder.trim(),
                owner,
                "port is reserved by another container, leaving it alone"
            );
            return Ok(());
        }

        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(HostError::ReleasePort { path, source }),
        }
    }

    fn clear_quota(&self, principal: &Principal, quota: &Quota) -> Result<()> {
        if principal.uid == 0 {
            return Err(HostError::PrivilegedPrincipal(principal.uid));
        }
        if User::from_uid(Uid::from_raw(principal.uid))
            .map_err(HostError::Lookup)?
            .is_none()
        {
            tracing::debug!(uid = principal.uid, "user is gone, nothing to clear");
            return Ok(());
        }

        tracing::debug!(user = %principal.user_name, ?quota, "clear quota");
        let args = ["-u", principal.user_name.as_str(), "0", "0", "0", "0", "-a"];
        let output = run("setquota", &args)?;
        check("setquota", &args, output)
    }

    fn remove_principal(&self, principal: &Principal) -> Result<()> {
        if principal.uid == 0 || principal.gid == 0 {
            return Err(HostError::PrivilegedPrincipal(principal.uid));
        }

        if let Some(user) = User::from_uid(Uid::from_raw(principal.uid)).map_err(HostError::Lookup)? {
            let args = [user.name.as_str()];
            let output = run("userdel", &args)?;
            check("userdel", &args, output)?;
        }
        // userdel removes the user's private group on most distributions
        if let Some(group) = Group::from_gid(Gid::from_raw(principal.gid)).map_err(HostError::Lookup)? {
            let args = [group.name.as_str()];
            let output = run("groupdel", &args)?;
            check("groupdel", &args, output)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::process::Command;

    use anyhow::Result;

    use super::*;
    use crate::container::record::Protocol;

    #[test]
    fn test_release_port_respects_owner() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let host = LinuxHost::new(tmp.path());
        let mine = PortAllocation {
            port: 35531,
            protocol: Protocol::Tcp,
        };
        let theirs = PortAllocation {
            port: 35532,
            protocol: Protocol::Tcp,
        };
        fs::write(tmp.path().join(mine.reservation_name()), "c-1\n")?;
        fs::write(tmp.path().join(theirs.reservation_name()), "c-2\n")?;

        host.release_port(&mine, "c-1")?;
        host.release_port(&theirs, "c-1")?;
        // releasing twice is fine
        host.release_port(&mine, "c-1")?;

        assert!(!tmp.path().join(mine.reservation_name()).exists());
        assert!(tmp.path().join(theirs.reservation_name()).exists());
        Ok(())
    }

    #[test]
    fn test_remove_cgroup_tree_and_absent() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let host = LinuxHost::new(tmp.path()).with_cgroup_retries(1, Duration::from_millis(1));
        let cgroup = tmp.path().join("app").join("c-1");
        fs::create_dir_all(cgroup.join("child"))?;

        host.remove_cgroup(&cgroup)?;
        assert!(!cgroup.exists());
        host.remove_cgroup(&cgroup)?;
        Ok(())
    }

    #[test]
    fn test_remove_netns_handle() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let host = LinuxHost::new(tmp.path());
        let handle = tmp.path().join("c-1");
        fs::write(&handle, "")?;

        host.remove_netns(&handle)?;
        assert!(!handle.exists());
        host.remove_netns(&handle)?;
        Ok(())
    }

    #[test]
    fn test_process_lifecycle() -> Result<()> {
        let host = LinuxHost::new("/nonexistent");
        let mut child = Command::new("sleep").arg("30").spawn()?;
        let pid = Pid::from_raw(child.id() as i32);

        assert!(host.is_alive(pid));
        assert!(host.live_processes(None, &[pid])?.contains(&pid));
        let me = nix::unistd::getuid();
        assert!(host.live_processes(Some(me), &[])?.contains(&pid));
        // a tracked pid owned by someone else is not ours
        let other = Uid::from_raw(me.as_raw().wrapping_add(1));
        assert!(!host.live_processes(Some(other), &[pid])?.contains(&pid));

        host.signal(pid, Signal::SIGKILL)?;
        child.wait()?;
        assert!(!host.is_alive(pid));
        assert!(!host.live_processes(None, &[pid])?.contains(&pid));
        // signalling a process that is gone succeeds
        host.signal(pid, Signal::SIGTERM)?;
        Ok(())
    }

    #[test]
    fn test_privileged_principal_is_refused() {
        let host = LinuxHost::new("/nonexistent");
        let root = Principal {
            uid: 0,
            gid: 0,
            user_name: "root".to_owned(),
        };
        assert!(matches!(
            host.remove_principal(&root),
            Err(HostError::PrivilegedPrincipal(0))
        ));
        assert!(matches!(
            host.clear_quota(&root, &Quota { blocks: 1, inodes: 1 }),
            Err(HostError::PrivilegedPrincipal(0))
        ));
    }
}
