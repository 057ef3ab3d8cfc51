//! Contains a wrapper of the node-level operations used to reclaim container
//! resources, so that the rest of the crate can be tested without touching
//! the host

#[allow(clippy::module_inception)]
pub mod host;
pub mod linux;
pub mod test;

use std::path::PathBuf;

pub use host::Host;

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("failed to list processes")]
    ListProcesses(#[from] procfs::ProcError),
    #[error("failed to send {signal} to {pid}: {errno}")]
    Signal {
        pid: nix::unistd::Pid,
        signal: nix::sys::signal::Signal,
        errno: nix::errno::Errno,
    },
    #[error("failed to remove cgroup {path:?}")]
    RemoveCgroup {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to unmount network namespace {path:?}: {errno}")]
    UnmountNamespace {
        path: PathBuf,
        errno: nix::errno::Errno,
    },
    #[error("failed to remove network namespace handle {path:?}")]
    RemoveNamespace {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to release port reservation {path:?}")]
    ReleasePort {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to run {program}")]
    Spawn {
        program: &'static str,
        source: std::io::Error,
    },
    #[error("{program} {args:?} exited with {status}: {stderr}")]
    Command {
        program: &'static str,
        args: Vec<String>,
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("refusing to act on the privileged principal uid {0}")]
    PrivilegedPrincipal(u32),
    #[error("failed to look up account: {0}")]
    Lookup(nix::errno::Errno),
}

type Result<T> = std::result::Result<T, HostError>;
