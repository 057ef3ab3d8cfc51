//! Utility functionality

use std::fs::{DirBuilder, File};
use std::io;
use std::os::linux::fs::MetadataExt;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use nix::sys::stat::Mode;
use nix::unistd::geteuid;

pub trait PathBufExt {
    fn normalize(&self) -> PathBuf;
    fn is_within<P: AsRef<Path>>(&self, root: P) -> bool;
}

impl PathBufExt for Path {
    /// Normalizes a path. In contrast to canonicalize the path does not need to exist.
    // adapted from https://github.com/rust-lang/cargo/blob/fede83ccf973457de319ba6fa0e36ead454d2e20/src/cargo/util/paths.rs#L61
    fn normalize(&self) -> PathBuf {
        let mut components = self.components().peekable();
        let mut ret = if let Some(c @ Component::Prefix(..)) = components.peek().cloned() {
            components.next();
            PathBuf::from(c.as_os_str())
        } else {
            PathBuf::new()
        };

        for component in components {
            match component {
                Component::Prefix(..) => unreachable!(),
                Component::RootDir => {
                    ret.push(component.as_os_str());
                }
                Component::CurDir => {}
                Component::ParentDir => {
                    ret.pop();
                }
                Component::Normal(c) => {
                    ret.push(c);
                }
            }
        }
        ret
    }

    /// Lexical containment check, both sides are normalized first.
    fn is_within<P: AsRef<Path>>(&self, root: P) -> bool {
        self.normalize().starts_with(root.as_ref().normalize())
    }
}

/// Resolves the target of the symlink at `link` without touching the target
/// itself. Relative targets are resolved against the directory holding the link.
pub fn resolve_link_target(link: &Path, target: &Path) -> PathBuf {
    if target.is_absolute() {
        target.normalize()
    } else {
        link.parent()
            .unwrap_or_else(|| Path::new("/"))
            .join(target)
            .normalize()
    }
}

/// Flushes directory metadata so that a preceding rename or unlink survives a crash.
pub fn sync_dir<P: AsRef<Path>>(dir: P) -> io::Result<()> {
    File::open(dir.as_ref())?.sync_all()
}

/// Returns true for errors that may go away when the operation is retried.
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EBUSY) | Some(libc::EAGAIN) | Some(libc::EINTR) | Some(libc::ETXTBSY)
    ) || matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
    )
}

/// Runs `op` until it succeeds, fails permanently or `attempts` runs are used up.
/// The delay between attempts grows with every failure and is capped at `limit_backoff`.
/// A `NotFound` error counts as success because the thing to remove is already gone.
pub fn retry_removal<F, L>(mut op: F, attempts: u32, limit_backoff: L) -> io::Result<()>
where
    F: FnMut() -> io::Result<()>,
    L: Into<Option<Duration>>,
{
    let mut attempt = 0;
    let limit = limit_backoff.into().unwrap_or(Duration::MAX);
    let mut delay = Duration::from_millis(10).min(limit);

    loop {
        attempt += 1;
        match op() {
            Ok(()) => return Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) if is_transient(&err) && attempt < attempts => {
                tracing::debug!(%err, attempt, "transient failure, retrying");
                std::thread::sleep(delay);
                delay = next_backoff(delay, attempt, limit);
            }
            Err(err) => return Err(err),
        }
    }
}

fn next_backoff(delay: Duration, attempt: u32, limit: Duration) -> Duration {
    delay.checked_mul(attempt).unwrap_or(limit).min(limit)
}

#[derive(Debug, thiserror::Error)]
pub enum MkdirWithModeError {
    #[error("IO error")]
    Io(#[from] std::io::Error),
    #[error("metadata doesn't match the expected attributes")]
    MetadataMismatch,
}

/// Creates the specified directory and all parent directories with the specified mode. Ensures
/// that the directory has been created with the correct mode and that the owner of the directory
/// is the owner that has been specified
/// # Example
/// ``` no_run
/// use libappcontainer::utils::create_dir_all_with_mode;
/// use nix::sys::stat::Mode;
/// use std::path::Path;
///
/// let path = Path::new("/tmp/appctl");
/// create_dir_all_with_mode(&path, 1000, Mode::S_IRWXU).unwrap();
/// assert!(path.exists())
/// ```
pub fn create_dir_all_with_mode<P: AsRef<Path>>(
    path: P,
    owner: u32,
    mode: Mode,
) -> Result<(), MkdirWithModeError> {
    let path = path.as_ref();
    if !path.exists() {
        DirBuilder::new()
            .recursive(true)
            .mode(mode.bits())
            .create(path)?;
    }

    let metadata = path.metadata()?;
    if metadata.is_dir()
        && metadata.st_uid() == owner
        && metadata.st_mode() & mode.bits() == mode.bits()
    {
        Ok(())
    } else {
        Err(MkdirWithModeError::MetadataMismatch)
    }
}

/// Node agents normally run as root. Anything else is treated as an
/// unprivileged run that keeps its state under the user's runtime dir.
pub fn unprivileged() -> bool {
    if let Ok(value) = std::env::var("APPCTL_UNPRIVILEGED") {
        return matches!(value.as_str(), "1" | "true");
    }
    !geteuid().is_root()
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use anyhow::{bail, Result};
    use serial_test::serial;

    use super::*;

    #[test]
    #[serial]
    fn test_unprivileged_override() {
        std::env::set_var("APPCTL_UNPRIVILEGED", "1");
        assert!(unprivileged());
        std::env::set_var("APPCTL_UNPRIVILEGED", "false");
        assert!(!unprivileged());
        std::env::remove_var("APPCTL_UNPRIVILEGED");
        assert_eq!(unprivileged(), !geteuid().is_root());
    }

    #[test]
    fn test_normalize() {
        assert_eq!(Path::new("/a/b/../c/./d").normalize(), PathBuf::from("/a/c/d"));
        assert_eq!(Path::new("/../../etc").normalize(), PathBuf::from("/etc"));
    }

    #[test]
    fn test_is_within() {
        assert!(Path::new("/containers/c-1/app/../data").is_within("/containers/c-1"));
        assert!(!Path::new("/containers/c-1/../c-2/data").is_within("/containers/c-1"));
        assert!(!Path::new("/containers/c-10").is_within("/containers/c-1"));
    }

    #[test]
    fn test_resolve_link_target() {
        let link = Path::new("/containers/c-1/app/current");
        assert_eq!(
            resolve_link_target(link, Path::new("../releases/3")),
            PathBuf::from("/containers/c-1/releases/3")
        );
        assert_eq!(
            resolve_link_target(link, Path::new("/etc/../etc/passwd")),
            PathBuf::from("/etc/passwd")
        );
    }

    #[test]
    fn test_retry_removal_transient_then_success() -> Result<()> {
        let calls = Cell::new(0);
        retry_removal(
            || {
                calls.set(calls.get() + 1);
                if calls.get() < 3 {
                    Err(io::Error::from_raw_os_error(libc::EBUSY))
                } else {
                    Ok(())
                }
            },
            4,
            Duration::from_millis(1),
        )?;
        assert_eq!(calls.get(), 3);
        Ok(())
    }

    #[test]
    fn test_retry_removal_gives_up() {
        let calls = Cell::new(0);
        let res = retry_removal(
            || {
                calls.set(calls.get() + 1);
                Err(io::Error::from_raw_os_error(libc::EBUSY))
            },
            3,
            Duration::from_millis(1),
        );
        assert!(res.is_err());
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_retry_removal_respects_small_limit() {
        let start = std::time::Instant::now();
        let res = retry_removal(
            || Err(io::Error::from_raw_os_error(libc::EBUSY)),
            20,
            Duration::ZERO,
        );
        assert!(res.is_err());
        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[test]
    fn test_next_backoff() {
        let limit = Duration::from_millis(100);
        assert_eq!(
            next_backoff(Duration::from_millis(10), 3, limit),
            Duration::from_millis(30)
        );
        assert_eq!(next_backoff(Duration::from_millis(60), 2, limit), limit);
        assert_eq!(
            next_backoff(Duration::MAX / 2, u32::MAX, Duration::MAX),
            Duration::MAX
        );
    }

    #[test]
    fn test_retry_removal_permanent_and_not_found() {
        let calls = Cell::new(0);
        let res = retry_removal(
            || {
                calls.set(calls.get() + 1);
                Err(io::Error::from_raw_os_error(libc::EPERM))
            },
            5,
            None,
        );
        assert!(res.is_err());
        assert_eq!(calls.get(), 1, "permanent errors are not retried");

        assert!(retry_removal(
            || Err(io::Error::from(io::ErrorKind::NotFound)),
            1,
            None
        )
        .is_ok());
    }

    #[test]
    fn test_create_dir_all_with_mode() -> Result<()> {
        {
            let temdir = tempfile::tempdir()?;
            let path = temdir.path().join("test");
            let uid = nix::unistd::getuid().as_raw();
            let mode = Mode::S_IRWXU;
            create_dir_all_with_mode(&path, uid, mode)?;
            let metadata = path.metadata()?;
            assert!(path.is_dir());
            assert_eq!(metadata.st_uid(), uid);
            assert_eq!(metadata.st_mode() & mode.bits(), mode.bits());
        }
        {
            let temdir = tempfile::tempdir()?;
            let path = temdir.path().join("test");
            let mode = Mode::S_IRWXU;
            std::fs::create_dir(&path)?;
            assert!(path.is_dir());
            match create_dir_all_with_mode(&path, 8899, mode) {
                Err(MkdirWithModeError::MetadataMismatch) => {}
                _ => bail!("should return MetadataMismatch"),
            }
        }
        Ok(())
    }
}
