//! Removal of a container's private filesystem tree.
//!
//! The walk never follows symlinks and never leaves the device the root lives
//! on, so a link or a bind mount planted inside the container cannot make us
//! delete anything outside of it.
use std::ffi::{CStr, CString, OsStr};
use std::fmt;
use std::fs::{self, File};
use std::io;
use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::linux::fs::MetadataExt;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::errno::Errno;

use crate::utils::{self, PathBufExt};

#[derive(Debug, thiserror::Error)]
pub enum EraseError {
    #[error("{} path(s) resisted deletion: {0:?}", .0.len())]
    PartialFailure(Vec<PathBuf>),
    #[error("refusing to erase {0:?}")]
    UnsafeRoot(PathBuf),
}

type Result<T> = std::result::Result<T, EraseError>;

/// Bounds the retries of a removal that failed with a transient error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff_limit: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 4,
            backoff_limit: Duration::from_millis(100),
        }
    }
}

type UnlinkAt = fn(RawFd, &CStr, libc::c_int) -> io::Result<()>;

#[derive(Clone)]
pub struct Eradicator {
    policy: RetryPolicy,
    unlink: UnlinkAt,
}

impl fmt::Debug for Eradicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Eradicator")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl Default for Eradicator {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl Eradicator {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            unlink: unlink_at,
        }
    }

    #[cfg(test)]
    fn with_unlink(mut self, unlink: UnlinkAt) -> Self {
        self.unlink = unlink;
        self
    }

    fn remove_with_retry<F>(&self, op: F) -> io::Result<()>
    where
        F: FnMut() -> io::Result<()>,
    {
        utils::retry_removal(op, self.policy.attempts, self.policy.backoff_limit)
    }

    fn remove_at(&self, dir: &File, name: &CStr, flags: libc::c_int) -> io::Result<()> {
        let unlink = self.unlink;
        self.remove_with_retry(|| unlink(dir.as_raw_fd(), name, flags))
    }

    /// Deletes `root` and everything below it. Returns whether there was
    /// anything to delete.
    ///
    /// The tree is walked through directory descriptors: every entry is
    /// inspected and removed relative to the descriptor of the directory
    /// holding it, and directories are opened with `O_NOFOLLOW`. A directory
    /// swapped for a symlink while we walk is therefore reported instead of
    /// followed.
    pub fn erase(&self, root: &Path) -> Result<bool> {
        let root = root.normalize();
        let (Some(parent), Some(name)) = (root.parent(), root.file_name()) else {
            return Err(EraseError::UnsafeRoot(root));
        };
        if !root.is_absolute() {
            return Err(EraseError::UnsafeRoot(root));
        }
        let Ok(name) = CString::new(name.as_bytes()) else {
            return Err(EraseError::UnsafeRoot(root));
        };

        let parent = match open_dir(parent) {
            Ok(parent) => parent,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(?root, "filesystem root is already gone");
                return Ok(false);
            }
            Err(err) => {
                tracing::warn!(?root, %err, "failed to open the directory holding the root");
                return Err(EraseError::PartialFailure(vec![root]));
            }
        };
        let stat = match stat_at(parent.as_raw_fd(), &name) {
            Ok(stat) => stat,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(?root, "filesystem root is already gone");
                return Ok(false);
            }
            Err(err) => {
                tracing::warn!(?root, %err, "failed to inspect filesystem root");
                return Err(EraseError::PartialFailure(vec![root]));
            }
        };

        let mut resisted = Vec::new();
        if stat.st_mode & libc::S_IFMT == libc::S_IFDIR {
            match open_dir_at(parent.as_raw_fd(), &name) {
                Ok(dir) => {
                    self.remove_tree(&dir, &root, &root, stat.st_dev, &mut resisted);
                    drop(dir);
                    if resisted.is_empty() {
                        if let Err(err) = self.remove_at(&parent, &name, libc::AT_REMOVEDIR) {
                            tracing::warn!(?root, %err, "failed to remove directory");
                            resisted.push(root.to_owned());
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(?root, %err, "failed to open filesystem root");
                    resisted.push(root.to_owned());
                }
            }
        } else {
            if stat.st_mode & libc::S_IFMT == libc::S_IFLNK {
                tracing::warn!(?root, "filesystem root is a symlink, removing the link only");
            }
            if let Err(err) = self.remove_at(&parent, &name, 0) {
                tracing::warn!(?root, %err, "failed to remove");
                resisted.push(root.to_owned());
            }
        }

        if resisted.is_empty() {
            tracing::debug!(?root, "filesystem root erased");
            Ok(true)
        } else {
            Err(EraseError::PartialFailure(resisted))
        }
    }

    /// Empties the open directory `dir`, which lives at `dir_path`. Paths are
    /// only used for logging and reporting.
    fn remove_tree(
        &self,
        dir: &File,
        dir_path: &Path,
        root: &Path,
        device: u64,
        resisted: &mut Vec<PathBuf>,
    ) {
        // entries of a read-only directory cannot be unlinked
        if let Err(err) = make_owner_writable(dir) {
            tracing::debug!(?dir_path, %err, "failed to adjust permissions");
        }

        let names = match read_names(dir) {
            Ok(names) => names,
            Err(err) => {
                tracing::warn!(?dir_path, %err, "failed to read directory");
                resisted.push(dir_path.to_owned());
                return;
            }
        };

        for name in names {
            let path = dir_path.join(OsStr::from_bytes(name.to_bytes()));
            let stat = match stat_at(dir.as_raw_fd(), &name) {
                Ok(stat) => stat,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => {
                    tracing::warn!(?path, %err, "failed to inspect");
                    resisted.push(path);
                    continue;
                }
            };

            if stat.st_mode & libc::S_IFMT == libc::S_IFDIR {
                if stat.st_dev != device {
                    tracing::warn!(?path, "refusing to cross into another filesystem");
                    resisted.push(path);
                    continue;
                }
                let child = match open_dir_at(dir.as_raw_fd(), &name) {
                    Ok(child) => child,
                    Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                    Err(err) => {
                        // ELOOP or ENOTDIR when the directory was replaced by a link
                        tracing::warn!(?path, %err, "failed to open directory");
                        resisted.push(path);
                        continue;
                    }
                };
                match child.metadata() {
                    Ok(metadata) if metadata.st_dev() == device => {}
                    _ => {
                        tracing::warn!(?path, "directory changed while walking, skipping");
                        resisted.push(path);
                        continue;
                    }
                }

                let nested = resisted.len();
                self.remove_tree(&child, &path, root, device, resisted);
                drop(child);
                // a directory with resisting entries cannot be removed, those are reported instead
                if resisted.len() == nested {
                    if let Err(err) = self.remove_at(dir, &name, libc::AT_REMOVEDIR) {
                        tracing::warn!(?path, %err, "failed to remove directory");
                        resisted.push(path);
                    }
                }
                continue;
            }

            if stat.st_mode & libc::S_IFMT == libc::S_IFLNK {
                if let Ok(target) = fs::read_link(&path) {
                    if !utils::resolve_link_target(&path, &target).is_within(root) {
                        tracing::warn!(
                            ?path,
                            ?target,
                            "symlink points outside the container, removing the link only"
                        );
                    }
                }
            }
            if let Err(err) = self.remove_at(dir, &name, 0) {
                tracing::warn!(?path, %err, "failed to remove");
                resisted.push(path);
            }
        }
    }

    /// Removes every symlink directly inside one of `link_dirs` that points
    /// into `root`. Returns the number of links removed.
    pub fn remove_links(&self, link_dirs: &[PathBuf], root: &Path) -> Result<usize> {
        let root = root.normalize();
        let mut removed = 0;
        let mut resisted = Vec::new();

        for dir in link_dirs {
            let entries = match fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => {
                    tracing::warn!(?dir, %err, "failed to read link directory");
                    resisted.push(dir.to_owned());
                    continue;
                }
            };
            for entry in entries.flatten() {
                let link = entry.path();
                let is_symlink = entry
                    .file_type()
                    .map(|file_type| file_type.is_symlink())
                    .unwrap_or(false);
                if !is_symlink {
                    continue;
                }
                let Ok(target) = fs::read_link(&link) else {
                    continue;
                };
                if !utils::resolve_link_target(&link, &target).is_within(&root) {
                    continue;
                }
                match self.remove_with_retry(|| fs::remove_file(&link)) {
                    Ok(()) => {
                        tracing::debug!(?link, ?target, "removed link into container");
                        removed += 1;
                    }
                    Err(err) => {
                        tracing::warn!(?link, %err, "failed to remove link");
                        resisted.push(link);
                    }
                }
            }
        }

        if resisted.is_empty() {
            Ok(removed)
        } else {
            Err(EraseError::PartialFailure(resisted))
        }
    }
}

fn make_owner_writable(dir: &File) -> io::Result<()> {
    let mut permissions = dir.metadata()?.permissions();
    let mode = permissions.mode();
    if mode & 0o700 != 0o700 {
        permissions.set_mode(mode | 0o700);
        dir.set_permissions(permissions)?;
    }
    Ok(())
}

fn into_file(fd: RawFd) -> File {
    // SAFETY: `fd` was just returned by the kernel and nothing else owns it
    File::from(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn open_dir(path: &Path) -> io::Result<File> {
    let path = CString::new(path.as_os_str().as_bytes())
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
    let fd = Errno::result(unsafe {
        libc::open(
            path.as_ptr(),
            libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC,
        )
    })?;
    Ok(into_file(fd))
}

/// Opens the directory `name` inside `parent`, refusing to follow a symlink.
fn open_dir_at(parent: RawFd, name: &CStr) -> io::Result<File> {
    let fd = Errno::result(unsafe {
        libc::openat(
            parent,
            name.as_ptr(),
            libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC | libc::O_NOFOLLOW,
        )
    })?;
    Ok(into_file(fd))
}

fn stat_at(dir: RawFd, name: &CStr) -> io::Result<libc::stat> {
    let mut stat = MaybeUninit::<libc::stat>::zeroed();
    Errno::result(unsafe {
        libc::fstatat(
            dir,
            name.as_ptr(),
            stat.as_mut_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    })?;
    // SAFETY: fstatat succeeded and filled in the buffer
    Ok(unsafe { stat.assume_init() })
}

fn unlink_at(dir: RawFd, name: &CStr, flags: libc::c_int) -> io::Result<()> {
    Errno::result(unsafe { libc::unlinkat(dir, name.as_ptr(), flags) })?;
    Ok(())
}

/// Names of the entries of `dir`, without `.` and `..`.
fn read_names(dir: &File) -> io::Result<Vec<CString>> {
    // the stream owns its descriptor, so it gets a copy
    let fd = Errno::result(unsafe { libc::dup(dir.as_raw_fd()) })?;
    let stream = unsafe { libc::fdopendir(fd) };
    if stream.is_null() {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }

    let mut names = Vec::new();
    let result = loop {
        // readdir only reports errors through errno
        let entry = unsafe {
            Errno::clear();
            libc::readdir(stream)
        };
        if entry.is_null() {
            break match Errno::last() {
                Errno::UnknownErrno => Ok(()),
                errno => Err(io::Error::from(errno)),
            };
        }
        let name = unsafe { CStr::from_ptr((*entry).d_name.as_ptr()) };
        if name.to_bytes() != b"." && name.to_bytes() != b".." {
            names.push(name.to_owned());
        }
    };
    unsafe { libc::closedir(stream) };

    result.map(|()| names)
}
