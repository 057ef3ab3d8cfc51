use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use libappcontainer::utils::{create_dir_all_with_mode, unprivileged};
use nix::libc;
use nix::sys::stat::Mode;
use nix::unistd::getuid;

/// Picks the directory holding container records and the node config
pub fn determine(root_path: Option<PathBuf>) -> Result<PathBuf> {
    let uid = getuid().as_raw();

    if let Some(path) = root_path {
        if !path.exists() {
            create_dir_all_with_mode(&path, uid, Mode::S_IRWXU)?;
        }
        let path = path.canonicalize()?;
        return Ok(path);
    }

    if !unprivileged() {
        let path = get_default_privileged_path();
        create_dir_all_with_mode(&path, uid, Mode::S_IRWXU)?;
        return Ok(path);
    }

    // see https://specifications.freedesktop.org/basedir-spec/basedir-spec-latest.html
    if let Ok(path) = std::env::var("XDG_RUNTIME_DIR") {
        let path = Path::new(&path).join("appctl");
        if create_dir_all_with_mode(&path, uid, Mode::S_IRWXU).is_ok() {
            return Ok(path);
        }
    }

    let tmp_dir = get_default_unprivileged_path(uid);
    if create_dir_all_with_mode(&tmp_dir, uid, Mode::S_IRWXU).is_ok() {
        return Ok(tmp_dir);
    }

    bail!("could not find a storage location with suitable permissions for the current user");
}

#[cfg(not(test))]
fn get_default_privileged_path() -> PathBuf {
    PathBuf::from("/run/appctl")
}

#[cfg(test)]
fn get_default_privileged_path() -> PathBuf {
    std::env::temp_dir().join("default_appctl_path")
}

fn get_default_unprivileged_path(uid: libc::uid_t) -> PathBuf {
    std::env::temp_dir().join(format!("appctl-{uid}"))
}
