//! Fixtures shared by the unit tests of this crate and the tests of the
//! command line tool
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::config::NodeConfig;
use crate::container::record::{
    CartridgeBinding, ContainerRecord, LifecycleState, Principal, Protocol, Quota,
};
use crate::host::test::TestHost;

/// Node config with timeouts short enough for tests
pub fn fast_config() -> NodeConfig {
    NodeConfig {
        grace_period_ms: 30,
        kill_wait_ms: 10,
        poll_interval_ms: 1,
        erase_retries: 2,
        erase_backoff_ms: 1,
        ..Default::default()
    }
}

/// A running container named `<uuid>-app` in namespace `ns1` with one tracked
/// process, one tcp port and a principal whose uid and gid are `uid`. The
/// filesystem root is `<containers>/<uuid>` and is not created.
pub fn running_container(
    uuid: &str,
    uid: u32,
    pid: i32,
    port: u16,
    containers: &Path,
) -> ContainerRecord {
    let mut record = ContainerRecord::new(uuid, containers.join(uuid));
    record
        .set_application(&format!("{uuid}-app-uuid"), &format!("{uuid}-app"))
        .set_name(&format!("{uuid}-app"), "ns1")
        .set_state(LifecycleState::Running)
        .set_principal(Principal {
            uid,
            gid: uid,
            user_name: uuid.to_owned(),
        })
        .add_pid(pid)
        .add_port(port, Protocol::Tcp)
        .add_cartridge(CartridgeBinding {
            name: "php".to_owned(),
            vendor: "example".to_owned(),
            component: "web".to_owned(),
            version: "5.4".to_owned(),
        });
    record
}

/// Adds a cgroup, a network namespace handle and a quota to `record`
pub fn with_isolation(record: &mut ContainerRecord) -> &mut ContainerRecord {
    let uuid = record.uuid().to_owned();
    record
        .set_cgroup_path(format!("/sys/fs/cgroup/appctl/{uuid}"))
        .set_netns_path(format!("/run/netns/{uuid}"))
        .set_quota(Quota {
            blocks: 1_048_576,
            inodes: 80_000,
        })
}

/// Registers everything `record` holds with `host`
pub fn provision(host: &TestHost, record: &ContainerRecord) {
    let uid = record.principal.as_ref().map(|p| p.uid).unwrap_or(0);
    for pid in &record.pids {
        host.spawn_process(*pid, uid);
    }
    for port in &record.ports {
        host.reserve_port(port, record.uuid());
    }
    if let Some(path) = &record.cgroup_path {
        host.add_cgroup(path.to_owned());
    }
    if let Some(path) = &record.netns_path {
        host.add_netns(path.to_owned());
    }
    if record.quota.is_some() {
        host.add_quota(uid);
    }
    if record.principal.is_some() {
        host.add_user(uid);
    }
}

/// Lays out a small application tree below `root`, including a read-only directory
pub fn populate_root(root: &Path) -> io::Result<()> {
    let repo = root.join("git").join("app.git");
    fs::create_dir_all(repo.join("objects"))?;
    fs::write(repo.join("HEAD"), "ref: refs/heads/master\n")?;
    fs::create_dir_all(root.join("app-root").join("data"))?;
    fs::write(root.join("app-root").join("data").join("db.sqlite"), "")?;
    fs::create_dir_all(root.join(".env"))?;
    fs::write(root.join(".env").join("APP_DNS"), "app-ns1.example.com")?;
    fs::set_permissions(root.join(".env"), fs::Permissions::from_mode(0o500))?;
    Ok(())
}
