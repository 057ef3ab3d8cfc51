//! Durable description of an application container and its lifecycle state
use std::collections::{BTreeSet, HashMap};
use std::fmt::Display;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

use crate::reclaim::ResourceKind;

/// Indicates the lifecycle state of the container
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum LifecycleState {
    // Principal, filesystem and allocations exist, nothing has been started
    #[default]
    Provisioned,
    // Application processes are running
    Running,
    // Application processes have been stopped
    Stopped,
    // Teardown has started; the record is kept until every resource is released
    Destroying,
}

impl LifecycleState {
    pub fn is_destroying(&self) -> bool {
        matches!(self, LifecycleState::Destroying)
    }
}

impl Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let print = match *self {
            Self::Provisioned => "Provisioned",
            Self::Running => "Running",
            Self::Stopped => "Stopped",
            Self::Destroying => "Destroying",
        };

        write!(f, "{print}")
    }
}

/// The OS user and group the container's processes run as
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    pub uid: u32,
    pub gid: u32,
    pub user_name: String,
}

#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let print = match *self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        };

        write!(f, "{print}")
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PortAllocation {
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
}

impl PortAllocation {
    /// Name of the node-wide reservation entry, e.g. `35531-tcp`.
    pub fn reservation_name(&self) -> String {
        format!("{}-{}", self.port, self.protocol)
    }
}

/// Disk quota assigned to the principal
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Quota {
    pub blocks: u64,
    pub inodes: u64,
}

/// Runtime bound to the container. Kept for reporting only.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct CartridgeBinding {
    pub name: String,
    pub vendor: String,
    pub component: String,
    pub version: String,
}

/// Stores everything the node knows about one container
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ContainerRecord {
    // Primary key of the record
    pub container_uuid: String,
    #[serde(default)]
    pub application_uuid: String,
    #[serde(default)]
    pub application_name: String,
    #[serde(default)]
    pub container_name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub state: LifecycleState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub principal: Option<Principal>,
    // Processes started on behalf of the container
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pids: Vec<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cgroup_path: Option<PathBuf>,
    // Bind mount holding the container's network namespace open
    #[serde(skip_serializing_if = "Option::is_none")]
    pub netns_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortAllocation>,
    pub filesystem_root: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<Quota>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub environment: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cartridges: Vec<CartridgeBinding>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
}

impl ContainerRecord {
    pub fn new<P: Into<PathBuf>>(container_uuid: &str, filesystem_root: P) -> Self {
        Self {
            container_uuid: container_uuid.to_owned(),
            filesystem_root: filesystem_root.into(),
            created: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn uuid(&self) -> &str {
        &self.container_uuid
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn set_state(&mut self, state: LifecycleState) -> &mut Self {
        self.state = state;
        self
    }

    pub fn set_application(&mut self, uuid: &str, name: &str) -> &mut Self {
        self.application_uuid = uuid.to_owned();
        self.application_name = name.to_owned();
        self
    }

    pub fn set_name(&mut self, container_name: &str, namespace: &str) -> &mut Self {
        self.container_name = container_name.to_owned();
        self.namespace = namespace.to_owned();
        self
    }

    pub fn set_principal(&mut self, principal: Principal) -> &mut Self {
        self.principal = Some(principal);
        self
    }

    pub fn add_pid(&mut self, pid: i32) -> &mut Self {
        self.pids.push(pid);
        self
    }

    pub fn tracked_pids(&self) -> Vec<Pid> {
        self.pids.iter().copied().map(Pid::from_raw).collect()
    }

    pub fn add_port(&mut self, port: u16, protocol: Protocol) -> &mut Self {
        self.ports.push(PortAllocation { port, protocol });
        self
    }

    pub fn set_cgroup_path<P: Into<PathBuf>>(&mut self, path: P) -> &mut Self {
        self.cgroup_path = Some(path.into());
        self
    }

    pub fn set_netns_path<P: Into<PathBuf>>(&mut self, path: P) -> &mut Self {
        self.netns_path = Some(path.into());
        self
    }

    pub fn set_quota(&mut self, quota: Quota) -> &mut Self {
        self.quota = Some(quota);
        self
    }

    pub fn add_cartridge(&mut self, cartridge: CartridgeBinding) -> &mut Self {
        self.cartridges.push(cartridge);
        self
    }

    pub fn filesystem_root(&self) -> &Path {
        &self.filesystem_root
    }

    /// OS resources the record still claims. The filesystem root is checked
    /// by the eradicator itself because it may be gone already.
    pub fn held_resources(&self) -> BTreeSet<ResourceKind> {
        let mut held = BTreeSet::new();
        if !self.pids.is_empty() {
            held.insert(ResourceKind::Process);
        }
        if self.cgroup_path.is_some() {
            held.insert(ResourceKind::Cgroup);
        }
        if self.netns_path.is_some() {
            held.insert(ResourceKind::Namespace);
        }
        if !self.ports.is_empty() {
            held.insert(ResourceKind::Port);
        }
        if self.quota.is_some() {
            held.insert(ResourceKind::Quota);
        }
        if self.principal.is_some() {
            held.insert(ResourceKind::Principal);
        }
        held
    }

    /// Forgets a resource that has been released so a resumed teardown does
    /// not report it again.
    pub fn forget(&mut self, kind: ResourceKind) -> &mut Self {
        match kind {
            ResourceKind::Process => self.pids.clear(),
            ResourceKind::Cgroup => self.cgroup_path = None,
            ResourceKind::Namespace => self.netns_path = None,
            ResourceKind::Port => self.ports.clear(),
            ResourceKind::Quota => self.quota = None,
            ResourceKind::Principal => self.principal = None,
            ResourceKind::Filesystem | ResourceKind::Record => {}
        }
        self
    }
}
