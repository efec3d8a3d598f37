// Copyright Podlink Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::HashMap;
use std::net::IpAddr;

pub mod forward;
pub mod mount;
pub mod tracker;
pub mod watcher;

pub use forward::ClusterDialer;
pub use mount::{MountRegistry, Mounter};
pub use tracker::PodAccessTracker;
pub use watcher::{watch_agents, AccessPlan};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("mount point {0} already in use by intercept {1}")]
    MountPointInUse(String, String),

    #[error("mount port {0} already in use by intercept {1}")]
    MountPortInUse(u16, String),
}

/// One entry of an agent snapshot: a live traffic agent together with the
/// ports and environment needed to reach its pod.
#[derive(Clone, Debug)]
pub struct AgentInfo {
    pub workload: String,
    pub container: String,
    pub pod_name: String,
    pub pod_ip: IpAddr,
    pub sftp_port: Option<u16>,
    pub ftp_port: Option<u16>,
    /// The container environment, passed through to the env emitters.
    pub environment: HashMap<String, String>,
}

/// Identifies the pod currently chosen for an intercepted container. The
/// workload name alone is too coarse (several containers may be intercepted
/// separately) and the pod name too volatile (a rename can preserve the IP),
/// so the key is the container plus the pod IP.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct PodAccessKey {
    pub container: String,
    pub pod_ip: IpAddr,
}

impl std::fmt::Display for PodAccessKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.container, self.pod_ip)
    }
}

/// A local port forwarded to a port on the pod.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortMapping {
    pub local: u16,
    pub pod: u16,
}

/// The per-pod bundle of local port forwards and remote mounts for one
/// intercepted container.
#[derive(Clone, Debug)]
pub struct PodAccess {
    pub workload: String,
    pub container: String,
    pub pod_ip: IpAddr,
    pub port_forwards: Vec<PortMapping>,
    pub sftp_port: Option<u16>,
    pub ftp_port: Option<u16>,
    /// Directory exported by the agent, relative to the pod filesystem.
    pub mount_point: Option<String>,
    /// Local directory the export is mounted on.
    pub client_mount_point: Option<String>,
    pub read_only: bool,
}

impl PodAccess {
    pub fn key(&self) -> PodAccessKey {
        PodAccessKey {
            container: self.container.clone(),
            pod_ip: self.pod_ip,
        }
    }

    pub fn should_forward(&self) -> bool {
        !self.port_forwards.is_empty()
    }

    pub fn should_mount(&self) -> bool {
        (self.sftp_port.is_some() || self.ftp_port.is_some()) && self.client_mount_point.is_some()
    }
}
