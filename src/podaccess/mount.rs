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
use std::sync::Mutex;

use tracing::{error, info};

use super::{Error, PodAccess};
use crate::drain::DrainWatcher;

/// Which remote filesystem protocol a mount uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MountProto {
    Sftp,
    Ftp,
}

/// Everything a mount driver needs to establish one remote mount.
#[derive(Clone, Debug)]
pub struct MountRequest {
    pub workload: String,
    pub container: String,
    pub pod_ip: IpAddr,
    pub port: u16,
    pub proto: MountProto,
    pub mount_point: String,
    pub client_mount_point: String,
    pub read_only: bool,
    /// How long the driver may spend unmounting before giving up.
    pub unmount_grace: std::time::Duration,
}

/// Drives one remote mount until the watcher is drained. Implementations
/// wrap the out-of-process SFTP/FTP clients. A driver must serialize mounts
/// of the same mount point internally: when a pod is replaced, the new pod's
/// mount may be requested while the old pod's unmount is still in flight.
#[async_trait::async_trait]
pub trait Mounter: Send + Sync {
    async fn mount(&self, req: &MountRequest, drain: DrainWatcher) -> std::io::Result<()>;
}

/// Builds the mount request for a pod access, choosing SFTP over FTP when the
/// agent offers both.
pub(crate) fn mount_request(pa: &PodAccess, unmount_grace: std::time::Duration) -> Option<MountRequest> {
    let client_mount_point = pa.client_mount_point.clone()?;
    let (proto, port) = match (pa.sftp_port, pa.ftp_port) {
        (Some(p), _) => (MountProto::Sftp, p),
        (None, Some(p)) => (MountProto::Ftp, p),
        (None, None) => return None,
    };
    Some(MountRequest {
        workload: pa.workload.clone(),
        container: pa.container.clone(),
        pod_ip: pa.pod_ip,
        port,
        proto,
        mount_point: pa.mount_point.clone().unwrap_or_default(),
        client_mount_point,
        read_only: pa.read_only,
        unmount_grace,
    })
}

/// Runs one mount to completion. Failures log and return, so the worker
/// count always winds down to zero.
pub(crate) async fn worker_mount(
    mounter: std::sync::Arc<dyn Mounter>,
    req: MountRequest,
    drain: DrainWatcher,
) {
    info!(
        "mounting remote filesystem for {}[{}] (pod {}) at {:?}",
        req.workload, req.container, req.pod_ip, req.client_mount_point
    );
    if let Err(e) = mounter.mount(&req, drain).await {
        error!(
            "remote mount for {}[{}] failed: {e}",
            req.workload, req.container
        );
    }
    info!(
        "unmounted remote filesystem for {}[{}] (pod {}) at {:?}",
        req.workload, req.container, req.pod_ip, req.client_mount_point
    );
}

/// Local mount points and bridge ports are process-unique. A new intercept
/// claims its mount point here before anything is started; a conflicting
/// claim fails without touching the tracker.
#[derive(Default)]
pub struct MountRegistry {
    points: Mutex<HashMap<String, String>>,
    ports: Mutex<HashMap<u16, String>>,
}

impl MountRegistry {
    pub fn claim(
        &self,
        intercept: &str,
        mount_point: Option<&str>,
        mount_port: Option<u16>,
    ) -> Result<(), Error> {
        if let Some(point) = mount_point {
            let mut points = self.points.lock().unwrap();
            if let Some(owner) = points.get(point) {
                if owner != intercept {
                    return Err(Error::MountPointInUse(point.to_string(), owner.clone()));
                }
            }
            points.insert(point.to_string(), intercept.to_string());
        }
        if let Some(port) = mount_port {
            let mut ports = self.ports.lock().unwrap();
            if let Some(owner) = ports.get(&port) {
                if owner != intercept {
                    return Err(Error::MountPortInUse(port, owner.clone()));
                }
            }
            ports.insert(port, intercept.to_string());
        }
        Ok(())
    }

    pub fn release(&self, intercept: &str) {
        self.points
            .lock()
            .unwrap()
            .retain(|_, owner| owner != intercept);
        self.ports
            .lock()
            .unwrap()
            .retain(|_, owner| owner != intercept);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_mount_point_is_rejected() {
        let reg = MountRegistry::default();
        reg.claim("echo-1", Some("/tmp/echo"), None).unwrap();

        let err = reg.claim("echo-2", Some("/tmp/echo"), None).unwrap_err();
        assert!(matches!(err, Error::MountPointInUse(point, owner)
            if point == "/tmp/echo" && owner == "echo-1"));

        // Re-claiming your own mount point is fine.
        reg.claim("echo-1", Some("/tmp/echo"), None).unwrap();

        // After release, the point is free again.
        reg.release("echo-1");
        reg.claim("echo-2", Some("/tmp/echo"), None).unwrap();
    }

    #[test]
    fn duplicate_mount_port_is_rejected() {
        let reg = MountRegistry::default();
        reg.claim("echo-1", None, Some(8022)).unwrap();
        let err = reg.claim("echo-2", None, Some(8022)).unwrap_err();
        assert!(matches!(err, Error::MountPortInUse(8022, owner) if owner == "echo-1"));
    }

    #[test]
    fn prefers_sftp_over_ftp() {
        let pa = PodAccess {
            workload: "echo".to_string(),
            container: "c1".to_string(),
            pod_ip: "10.0.0.5".parse().unwrap(),
            port_forwards: vec![],
            sftp_port: Some(8022),
            ftp_port: Some(8021),
            mount_point: Some("/var/export".to_string()),
            client_mount_point: Some("/tmp/echo".to_string()),
            read_only: false,
        };
        let req = mount_request(&pa, std::time::Duration::from_secs(3)).unwrap();
        assert_eq!(MountProto::Sftp, req.proto);
        assert_eq!(8022, req.port);
    }

    #[test]
    fn no_client_mount_point_means_no_mount() {
        let pa = PodAccess {
            workload: "echo".to_string(),
            container: "c1".to_string(),
            pod_ip: "10.0.0.5".parse().unwrap(),
            port_forwards: vec![],
            sftp_port: Some(8022),
            ftp_port: None,
            mount_point: Some("/var/export".to_string()),
            client_mount_point: None,
            read_only: false,
        };
        assert!(mount_request(&pa, std::time::Duration::from_secs(3)).is_none());
    }
}
