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

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error};

use super::tracker::PodAccessTracker;
use super::AgentInfo;
use crate::drain::DrainWatcher;

/// Decides what local access an agent snapshot entry should produce. The
/// intercept bookkeeping that owns this decision (desired ports, mount
/// points, read-only flags) lives outside this crate. Implementations may
/// have to wait for the agent's pod IP to become dialable; the watcher bounds
/// that wait.
#[async_trait::async_trait]
pub trait AccessPlan: Send + Sync {
    async fn pod_access(&self, agent: &AgentInfo) -> Option<super::PodAccess>;
}

/// Reconciles a stream of agent snapshots against the tracker. A closed
/// stream is handled as one final empty snapshot, so every forward and mount
/// is cancelled correctly.
pub async fn watch_agents(
    mut snapshots: mpsc::Receiver<Vec<AgentInfo>>,
    tracker: Arc<PodAccessTracker>,
    plan: Arc<dyn AccessPlan>,
    agent_ip_timeout: Duration,
    drain: DrainWatcher,
) {
    let drained = drain.wait_for_drain();
    tokio::pin!(drained);

    loop {
        tokio::select! {
            msg = snapshots.recv() => {
                let done = msg.is_none();
                handle_snapshot(&tracker, plan.as_ref(), agent_ip_timeout, msg.unwrap_or_default()).await;
                if done {
                    debug!("agent snapshot stream ended");
                    break;
                }
            }
            _ = &mut drained => break,
        }
    }
    tracker.shutdown().await;
}

async fn handle_snapshot(
    tracker: &PodAccessTracker,
    plan: &dyn AccessPlan,
    agent_ip_timeout: Duration,
    agents: Vec<AgentInfo>,
) {
    tracker.init_snapshot();
    for agent in &agents {
        match tokio::time::timeout(agent_ip_timeout, plan.pod_access(agent)).await {
            Ok(Some(pa)) => tracker.start(pa),
            Ok(None) => {}
            // The pod stays out of this snapshot; a later round picks it up
            // once its agent is reachable.
            Err(_) => error!(
                "timeout waiting for pod-ip {} of {}[{}]",
                agent.pod_ip, agent.workload, agent.container
            ),
        }
    }
    tracker.cancel_unwanted().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drain;
    use crate::podaccess::forward::{AsyncStream, ClusterDialer};
    use crate::podaccess::mount::{MountRequest, Mounter};
    use crate::podaccess::{PodAccess, PodAccessKey};
    use std::collections::HashMap;
    use std::net::IpAddr;
    use std::time::Duration;

    struct NoDialer;

    #[async_trait::async_trait]
    impl ClusterDialer for NoDialer {
        async fn dial(&self, _: IpAddr, _: u16) -> std::io::Result<Box<dyn AsyncStream>> {
            Err(std::io::Error::other("not dialable in tests"))
        }
    }

    struct WaitingMounter;

    #[async_trait::async_trait]
    impl Mounter for WaitingMounter {
        async fn mount(
            &self,
            _: &MountRequest,
            drain: crate::drain::DrainWatcher,
        ) -> std::io::Result<()> {
            drain.wait_for_drain().await;
            Ok(())
        }
    }

    /// Plans an SFTP mount for every agent.
    struct MountEverything;

    #[async_trait::async_trait]
    impl AccessPlan for MountEverything {
        async fn pod_access(&self, agent: &AgentInfo) -> Option<PodAccess> {
            Some(PodAccess {
                workload: agent.workload.clone(),
                container: agent.container.clone(),
                pod_ip: agent.pod_ip,
                port_forwards: vec![],
                sftp_port: agent.sftp_port,
                ftp_port: agent.ftp_port,
                mount_point: Some("/var/export".to_string()),
                client_mount_point: Some(format!("/tmp/{}", agent.workload)),
                read_only: false,
            })
        }
    }

    fn agent(pod_ip: &str) -> AgentInfo {
        AgentInfo {
            workload: "echo".to_string(),
            container: "c1".to_string(),
            pod_name: format!("echo-{pod_ip}"),
            pod_ip: pod_ip.parse().unwrap(),
            sftp_port: Some(8022),
            ftp_port: None,
            environment: HashMap::new(),
        }
    }

    fn key(pod_ip: &str) -> PodAccessKey {
        PodAccessKey {
            container: "c1".to_string(),
            pod_ip: pod_ip.parse().unwrap(),
        }
    }

    async fn wait_for_keys(tracker: &PodAccessTracker, expected: &[PodAccessKey]) {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let mut keys = tracker.alive_keys();
                keys.sort_by_key(|k| k.pod_ip);
                if keys == expected {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| {
            panic!(
                "tracker never reached {:?}, has {:?}",
                expected,
                tracker.alive_keys()
            )
        });
    }

    #[tokio::test]
    async fn snapshots_drive_the_tracker() {
        let tracker = Arc::new(PodAccessTracker::new(
            Arc::new(NoDialer),
            Arc::new(WaitingMounter),
            Duration::from_secs(3),
        ));
        let (tx, rx) = mpsc::channel(4);
        let (trigger, watcher) = drain::new();

        let task = tokio::spawn(watch_agents(
            rx,
            tracker.clone(),
            Arc::new(MountEverything),
            Duration::from_secs(10),
            watcher,
        ));

        tx.send(vec![agent("10.0.0.5")]).await.unwrap();
        wait_for_keys(&tracker, &[key("10.0.0.5")]).await;

        // The pod moved; the old key is torn down in the same round.
        tx.send(vec![agent("10.0.0.6")]).await.unwrap();
        wait_for_keys(&tracker, &[key("10.0.0.6")]).await;

        trigger.start_drain_and_wait().await;
        task.await.unwrap();
        assert!(tracker.alive_keys().is_empty());
    }

    #[tokio::test]
    async fn closed_stream_cancels_everything() {
        let tracker = Arc::new(PodAccessTracker::new(
            Arc::new(NoDialer),
            Arc::new(WaitingMounter),
            Duration::from_secs(3),
        ));
        let (tx, rx) = mpsc::channel(4);
        let (_trigger, watcher) = drain::new();

        let task = tokio::spawn(watch_agents(
            rx,
            tracker.clone(),
            Arc::new(MountEverything),
            Duration::from_secs(10),
            watcher,
        ));

        tx.send(vec![agent("10.0.0.5")]).await.unwrap();
        wait_for_keys(&tracker, &[key("10.0.0.5")]).await;

        drop(tx);
        task.await.unwrap();
        assert!(tracker.alive_keys().is_empty());
    }
}
