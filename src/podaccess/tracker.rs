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

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::{debug, info, Instrument};

use super::forward::{worker_port_forward, ClusterDialer};
use super::mount::{mount_request, worker_mount, Mounter};
use super::{PodAccess, PodAccessKey};
use crate::drain::{self, DrainTrigger};

/// Pod-level cancellation scope. Draining it stops the forwards and mounts
/// for that pod only and waits until every worker has wound down; the owning
/// intercept keeps running.
struct PodSync {
    workload: String,
    shutdown: DrainTrigger,
}

/// One-shot signal that fires once the mounts for a key are established or
/// known not to be needed.
pub struct MountsReady(watch::Receiver<bool>);

impl MountsReady {
    pub async fn wait(mut self) {
        // A dropped sender counts as fired: the key was removed.
        let _ = self.0.wait_for(|ready| *ready).await;
    }
}

#[derive(Default)]
struct TrackerState {
    /// The currently running pod syncs.
    alive_pods: HashMap<PodAccessKey, PodSync>,

    /// Rebuilt for every reconciliation round; the keys that must survive
    /// `cancel_unwanted`.
    snapshot: HashSet<PodAccessKey>,

    /// Signals closed when the keyed mounts are prepared. At most one per
    /// key; closing and removing happen together under the tracker lock.
    mounts_ready: HashMap<PodAccessKey, watch::Sender<bool>>,
}

/// Keeps the running set of per-pod port forwards and remote mounts
/// consistent with the latest agent snapshot: at most one live group per key,
/// synchronous teardown of obsolete ones.
pub struct PodAccessTracker {
    dialer: Arc<dyn ClusterDialer>,
    mounter: Arc<dyn Mounter>,
    unmount_grace: std::time::Duration,
    state: Mutex<TrackerState>,
}

impl PodAccessTracker {
    pub fn new(
        dialer: Arc<dyn ClusterDialer>,
        mounter: Arc<dyn Mounter>,
        unmount_grace: std::time::Duration,
    ) -> Self {
        Self {
            dialer,
            mounter,
            unmount_grace,
            state: Mutex::new(TrackerState::default()),
        }
    }

    /// Starts a reconciliation round. Every key must be reaffirmed with
    /// [start](Self::start) before [cancel_unwanted](Self::cancel_unwanted)
    /// runs, or its group is torn down.
    pub fn init_snapshot(&self) {
        let mut state = self.state.lock().unwrap();
        state.snapshot.clear();
        state.mounts_ready.clear();
    }

    /// One-shot readiness signal for the key's mounts in the current round.
    pub fn mounts_ready(&self, key: &PodAccessKey) -> MountsReady {
        let mut state = self.state.lock().unwrap();
        let tx = state
            .mounts_ready
            .entry(key.clone())
            .or_insert_with(|| watch::channel(false).0);
        MountsReady(tx.subscribe())
    }

    /// Records the key as wanted and launches its forwards and mounts unless
    /// they are already running.
    pub fn start(&self, pa: PodAccess) {
        let key = pa.key();
        let mut state = self.state.lock().unwrap();

        // Part of the current snapshot, so cancel_unwanted keeps it.
        state.snapshot.insert(key.clone());
        self.start_locked(&mut state, pa, &key);

        // The mounts are now either starting or known unnecessary.
        if let Some(tx) = state.mounts_ready.remove(&key) {
            let _ = tx.send(true);
        }
    }

    fn start_locked(&self, state: &mut TrackerState, pa: PodAccess, key: &PodAccessKey) {
        if !pa.should_forward() && !pa.should_mount() {
            debug!("no mounts or port-forwards needed for {key}");
            return;
        }
        if state.alive_pods.contains_key(key) {
            debug!("mounts and port-forwards already active for {key}");
            return;
        }

        let (shutdown, watcher) = drain::new();
        if pa.should_mount() {
            if let Some(req) = mount_request(&pa, self.unmount_grace) {
                let span = tracing::info_span!("mount", pod = %pa.pod_ip, port = req.port);
                tokio::spawn(
                    worker_mount(self.mounter.clone(), req, watcher.clone()).instrument(span),
                );
            }
        }
        for mapping in &pa.port_forwards {
            let span = tracing::info_span!("port-forward", pod = %pa.pod_ip, port = mapping.local);
            tokio::spawn(
                worker_port_forward(self.dialer.clone(), pa.pod_ip, *mapping, watcher.clone())
                    .instrument(span),
            );
        }
        drop(watcher);

        state.alive_pods.insert(
            key.clone(),
            PodSync {
                workload: pa.workload.clone(),
                shutdown,
            },
        );
        debug!("started mounts and port-forwards for {key}");
    }

    /// Cancels every key not reaffirmed since [init_snapshot](Self::init_snapshot)
    /// and waits until its workers are gone. The tracker lock is released
    /// during the wait: workers call back in while winding down.
    pub async fn cancel_unwanted(&self) {
        let mut unwanted = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            let stale: Vec<PodAccessKey> = state
                .alive_pods
                .keys()
                .filter(|k| !state.snapshot.contains(*k))
                .cloned()
                .collect();
            for key in stale {
                if let Some(tx) = state.mounts_ready.remove(&key) {
                    let _ = tx.send(true);
                }
                if let Some(sync) = state.alive_pods.remove(&key) {
                    unwanted.push((key, sync));
                }
            }
        }
        for (key, sync) in unwanted {
            info!(
                "terminating mounts and port-forwards for {} of workload {}",
                key, sync.workload
            );
            sync.shutdown.start_drain_and_wait().await;
        }
    }

    /// Tears down every tracked pod. Used when the whole session ends.
    pub async fn shutdown(&self) {
        self.init_snapshot();
        self.cancel_unwanted().await;
    }

    #[cfg(test)]
    pub(crate) fn alive_keys(&self) -> Vec<PodAccessKey> {
        self.state
            .lock()
            .unwrap()
            .alive_pods
            .keys()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::podaccess::forward::AsyncStream;
    use crate::podaccess::mount::MountRequest;
    use crate::podaccess::PortMapping;
    use std::net::IpAddr;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    struct NoDialer;

    #[async_trait::async_trait]
    impl ClusterDialer for NoDialer {
        async fn dial(&self, _: IpAddr, _: u16) -> std::io::Result<Box<dyn AsyncStream>> {
            Err(std::io::Error::other("not dialable in tests"))
        }
    }

    /// Counts mounts and records whether each mount observed its drain before
    /// returning.
    #[derive(Default)]
    struct TrackingMounter {
        mounts: AtomicUsize,
        drained: AtomicBool,
    }

    #[async_trait::async_trait]
    impl Mounter for TrackingMounter {
        async fn mount(
            &self,
            _: &MountRequest,
            drain: crate::drain::DrainWatcher,
        ) -> std::io::Result<()> {
            self.mounts.fetch_add(1, Ordering::SeqCst);
            let blocker = drain.wait_for_drain().await;
            // Flag before releasing the blocker, so a caller observing the
            // completed drain also observes the flag.
            self.drained.store(true, Ordering::SeqCst);
            drop(blocker);
            Ok(())
        }
    }

    fn access(container: &str, pod_ip: &str, sftp: Option<u16>, ports: &[u16]) -> PodAccess {
        PodAccess {
            workload: "echo".to_string(),
            container: container.to_string(),
            pod_ip: pod_ip.parse().unwrap(),
            port_forwards: ports.iter().map(|p| PortMapping { local: 0, pod: *p }).collect(),
            sftp_port: sftp,
            ftp_port: None,
            mount_point: Some("/var/export".to_string()),
            client_mount_point: sftp.map(|_| "/tmp/echo".to_string()),
            read_only: false,
        }
    }

    fn tracker(mounter: Arc<TrackingMounter>) -> PodAccessTracker {
        PodAccessTracker::new(Arc::new(NoDialer), mounter, Duration::from_secs(3))
    }

    fn key(container: &str, pod_ip: &str) -> PodAccessKey {
        PodAccessKey {
            container: container.to_string(),
            pod_ip: pod_ip.parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn pod_churn_rekeys_and_waits_for_workers() {
        let mounter = Arc::new(TrackingMounter::default());
        let t = tracker(mounter.clone());

        // Snapshot 1: the agent runs on 10.0.0.5.
        t.init_snapshot();
        t.start(access("c1", "10.0.0.5", Some(8022), &[]));
        t.cancel_unwanted().await;
        assert_eq!(vec![key("c1", "10.0.0.5")], t.alive_keys());

        // Snapshot 2: the pod moved to 10.0.0.6.
        t.init_snapshot();
        t.start(access("c1", "10.0.0.6", Some(8022), &[]));
        t.cancel_unwanted().await;

        assert_eq!(vec![key("c1", "10.0.0.6")], t.alive_keys());
        // The old pod's worker fully wound down before cancel_unwanted returned.
        assert!(mounter.drained.load(Ordering::SeqCst));
        assert_eq!(2, mounter.mounts.load(Ordering::SeqCst));

        t.shutdown().await;
        assert!(t.alive_keys().is_empty());
    }

    #[tokio::test]
    async fn identical_rounds_are_idempotent() {
        let mounter = Arc::new(TrackingMounter::default());
        let t = tracker(mounter.clone());

        for _ in 0..2 {
            t.init_snapshot();
            t.start(access("c1", "10.0.0.5", Some(8022), &[]));
            t.cancel_unwanted().await;
        }

        assert_eq!(vec![key("c1", "10.0.0.5")], t.alive_keys());
        // The second round reaffirmed the key without starting new workers.
        assert_eq!(1, mounter.mounts.load(Ordering::SeqCst));

        t.shutdown().await;
    }

    #[tokio::test]
    async fn access_without_work_is_a_noop() {
        let mounter = Arc::new(TrackingMounter::default());
        let t = tracker(mounter.clone());

        t.init_snapshot();
        t.start(access("c1", "10.0.0.5", None, &[]));
        t.cancel_unwanted().await;

        assert!(t.alive_keys().is_empty());
        assert_eq!(0, mounter.mounts.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn mounts_ready_fires_exactly_once_per_round() {
        let mounter = Arc::new(TrackingMounter::default());
        let t = Arc::new(tracker(mounter));

        t.init_snapshot();
        let ready = t.mounts_ready(&key("c1", "10.0.0.5"));
        t.start(access("c1", "10.0.0.5", Some(8022), &[]));

        tokio::time::timeout(Duration::from_secs(1), ready.wait())
            .await
            .expect("mounts_ready never fired");

        // A signal requested after the round fires on teardown instead.
        let late = t.mounts_ready(&key("c1", "10.0.0.5"));
        t.init_snapshot();
        t.cancel_unwanted().await;
        tokio::time::timeout(Duration::from_secs(1), late.wait())
            .await
            .expect("mounts_ready not closed by teardown");
    }
}
