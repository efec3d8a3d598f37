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

use hickory_proto::rr::Name;
use prometheus_client::registry::Registry;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time;
use tracing::{error, info, warn};

use crate::dns::ClusterResolver;
use crate::drain;
use crate::podaccess::{watch_agents, AccessPlan, AgentInfo, ClusterDialer, Mounter, PodAccessTracker};
use crate::routing::{CommandRunner, HostCommandRunner};
use crate::socket::DefaultSocketFactory;
use crate::{config, metrics, osdns, signal};

/// The external collaborators wired in by the embedding CLI: the cluster
/// resolver and proxy transports, the mount driver, and the manager-fed
/// inputs (agent snapshots, search paths).
pub struct Collaborators {
    pub cluster_resolver: Arc<dyn ClusterResolver>,
    pub cluster_dialer: Arc<dyn ClusterDialer>,
    pub mounter: Arc<dyn Mounter>,
    pub access_plan: Arc<dyn AccessPlan>,
    pub agent_snapshots: mpsc::Receiver<Vec<AgentInfo>>,
    pub search_paths: watch::Receiver<Vec<Name>>,
}

/// Starts the interception core and runs it until `shutdown` fires or a
/// startup error makes continuing pointless.
///
/// Configuration and bind errors propagate out of here; transient per-query
/// errors and teardown failures are only observed in the logs. A drain caused
/// by the shutdown signal is a successful exit.
pub async fn spawn(
    shutdown: signal::Shutdown,
    cfg: config::Config,
    collab: Collaborators,
) -> anyhow::Result<()> {
    let (drain_tx, drain_rx) = drain::new();
    let (fatal_tx, fatal_rx) = oneshot::channel();

    let mut registry = Registry::default();
    let dns_metrics = Arc::new(crate::dns::Metrics::new(metrics::sub_registry(&mut registry)));
    let runner: Arc<dyn CommandRunner> = Arc::new(HostCommandRunner);

    // DNS interception: managed resolver when available, NAT override otherwise.
    {
        let cfg = cfg.clone();
        let cluster = collab.cluster_resolver.clone();
        let drain_rx = drain_rx.clone();
        let search_paths = collab.search_paths.clone();
        let runner = runner.clone();
        tokio::spawn(async move {
            let res = osdns::worker(
                &cfg,
                cluster,
                dns_metrics,
                drain_rx,
                search_paths,
                runner,
                &DefaultSocketFactory,
            )
            .await;
            if let Err(e) = res {
                error!("dns interception: {e}");
                let _ = fatal_tx.send(e);
            }
        });
    }

    // Pod access: reconcile agent snapshots into port forwards and mounts.
    let tracker = Arc::new(PodAccessTracker::new(
        collab.cluster_dialer.clone(),
        collab.mounter.clone(),
        cfg.mount_grace_period,
    ));
    tokio::spawn(watch_agents(
        collab.agent_snapshots,
        tracker.clone(),
        collab.access_plan.clone(),
        cfg.agent_ip_timeout,
        drain_rx.clone(),
    ));

    // Only the component clones keep the drain open.
    drop(drain_rx);

    let fatal = tokio::select! {
        _ = shutdown.wait() => None,
        res = fatal_rx => res.ok(),
    };

    match time::timeout(
        cfg.termination_grace_period,
        drain_tx.start_drain_and_wait(),
    )
    .await
    {
        Ok(()) => info!("shutdown completed gracefully"),
        Err(_) => warn!(
            "graceful shutdown did not complete in {:?}, terminating now",
            cfg.termination_grace_period
        ),
    }

    match fatal {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}
