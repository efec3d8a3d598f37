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

use std::net::SocketAddr;
use std::sync::Arc;

use hickory_proto::rr::Name;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{flush_dns_cache, resolve_upstream, DedupingPublisher, Error};
use crate::config::Config;
use crate::dns;
use crate::dns::forwarder::UpstreamForwarder;
use crate::dns::pool::UdpPool;
use crate::dns::server::{SearchPathPublisher, Server, ServerState};
use crate::dns::{ClusterResolver, Metrics};
use crate::drain::{self, DrainWatcher};
use crate::routing::CommandRunner;
use crate::socket::SocketFactory;

/// The managed-resolver variant: delegate to the host DNS service instead of
/// rewriting packets. The local server is registered as the per-interface
/// resolver, together with the cluster search list, and deregistered on
/// shutdown.
pub struct ResolvedIntegrator {
    runner: Arc<dyn CommandRunner>,
    interface: String,
}

impl ResolvedIntegrator {
    /// Probes for a usable managed resolver. A missing control binary, an
    /// inactive service, or the absence of a configured interface all yield
    /// the [Error::NotConfigured] sentinel.
    pub async fn probe(
        runner: Arc<dyn CommandRunner>,
        interface: Option<String>,
    ) -> Result<Self, Error> {
        let Some(interface) = interface else {
            debug!("no dns interface configured, managed resolver unavailable");
            return Err(Error::NotConfigured);
        };
        match runner
            .run("resolvectl", &["status".to_string(), "--no-pager".to_string()])
            .await
        {
            Ok(()) => Ok(Self { runner, interface }),
            Err(crate::routing::Error::Spawn { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                debug!("resolvectl is not installed");
                Err(Error::NotConfigured)
            }
            Err(crate::routing::Error::Command { stderr, .. }) => {
                debug!("resolvectl status failed: {stderr}");
                Err(Error::NotConfigured)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Points the interface's DNS at the local server. Failures here are
    /// real misconfigurations and must not silently demote to the overriding
    /// variant.
    pub async fn register(&self, dns_addr: SocketAddr) -> Result<(), Error> {
        self.runner
            .run(
                "resolvectl",
                &[
                    "dns".to_string(),
                    self.interface.clone(),
                    dns_addr.to_string(),
                ],
            )
            .await?;
        Ok(())
    }

    /// Reverts the interface to its previous DNS configuration. Best effort.
    pub async fn deregister(&self) {
        if let Err(e) = self
            .runner
            .run(
                "resolvectl",
                &["revert".to_string(), self.interface.clone()],
            )
            .await
        {
            warn!("failed to revert dns configuration: {e}");
        }
    }
}

#[async_trait::async_trait]
impl SearchPathPublisher for ResolvedIntegrator {
    async fn publish(&self, paths: &[Name]) -> Result<(), dns::Error> {
        let mut args = vec!["domain".to_string(), self.interface.clone()];
        args.extend(paths.iter().map(|p| p.to_string()));
        self.runner
            .run("resolvectl", &args)
            .await
            .map_err(|e| dns::Error::Config(e.to_string()))?;
        // The list must be observable before use.
        flush_dns_cache(self.runner.as_ref()).await;
        Ok(())
    }
}

/// Runs the DNS server bound through the managed resolver until drained.
#[allow(clippy::too_many_arguments)]
pub async fn worker(
    cfg: &Config,
    cluster: Arc<dyn ClusterResolver>,
    metrics: Arc<Metrics>,
    drain: DrainWatcher,
    search_paths: watch::Receiver<Vec<Name>>,
    runner: Arc<dyn CommandRunner>,
    socket_factory: &dyn SocketFactory,
) -> Result<(), Error> {
    let integrator = Arc::new(ResolvedIntegrator::probe(runner.clone(), cfg.dns_interface.clone()).await?);

    // The fallback pool is used for names the cluster does not answer. No
    // routing rules exist on this path, so there is no loop to guard against,
    // but the server still needs a stable set of upstream conversations.
    let (upstream_ip, _) = resolve_upstream(cfg).await?;
    let pool = Arc::new(
        UdpPool::new(SocketAddr::new(upstream_ip, 53), cfg.pool_capacity)
            .await
            .map_err(Error::Dns)?,
    );
    let forwarder = Arc::new(UpstreamForwarder::new(pool.clone(), cfg.upstream_timeout));
    let publisher = Arc::new(DedupingPublisher::new(integrator.clone()));

    let (sub_trigger, sub_watcher) = drain::new();
    let server = Server::new(
        cfg.cluster_domain.clone(),
        cfg.dns_listen_addr,
        Vec::new(),
        cluster,
        forwarder,
        metrics,
        sub_watcher,
        socket_factory,
        search_paths,
        publisher,
    )
    .await
    .map_err(Error::Dns)?;

    let mut state = server.state();
    let udp_addr = server.udp_address();
    let server_done = tokio::spawn(server.run());

    let startup: Result<(), Error> = async {
        state
            .wait_for(|s| *s >= ServerState::Ready)
            .await
            .map_err(|_| Error::Dns(dns::Error::NeverReady))?;
        integrator.register(udp_addr).await?;
        Ok(())
    }
    .await;

    if let Err(e) = startup {
        sub_trigger.start_drain_and_wait().await;
        let _ = server_done.await;
        pool.close();
        return Err(e);
    }

    info!(
        interface = %integrator.interface(),
        address = %udp_addr,
        "registered local DNS server with the system resolver",
    );

    let blocker = drain.wait_for_drain().await;

    // Deregister first so queries return to the previous configuration, then
    // stop the listeners, then the pool.
    integrator.deregister().await;
    flush_dns_cache(runner.as_ref()).await;
    sub_trigger.start_drain_and_wait().await;
    let _ = server_done.await;
    pool.close();
    drop(blocker);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::RecordingRunner;

    #[tokio::test]
    async fn probe_without_interface_is_not_configured() {
        let runner = Arc::new(RecordingRunner::default());
        let res = ResolvedIntegrator::probe(runner.clone(), None).await;
        assert!(matches!(res, Err(Error::NotConfigured)));
        assert!(runner.commands().is_empty());
    }

    #[tokio::test]
    async fn probe_with_failing_resolvectl_is_not_configured() {
        let runner = Arc::new(RecordingRunner::failing_on("resolvectl"));
        let res = ResolvedIntegrator::probe(runner, Some("tun0".to_string())).await;
        assert!(matches!(res, Err(Error::NotConfigured)));
    }

    #[tokio::test]
    async fn register_and_publish_use_the_interface() {
        let runner = Arc::new(RecordingRunner::default());
        let integrator = ResolvedIntegrator::probe(runner.clone(), Some("tun0".to_string()))
            .await
            .unwrap();

        integrator
            .register("127.0.0.1:41953".parse().unwrap())
            .await
            .unwrap();
        integrator
            .publish(&[crate::test_helpers::dns::n("svc.cluster.local.")])
            .await
            .unwrap();
        integrator.deregister().await;

        let commands = runner.commands();
        assert!(commands.contains(&"resolvectl dns tun0 127.0.0.1:41953".to_string()));
        assert!(commands.contains(&"resolvectl domain tun0 svc.cluster.local.".to_string()));
        // publish flushes after registering the list
        let domain_pos = commands
            .iter()
            .position(|c| c.starts_with("resolvectl domain"))
            .unwrap();
        let flush_pos = commands
            .iter()
            .position(|c| c == "resolvectl flush-caches")
            .unwrap();
        assert!(flush_pos > domain_pos);
        assert!(commands.contains(&"resolvectl revert tun0".to_string()));
    }
}
