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
use tracing::{debug, info};

use super::{flush_dns_cache, resolve_upstream, DedupingPublisher, Error};
use crate::config::Config;
use crate::dns;
use crate::dns::forwarder::UpstreamForwarder;
use crate::dns::pool::UdpPool;
use crate::dns::server::{SearchPathPublisher, Server, ServerState};
use crate::dns::{ClusterResolver, Metrics};
use crate::drain::{self, DrainWatcher};
use crate::routing::{CommandRunner, NatRouter};
use crate::socket::SocketFactory;

/// The overriding variant: no managed resolver exists, so DNS traffic aimed
/// at the configured upstream is NAT-redirected into the local server.
///
/// Startup order matters: the pool before the chain (the RETURN rules exempt
/// its source addresses), the chain only once the server is ready. Teardown
/// runs in reverse: chain, then listeners, then pool.
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
    // Nothing may touch the firewall until the resolver file has yielded a
    // usable upstream.
    let (upstream_ip, drop_suffixes) = resolve_upstream(cfg).await?;

    let pool = Arc::new(
        UdpPool::new(SocketAddr::new(upstream_ip, 53), cfg.pool_capacity)
            .await
            .map_err(Error::Dns)?,
    );
    let forwarder = Arc::new(UpstreamForwarder::new(pool.clone(), cfg.upstream_timeout));
    let publisher = Arc::new(DedupingPublisher::new(Arc::new(FlushingPublisher {
        runner: runner.clone(),
    })));

    let (sub_trigger, sub_watcher) = drain::new();
    let server = Server::new(
        cfg.cluster_domain.clone(),
        cfg.dns_listen_addr,
        drop_suffixes,
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
    let local_dns = server.udp_address();
    debug!("bootstrapping local DNS server on port {}", local_dns.port());
    let server_done = tokio::spawn(server.run());

    let router = NatRouter::new(runner.clone());
    let startup: Result<(), Error> = async {
        state
            .wait_for(|s| *s >= ServerState::Ready)
            .await
            .map_err(|_| Error::Dns(dns::Error::NeverReady))?;
        router
            .install(upstream_ip, local_dns, &pool.local_addrs())
            .await?;
        Ok(())
    }
    .await;

    if let Err(e) = startup {
        // install already rolled back; only the server and pool remain.
        sub_trigger.start_drain_and_wait().await;
        let _ = server_done.await;
        pool.close();
        return Err(e);
    }

    flush_dns_cache(runner.as_ref()).await;
    info!(
        upstream = %upstream_ip,
        address = %local_dns,
        "redirecting DNS traffic into the local server",
    );

    let blocker = drain.wait_for_drain().await;

    // Remove the chain first so new queries reach the real upstream, then
    // close the listeners, then the pool.
    router.uninstall().await;
    flush_dns_cache(runner.as_ref()).await;
    sub_trigger.start_drain_and_wait().await;
    let _ = server_done.await;
    pool.close();
    drop(blocker);
    Ok(())
}

/// In overriding mode there is no system service to hand the search list to;
/// the server consumes it internally and the only observable side effect is
/// an OS cache flush.
struct FlushingPublisher {
    runner: Arc<dyn CommandRunner>,
}

#[async_trait::async_trait]
impl SearchPathPublisher for FlushingPublisher {
    async fn publish(&self, _paths: &[Name]) -> Result<(), dns::Error> {
        flush_dns_cache(self.runner.as_ref()).await;
        Ok(())
    }
}
