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

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;

use hickory_proto::rr::Name;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::Config;
use crate::dns;
use crate::dns::resolvconf::ResolveFile;
use crate::dns::{ClusterResolver, Metrics, SearchPathPublisher};
use crate::drain::DrainWatcher;
use crate::routing::CommandRunner;
use crate::socket::SocketFactory;

pub mod overriding;
pub mod resolved;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The managed resolver service is absent or not in control of the host
    /// resolver. This is the only error that legitimately demotes the managed
    /// path to the overriding one.
    #[error("system resolver service is not configured")]
    NotConfigured,

    #[error("dns: {0}")]
    Dns(#[from] dns::Error),

    #[error("firewall: {0}")]
    Firewall(#[from] crate::routing::Error),
}

/// Binds the local DNS server into the host name-resolution stack and runs it
/// until drained. The managed-resolver variant is tried first; its
/// [Error::NotConfigured] sentinel is the only signal that demotes to the
/// overriding variant. Any other managed-path failure is real and propagates.
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
    match resolved::worker(
        cfg,
        cluster.clone(),
        metrics.clone(),
        drain.clone(),
        search_paths.clone(),
        runner.clone(),
        socket_factory,
    )
    .await
    {
        Err(Error::NotConfigured) => {
            info!("unable to use the managed resolver, falling back to the overriding server");
            overriding::worker(
                cfg,
                cluster,
                metrics,
                drain,
                search_paths,
                runner,
                socket_factory,
            )
            .await
        }
        other => other,
    }
}

/// Discovers the upstream resolver and the drop-suffixes from the host
/// resolver file. An explicitly configured upstream wins, but the search
/// entries are honored either way.
pub(crate) async fn resolve_upstream(cfg: &Config) -> Result<(IpAddr, Vec<Name>), Error> {
    let rf = ResolveFile::load(&cfg.resolv_conf_path)
        .await
        .map_err(dns::Error::Io)?;
    let upstream = match cfg.upstream_dns {
        Some(ip) => ip,
        None => {
            let ip = rf.first_nameserver().ok_or_else(|| {
                dns::Error::Config(format!(
                    "no nameserver entry in {}",
                    cfg.resolv_conf_path.display()
                ))
            })?;
            info!("automatically set upstream dns to {ip}");
            ip
        }
    };
    let drop_suffixes = rf
        .drop_suffixes()
        .iter()
        .filter_map(|s| Name::from_utf8(s).ok())
        .collect();
    Ok((upstream, drop_suffixes))
}

/// Flushes the OS level DNS cache. Best effort: not every host has one.
pub(crate) async fn flush_dns_cache(runner: &dyn CommandRunner) {
    if let Err(e) = runner
        .run("resolvectl", &["flush-caches".to_string()])
        .await
    {
        debug!("dns cache flush: {e}");
    }
}

/// Wraps a publisher and drops updates that only reorder the previously
/// published list.
pub struct DedupingPublisher {
    inner: Arc<dyn SearchPathPublisher>,
    last: tokio::sync::Mutex<Option<BTreeSet<Name>>>,
}

impl DedupingPublisher {
    pub fn new(inner: Arc<dyn SearchPathPublisher>) -> Self {
        Self {
            inner,
            last: tokio::sync::Mutex::new(None),
        }
    }
}

#[async_trait::async_trait]
impl SearchPathPublisher for DedupingPublisher {
    async fn publish(&self, paths: &[Name]) -> Result<(), dns::Error> {
        let set: BTreeSet<Name> = paths.iter().cloned().collect();
        let mut last = self.last.lock().await;
        if last.as_ref() == Some(&set) {
            debug!("search path update is a permutation of the current list, ignoring");
            return Ok(());
        }
        self.inner.publish(paths).await?;
        *last = Some(set);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::dns::{n, NoopPublisher};

    #[tokio::test]
    async fn permutations_are_not_republished() {
        let counted = Arc::new(NoopPublisher::default());
        let deduping = DedupingPublisher::new(counted.clone());

        deduping
            .publish(&[n("a.svc.cluster.local."), n("svc.cluster.local.")])
            .await
            .unwrap();
        deduping
            .publish(&[n("svc.cluster.local."), n("a.svc.cluster.local.")])
            .await
            .unwrap();
        assert_eq!(1, counted.published().len());

        deduping
            .publish(&[n("b.svc.cluster.local."), n("svc.cluster.local.")])
            .await
            .unwrap();
        assert_eq!(2, counted.published().len());
    }
}
