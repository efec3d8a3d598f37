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

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{copy_bidirectional, AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{debug, error, warn};

use super::PortMapping;
use crate::drain::DrainWatcher;

pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Opens a stream to a port on a pod. This is the pluggable cluster proxy;
/// how the bytes reach the cluster is not this crate's concern.
#[async_trait::async_trait]
pub trait ClusterDialer: Send + Sync {
    async fn dial(&self, pod_ip: IpAddr, port: u16) -> std::io::Result<Box<dyn AsyncStream>>;
}

/// Serves one local port forward until drained. Failures log and return, so
/// the worker count always winds down to zero.
pub(crate) async fn worker_port_forward(
    dialer: std::sync::Arc<dyn ClusterDialer>,
    pod_ip: IpAddr,
    mapping: PortMapping,
    drain: DrainWatcher,
) {
    let listen: SocketAddr = match pod_ip {
        IpAddr::V4(_) => (Ipv4Addr::LOCALHOST, mapping.local).into(),
        IpAddr::V6(_) => (Ipv6Addr::LOCALHOST, mapping.local).into(),
    };
    let listener = match TcpListener::bind(listen).await {
        Ok(l) => l,
        Err(e) => {
            error!("port-forward listener {listen}: {e}");
            return;
        }
    };
    debug!("forwarding {listen} -> {pod_ip}:{}", mapping.pod);

    let drained = drain.clone().wait_for_drain();
    tokio::pin!(drained);

    loop {
        tokio::select! {
            res = listener.accept() => {
                match res {
                    Ok((mut conn, peer)) => {
                        let dialer = dialer.clone();
                        let pod_port = mapping.pod;
                        let conn_drain = drain.clone();
                        tokio::spawn(async move {
                            let relay = async {
                                match dialer.dial(pod_ip, pod_port).await {
                                    Ok(mut upstream) => {
                                        if let Err(e) = copy_bidirectional(&mut conn, &mut upstream).await {
                                            debug!(%peer, "port-forward stream ended: {e}");
                                        }
                                    }
                                    Err(e) => warn!("failed to dial pod {pod_ip}:{pod_port}: {e}"),
                                }
                            };
                            tokio::select! {
                                _ = relay => {}
                                _ = conn_drain.wait_for_drain() => {}
                            }
                        });
                    }
                    Err(e) => {
                        warn!("accept failed on {listen}: {e}");
                        return;
                    }
                }
            }
            _ = &mut drained => {
                debug!("port-forward {listen} cancelled");
                return;
            }
        }
    }
}
