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
use std::time::Duration;

use hickory_proto::error::ProtoErrorKind;
use hickory_proto::op::{Edns, Header, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::CNAME;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use hickory_server::authority::MessageResponseBuilder;
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};
use hickory_server::ServerFuture;
use tokio::sync::watch;
use tracing::{event, info, instrument, trace, warn};

use crate::dns::cache::{clamp_ttls, CachedAnswer, DnsCache, QueryKey, MAX_TTL};
use crate::dns::cluster::{ClusterAnswer, ClusterResolver};
use crate::dns::forwarder::UpstreamForwarder;
use crate::dns::metrics::{
    DnsLabels, DnsRequest, ForwardedDuration, ForwardedFailure, ForwardedRequest, Metrics,
};
use crate::dns::Error;
use crate::drain::DrainWatcher;
use crate::metrics::{DeferRecorder, IncrementRecorder, Recorder};
use crate::socket::SocketFactory;

const DEFAULT_TCP_REQUEST_TIMEOUT: u64 = 5;

/// Lifecycle of the DNS server, published on a watch channel. The routing
/// layer defers firewall changes until the listeners report [ServerState::Ready].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ServerState {
    Created,
    Starting,
    Ready,
    Stopping,
    Stopped,
}

/// Publishes search-path changes into the host resolution stack. The
/// implementation must make the change observable (including flushing any OS
/// level DNS cache) before returning.
#[async_trait::async_trait]
pub trait SearchPathPublisher: Send + Sync {
    async fn publish(&self, paths: &[Name]) -> Result<(), Error>;
}

/// A DNS server that answers cluster names through the cluster resolver and
/// forwards everything else to the originally configured upstream.
pub struct Server {
    tcp_addr: SocketAddr,
    udp_addr: SocketAddr,
    server: ServerFuture<QueryHandler>,
    state: watch::Sender<ServerState>,
    state_rx: watch::Receiver<ServerState>,
    drain: DrainWatcher,
    search_paths: watch::Receiver<Vec<Name>>,
    publisher: Arc<dyn SearchPathPublisher>,
}

impl Server {
    /// Binds the UDP and TCP listeners and prepares the serve loop. Bind
    /// failures are fatal; everything after this point is per-query.
    #[allow(clippy::too_many_arguments)] // no good way of grouping arguments here..
    pub async fn new(
        cluster_domain: String,
        address: SocketAddr,
        drop_suffixes: Vec<Name>,
        cluster: Arc<dyn ClusterResolver>,
        forwarder: Arc<UpstreamForwarder>,
        metrics: Arc<Metrics>,
        drain: DrainWatcher,
        socket_factory: &dyn SocketFactory,
        search_paths: watch::Receiver<Vec<Name>>,
        publisher: Arc<dyn SearchPathPublisher>,
    ) -> Result<Self, Error> {
        let store = Store::new(cluster_domain, drop_suffixes, cluster, forwarder, metrics);
        let mut server = ServerFuture::new(QueryHandler { store });

        info!(
            address=%address,
            component="dns",
            "starting local DNS server",
        );

        let tcp_listener = socket_factory
            .tcp_bind(address)
            .map_err(|e| Error::Bind(address, e))?;
        let tcp_addr = tcp_listener.local_addr()?;
        server.register_listener(
            tcp_listener,
            Duration::from_secs(DEFAULT_TCP_REQUEST_TIMEOUT),
        );

        let udp_socket = socket_factory
            .udp_bind(address)
            .map_err(|e| Error::Bind(address, e))?;
        let udp_addr = udp_socket
            .local_addr()
            .expect("bound udp socket must have a local address");
        server.register_socket(udp_socket);

        let (state, state_rx) = watch::channel(ServerState::Created);
        Ok(Self {
            tcp_addr,
            udp_addr,
            server,
            state,
            state_rx,
            drain,
            search_paths,
            publisher,
        })
    }

    /// Returns the address to which this DNS server is bound for TCP.
    pub fn tcp_address(&self) -> SocketAddr {
        self.tcp_addr
    }

    /// Returns the address to which this DNS server is bound for UDP.
    pub fn udp_address(&self) -> SocketAddr {
        self.udp_addr
    }

    /// Watch handle for the server lifecycle.
    pub fn state(&self) -> watch::Receiver<ServerState> {
        self.state_rx.clone()
    }

    /// Runs this DNS server to completion, pushing search-path changes into
    /// the OS integrator as they arrive.
    pub async fn run(mut self) {
        let _ = self.state.send(ServerState::Starting);

        let mut search_paths = self.search_paths.clone();
        // Publish whatever search list was current at startup; later changes
        // arrive through the select loop below.
        let initial = search_paths.borrow_and_update().clone();
        if !initial.is_empty() {
            if let Err(e) = self.publisher.publish(&initial).await {
                warn!("failed to publish initial search paths: {e}");
            }
        }

        let _ = self.state.send(ServerState::Ready);

        let mut search_open = true;
        loop {
            tokio::select! {
                res = self.server.block_until_done() => {
                    if let Err(e) = res {
                        match e.kind() {
                            ProtoErrorKind::NoError => (),
                            _ => warn!("DNS server shutdown error: {e}"),
                        }
                    }
                    break;
                }
                res = self.drain.clone().wait_for_drain() => {
                    info!("shutting down the DNS server");
                    let _ = self.state.send(ServerState::Stopping);
                    let _ = self.server.shutdown_gracefully().await;
                    drop(res);
                    break;
                }
                res = search_paths.changed(), if search_open => {
                    match res {
                        Ok(()) => {
                            let paths = search_paths.borrow_and_update().clone();
                            if let Err(e) = self.publisher.publish(&paths).await {
                                warn!("failed to publish search paths: {e}");
                            }
                        }
                        Err(_) => search_open = false,
                    }
                }
            }
        }
        let _ = self.state.send(ServerState::Stopped);
        info!("dns server drained");
    }
}

/// The lookup engine behind the server: classifies each query, answers
/// cluster names from the cluster resolver, and forwards the rest upstream.
/// Results are cached with single-flight coalescing per (name, type, class).
struct Store {
    cluster_domain: Name,
    drop_suffixes: Vec<Name>,
    cluster: Arc<dyn ClusterResolver>,
    forwarder: Arc<UpstreamForwarder>,
    cache: DnsCache,
    metrics: Arc<Metrics>,
}

impl Store {
    fn new(
        cluster_domain: String,
        drop_suffixes: Vec<Name>,
        cluster: Arc<dyn ClusterResolver>,
        forwarder: Arc<UpstreamForwarder>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let cluster_domain =
            Name::from_utf8(cluster_domain).expect("cluster domain must be a valid DNS name");
        Self {
            cluster_domain,
            drop_suffixes,
            cluster,
            forwarder,
            cache: DnsCache::new(),
            metrics,
        }
    }

    /// Strips the first matching drop-suffix from the requested name. These
    /// suffixes were inherited from an environment the cluster has never
    /// heard of, so they must not reach the cluster resolver.
    fn strip_drop_suffix(&self, name: &Name) -> Option<Name> {
        self.drop_suffixes
            .iter()
            .find_map(|suffix| strip_suffix(name, suffix))
    }

    /// A name is cluster-scoped when it is a bare single label or lies under
    /// the cluster domain.
    fn is_cluster_scoped(&self, name: &Name) -> bool {
        name.num_labels() == 1 || under_zone(name, &self.cluster_domain)
    }

    async fn resolve_uncached(
        &self,
        name: Name,
        rtype: RecordType,
        labels: DnsLabels,
    ) -> CachedAnswer {
        let stripped = self.strip_drop_suffix(&name);
        let cluster_name = stripped.clone().unwrap_or_else(|| name.clone());

        if self.is_cluster_scoped(&cluster_name) {
            match self.cluster.resolve(&cluster_name, rtype).await {
                Ok(ClusterAnswer::Answered(records)) => {
                    let mut out = Vec::new();
                    if let Some(stripped) = stripped {
                        // The cluster answered under the stripped name; glue
                        // it back to the name the client actually asked for.
                        out.push(cname_record(name.clone(), stripped));
                    }
                    out.extend(clamp_ttls(records));
                    return CachedAnswer {
                        records: out,
                        authoritative: true,
                        response_code: ResponseCode::NoError,
                    };
                }
                Ok(ClusterAnswer::NotFound) | Ok(ClusterAnswer::TryFallback) => {
                    trace!("cluster miss for {cluster_name}, using fallback");
                }
                Err(e) => {
                    warn!("cluster resolver failed for {cluster_name}: {e}");
                    return CachedAnswer::servfail();
                }
            }
        }

        // The fallback forwards the query as the client sent it, drop-suffix
        // and all; the upstream is the authority on those names.
        self.forward(name, rtype, labels).await
    }

    async fn forward(&self, name: Name, rtype: RecordType, labels: DnsLabels) -> CachedAnswer {
        self.metrics.increment(&ForwardedRequest(labels.clone()));

        // Record the forwarded request duration when the function exits.
        let duration_labels = labels.clone();
        let start = std::time::Instant::now();
        let _forwarded_duration = self.metrics.defer_record(move |metrics| {
            metrics.record(&ForwardedDuration(duration_labels), start.elapsed());
        });

        match self.forwarder.forward(&Query::query(name, rtype)).await {
            Ok(reply) => CachedAnswer {
                records: clamp_ttls(reply.answers().to_vec()),
                authoritative: false,
                response_code: reply.response_code(),
            },
            Err(e) => {
                self.metrics.increment(&ForwardedFailure(labels));
                warn!("upstream forward failed: {e}");
                CachedAnswer::servfail()
            }
        }
    }
}

fn access_log(request: &Request, result: &str, ep_count: usize) {
    let info = request.request_info();
    event!(
        target: "dns",
        parent: None,
        tracing::Level::DEBUG,

        src = %info.src,
        query = %info.query.query_type(),
        domain = %info.query.name(),

        result = result,
        endpoints = ep_count,
    );
}

impl Store {
    #[instrument(
        level = "debug",
        skip_all,
        fields(
            src=%request.src(),
            query=%request.request_info().query.query_type(),
            name=%request.request_info().query.name(),
        ),
    )]
    async fn lookup(&self, request: &Request) -> CachedAnswer {
        let query = request.request_info().query;
        let rtype = query.query_type();
        let name = Name::from(query.name().clone());
        let labels = DnsLabels::new(request);

        self.metrics.increment(&DnsRequest(labels.clone()));

        let key = QueryKey {
            name: name.clone(),
            rtype,
            class: query.query_class(),
        };
        let answer = self
            .cache
            .get_or_lookup(key, || self.resolve_uncached(name, rtype, labels))
            .await;

        if answer.response_code == ResponseCode::NoError {
            access_log(request, "success", answer.records.len());
        } else {
            access_log(request, &format!("failed ({})", answer.response_code), 0);
        }
        answer
    }
}

/// Hickory glue between the listeners and the [Store]. Every well-formed
/// query goes through the store; anything else is refused outright.
struct QueryHandler {
    store: Store,
}

#[async_trait::async_trait]
impl RequestHandler for QueryHandler {
    async fn handle_request<R: ResponseHandler>(
        &self,
        request: &Request,
        response_handle: R,
    ) -> ResponseInfo {
        let reply = match (request.message_type(), request.op_code()) {
            (MessageType::Query, OpCode::Query) => self.store.lookup(request).await,
            (MessageType::Query, op_code) => {
                warn!("refusing query with op code {op_code:?}");
                CachedAnswer::error(ResponseCode::NotImp)
            }
            (MessageType::Response, _) => {
                warn!("got a response as a request (id {})", request.id());
                CachedAnswer::error(ResponseCode::FormErr)
            }
        };
        send_reply(request, response_handle, reply).await
    }
}

/// Puts the reply on the wire. One path serves records and error codes
/// alike: the code rides in the header, error replies simply carry no
/// records. A failed send degrades to a bare SERVFAIL header.
async fn send_reply<R: ResponseHandler>(
    request: &Request,
    mut response_handle: R,
    reply: CachedAnswer,
) -> ResponseInfo {
    let mut header = Header::response_from_request(request.header());
    header.set_response_code(reply.response_code);
    header.set_authoritative(reply.authoritative);
    header.set_recursion_available(true);

    let mut builder = MessageResponseBuilder::from_message_request(request);
    // Echo EDNS so the client keeps its negotiated payload size.
    if let Some(req_edns) = request.edns() {
        let mut edns = Edns::new();
        edns.set_max_payload(req_edns.max_payload().max(512));
        edns.set_version(req_edns.version());
        edns.set_dnssec_ok(req_edns.dnssec_ok());
        builder.edns(edns);
    }

    let response = builder.build(
        header,
        reply.records.iter(),
        None.iter(),
        None.iter(),
        None.iter(),
    );
    match response_handle.send_response(response).await {
        Ok(info) => info,
        Err(e) => {
            warn!("failed to send DNS response: {e}");
            let mut failed = Header::new();
            failed.set_response_code(ResponseCode::ServFail);
            failed.into()
        }
    }
}

/// True when `name` lies strictly below `zone`: it has more labels than the
/// zone and the zone's labels form its tail.
fn under_zone(name: &Name, zone: &Name) -> bool {
    name.num_labels() > zone.num_labels() && zone.zone_of(name)
}

/// Cuts `suffix` off the tail of `name`. `None` when the name is not under
/// the suffix; a name equal to the suffix never strips down to the root.
fn strip_suffix(name: &Name, suffix: &Name) -> Option<Name> {
    if !under_zone(name, suffix) {
        return None;
    }
    let keep = (name.num_labels() - suffix.num_labels()) as usize;
    let mut stripped = Name::from_labels(name.iter().take(keep)).ok()?;
    stripped.set_fqdn(true);
    Some(stripped)
}

fn cname_record(name: Name, canonical_name: Name) -> Record {
    Record::from_rdata(name, MAX_TTL, RData::CNAME(CNAME(canonical_name)))
}
