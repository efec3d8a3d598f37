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

use std::sync::{Arc, Mutex, Once};

use prometheus_client::registry::Registry;

use crate::routing::{CommandRunner, Error as RoutingError};

static INIT: Once = Once::new();

/// Installs a test subscriber once; later calls are no-ops.
pub fn initialize_telemetry() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn test_metrics() -> Arc<crate::dns::Metrics> {
    let mut registry = Registry::default();
    let sub = crate::metrics::sub_registry(&mut registry);
    Arc::new(crate::dns::Metrics::new(sub))
}

/// Records every command instead of running it, optionally failing commands
/// whose rendered form contains a chosen pattern.
#[derive(Default)]
pub struct RecordingRunner {
    commands: Mutex<Vec<String>>,
    fail_on: Option<&'static str>,
}

impl RecordingRunner {
    pub fn failing_on(pattern: &'static str) -> Self {
        Self {
            commands: Mutex::new(Vec::new()),
            fail_on: Some(pattern),
        }
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<(), RoutingError> {
        let line = format!("{} {}", program, args.join(" "));
        self.commands.lock().unwrap().push(line.clone());
        if let Some(pattern) = self.fail_on {
            if line.contains(pattern) {
                #[cfg(unix)]
                use std::os::unix::process::ExitStatusExt;
                return Err(RoutingError::Command {
                    program: program.to_string(),
                    args: args.join(" "),
                    status: std::process::ExitStatus::from_raw(256),
                    stderr: "injected failure".to_string(),
                });
            }
        }
        Ok(())
    }
}

pub mod dns {
    use std::collections::HashMap;
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
    use std::sync::Mutex;

    use hickory_client::client::{AsyncClient, ClientHandle};
    use hickory_proto::iocompat::AsyncIoTokioAsStd;
    use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
    use hickory_proto::rr::rdata::{A, AAAA, CNAME};
    use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
    use hickory_proto::tcp::TcpClientStream;
    use hickory_proto::udp::UdpClientStream;
    use hickory_proto::xfer::DnsResponse;
    use tokio::net::{TcpStream, UdpSocket};

    use crate::dns::cluster::{ClusterAnswer, ClusterResolver};
    use crate::dns::server::SearchPathPublisher;

    const TTL: u32 = 30;

    /// A short-hand helper for constructing a [Name].
    pub fn n<S: AsRef<str>>(name: S) -> Name {
        Name::from_utf8(name).unwrap()
    }

    /// Creates an A record for the name and IP.
    pub fn a(name: Name, addr: Ipv4Addr) -> Record {
        Record::from_rdata(name, TTL, RData::A(A(addr)))
    }

    /// Creates an AAAA record for the name and IP.
    pub fn aaaa(name: Name, addr: Ipv6Addr) -> Record {
        Record::from_rdata(name, TTL, RData::AAAA(AAAA(addr)))
    }

    /// Creates a CNAME record for the given canonical name.
    pub fn cname(name: Name, canonical_name: Name) -> Record {
        Record::from_rdata(name, TTL, RData::CNAME(CNAME(canonical_name)))
    }

    /// Helper for parsing an [Ipv4Addr] string.
    pub fn ipv4<S: AsRef<str>>(addr: S) -> Ipv4Addr {
        addr.as_ref().parse().unwrap()
    }

    /// Creates a new DNS client with a TCP connection to the given nameserver.
    pub async fn new_tcp_client(addr: SocketAddr) -> AsyncClient {
        let (stream, sender) = TcpClientStream::<AsyncIoTokioAsStd<TcpStream>>::new(addr);
        let (client, bg) = AsyncClient::new(stream, sender, None).await.unwrap();

        // Run the client exchange in the background.
        tokio::spawn(bg);

        client
    }

    /// Creates a new DNS client with a UDP connection to the given nameserver.
    pub async fn new_udp_client(addr: SocketAddr) -> AsyncClient {
        let stream = UdpClientStream::<UdpSocket>::new(addr);
        let (client, bg) = AsyncClient::connect(stream).await.unwrap();

        // Run the client exchange in the background.
        tokio::spawn(bg);

        client
    }

    /// Sends a request via the client.
    pub async fn send_request<C: ClientHandle>(
        client: &mut C,
        name: Name,
        rr_type: RecordType,
    ) -> DnsResponse {
        client.query(name, DNSClass::IN, rr_type).await.unwrap()
    }

    /// Runs a bare-bones upstream DNS responder on an ephemeral UDP port and
    /// returns its address. Names absent from `records` yield NXDOMAIN.
    pub async fn run_upstream_dns(records: HashMap<Name, Vec<IpAddr>>) -> SocketAddr {
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = sock.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                let Ok((len, peer)) = sock.recv_from(&mut buf).await else {
                    return;
                };
                let Ok(query) = Message::from_vec(&buf[..len]) else {
                    continue;
                };

                let mut response = Message::new();
                response
                    .set_id(query.id())
                    .set_message_type(MessageType::Response)
                    .set_op_code(OpCode::Query)
                    .set_recursion_desired(query.recursion_desired())
                    .set_recursion_available(true);

                if let Some(q) = query.queries().first() {
                    response.add_query(q.clone());
                    match records.get(q.name()) {
                        Some(ips) => {
                            for ip in ips {
                                match (ip, q.query_type()) {
                                    (IpAddr::V4(v4), RecordType::A) => {
                                        response.add_answer(a(q.name().clone(), *v4));
                                    }
                                    (IpAddr::V6(v6), RecordType::AAAA) => {
                                        response.add_answer(aaaa(q.name().clone(), *v6));
                                    }
                                    _ => {}
                                }
                            }
                        }
                        None => {
                            response.set_response_code(ResponseCode::NXDomain);
                        }
                    }
                }

                let Ok(bytes) = response.to_vec() else {
                    continue;
                };
                let _ = sock.send_to(&bytes, peer).await;
            }
        });
        addr
    }

    /// In-memory cluster resolver that records every name it was asked for.
    /// Records are handed out with a deliberately large TTL so clamping is
    /// observable.
    pub struct FakeClusterResolver {
        records: HashMap<Name, Vec<IpAddr>>,
        seen: Mutex<Vec<Name>>,
    }

    impl FakeClusterResolver {
        pub fn new(records: HashMap<Name, Vec<IpAddr>>) -> Self {
            Self {
                records,
                seen: Mutex::new(Vec::new()),
            }
        }

        pub fn seen(&self) -> Vec<Name> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl ClusterResolver for FakeClusterResolver {
        async fn resolve(
            &self,
            name: &Name,
            rtype: RecordType,
        ) -> Result<ClusterAnswer, crate::dns::Error> {
            self.seen.lock().unwrap().push(name.clone());
            match self.records.get(name) {
                Some(ips) => {
                    let mut out = Vec::new();
                    for ip in ips {
                        match (ip, rtype) {
                            (IpAddr::V4(v4), RecordType::A) => {
                                out.push(Record::from_rdata(name.clone(), 300, RData::A(A(*v4))));
                            }
                            (IpAddr::V6(v6), RecordType::AAAA) => {
                                out.push(Record::from_rdata(
                                    name.clone(),
                                    300,
                                    RData::AAAA(AAAA(*v6)),
                                ));
                            }
                            _ => {}
                        }
                    }
                    Ok(ClusterAnswer::Answered(out))
                }
                None => Ok(ClusterAnswer::NotFound),
            }
        }
    }

    /// Publisher that only records what was published.
    #[derive(Default)]
    pub struct NoopPublisher {
        published: Mutex<Vec<Vec<Name>>>,
    }

    impl NoopPublisher {
        pub fn published(&self) -> Vec<Vec<Name>> {
            self.published.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl SearchPathPublisher for NoopPublisher {
        async fn publish(&self, paths: &[Name]) -> Result<(), crate::dns::Error> {
            self.published.lock().unwrap().push(paths.to_vec());
            Ok(())
        }
    }
}
