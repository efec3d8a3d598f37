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

use tokio::net::{TcpListener, UdpSocket};

/// Seam for constructing the sockets the DNS server listens on, so tests can
/// substitute loopback binds or inspect the addresses handed out.
pub trait SocketFactory: Send + Sync {
    fn tcp_bind(&self, addr: SocketAddr) -> std::io::Result<TcpListener>;

    fn udp_bind(&self, addr: SocketAddr) -> std::io::Result<UdpSocket>;
}

#[derive(Clone, Copy, Default)]
pub struct DefaultSocketFactory;

impl SocketFactory for DefaultSocketFactory {
    fn tcp_bind(&self, addr: SocketAddr) -> std::io::Result<TcpListener> {
        let std_sock = std::net::TcpListener::bind(addr)?;
        std_sock.set_nonblocking(true)?;
        TcpListener::from_std(std_sock)
    }

    fn udp_bind(&self, addr: SocketAddr) -> std::io::Result<UdpSocket> {
        let std_sock = std::net::UdpSocket::bind(addr)?;
        std_sock.set_nonblocking(true)?;
        UdpSocket::from_std(std_sock)
    }
}
