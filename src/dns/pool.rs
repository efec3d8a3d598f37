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
use std::ops::Deref;
use std::sync::{Arc, Mutex};

use tokio::net::UdpSocket;
use tokio::sync::Semaphore;

use super::Error;

/// A fixed-size pool of UDP sockets connected to the upstream resolver.
///
/// All sockets are bound at construction time: the routing chain exempts
/// fallback traffic by the pool's source addresses, so the full set must be
/// known before the chain is installed and must not change afterwards.
pub struct UdpPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    idle: Mutex<Vec<Arc<UdpSocket>>>,
    permits: Semaphore,
    local_addrs: Vec<SocketAddr>,
}

impl UdpPool {
    pub async fn new(upstream: SocketAddr, cap: usize) -> Result<Self, Error> {
        let bind_addr: SocketAddr = if upstream.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };

        let mut idle = Vec::with_capacity(cap);
        let mut local_addrs = Vec::with_capacity(cap);
        for _ in 0..cap {
            let sock = UdpSocket::bind(bind_addr).await?;
            sock.connect(upstream).await?;
            local_addrs.push(sock.local_addr()?);
            idle.push(Arc::new(sock));
        }

        Ok(Self {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(idle),
                permits: Semaphore::new(cap),
                local_addrs,
            }),
        })
    }

    /// Local `IP:port` of every socket in the pool.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.inner.local_addrs.clone()
    }

    /// Takes a socket out of the pool, waiting when all of them are in use.
    /// Fails with [Error::PoolClosed] when the pool is closed, including while
    /// the caller is blocked waiting.
    pub async fn acquire(&self) -> Result<PooledSocket, Error> {
        let permit = self
            .inner
            .permits
            .acquire()
            .await
            .map_err(|_| Error::PoolClosed)?;
        permit.forget();
        let sock = self
            .inner
            .idle
            .lock()
            .unwrap()
            .pop()
            .expect("a semaphore permit guarantees an idle socket");
        Ok(PooledSocket {
            sock: Some(sock),
            pool: self.inner.clone(),
        })
    }

    /// Closes the pool. Blocked and future acquires fail; idle sockets are
    /// dropped now, sockets handed out are dropped when their guard returns.
    pub fn close(&self) {
        self.inner.permits.close();
        self.inner.idle.lock().unwrap().clear();
    }
}

/// A socket borrowed from the pool, returned on drop.
pub struct PooledSocket {
    sock: Option<Arc<UdpSocket>>,
    pool: Arc<PoolInner>,
}

impl Deref for PooledSocket {
    type Target = UdpSocket;

    fn deref(&self) -> &Self::Target {
        self.sock.as_ref().expect("socket present until drop")
    }
}

impl Drop for PooledSocket {
    fn drop(&mut self) {
        let sock = self.sock.take().expect("socket present until drop");
        if !self.pool.permits.is_closed() {
            self.pool.idle.lock().unwrap().push(sock);
            self.pool.permits.add_permits(1);
        }
    }
}
