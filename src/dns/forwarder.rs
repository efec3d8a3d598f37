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
use std::time::{Duration, Instant};

use hickory_proto::op::{Message, MessageType, OpCode, Query};
use tracing::debug;

use super::pool::UdpPool;
use super::Error;

/// Forwards queries the cluster cannot answer to the originally configured
/// upstream resolver, over a pooled socket whose source address the routing
/// chain exempts from redirection.
pub struct UpstreamForwarder {
    pool: Arc<UdpPool>,
    timeout: Duration,
}

impl UpstreamForwarder {
    pub fn new(pool: Arc<UdpPool>, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    /// Performs one query/reply exchange with the upstream. The kernel and
    /// the client own retries; this layer sends exactly once and waits out
    /// the deadline.
    pub async fn forward(&self, query: &Query) -> Result<Message, Error> {
        let sock = self.pool.acquire().await?;

        let id: u16 = rand::random();
        let mut msg = Message::new();
        msg.set_id(id)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true)
            .add_query(query.clone());
        sock.send(&msg.to_vec()?).await?;

        let deadline = Instant::now() + self.timeout;
        let mut buf = [0u8; 4096];
        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or(Error::UpstreamTimeout)?;
            let n = tokio::time::timeout(remaining, sock.recv(&mut buf))
                .await
                .map_err(|_| Error::UpstreamTimeout)??;
            match Message::from_vec(&buf[..n]) {
                Ok(reply) if reply.id() == id => return Ok(reply),
                // A reply to an earlier conversation on this socket.
                Ok(stale) => debug!("dropping stale upstream reply (id {})", stale.id()),
                Err(e) => debug!("dropping malformed upstream packet: {e}"),
            }
        }
    }
}
