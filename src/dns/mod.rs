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

pub mod cache;
pub mod cluster;
pub mod forwarder;
pub mod metrics;
pub mod pool;
pub mod resolvconf;
pub mod server;

pub use cluster::{ClusterAnswer, ClusterResolver};
pub use metrics::Metrics;
pub use server::{SearchPathPublisher, Server, ServerState};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to bind to address {0}: {1}")]
    Bind(SocketAddr, std::io::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid resolver configuration: {0}")]
    Config(String),

    #[error("protocol error: {0}")]
    Proto(#[from] hickory_proto::error::ProtoError),

    #[error("upstream lookup timed out")]
    UpstreamTimeout,

    #[error("connection pool is closed")]
    PoolClosed,

    #[error("dns server exited before becoming ready")]
    NeverReady,

    #[error("cluster resolver failure: {0}")]
    Cluster(String),
}
