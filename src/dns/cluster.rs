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

use hickory_proto::rr::{Name, Record, RecordType};

use super::Error;

/// Outcome of a cluster-side lookup.
#[derive(Debug)]
pub enum ClusterAnswer {
    /// The cluster knows the name; these records answer it.
    Answered(Vec<Record>),
    /// The cluster authoritatively does not know the name.
    NotFound,
    /// The name is clearly not cluster-scoped; the caller should use its
    /// fallback path without waiting for the cluster.
    TryFallback,
}

/// The RPC boundary to the in-cluster resolver. How the query reaches the
/// cluster (and over what transport) is not this crate's concern.
#[async_trait::async_trait]
pub trait ClusterResolver: Send + Sync {
    async fn resolve(&self, name: &Name, rtype: RecordType) -> Result<ClusterAnswer, Error>;
}
