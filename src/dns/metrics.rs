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

use std::time::Duration;

use hickory_server::server::Request;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::{Registry, Unit};

use crate::metrics::{DeferRecorder, Recorder};

pub struct Metrics {
    pub requests: Family<DnsLabels, Counter>,
    pub forwarded_requests: Family<DnsLabels, Counter>,
    pub forwarded_failures: Family<DnsLabels, Counter>,
    pub forwarded_duration: Family<DnsLabels, Histogram>,
}

impl Metrics {
    pub fn new(registry: &mut Registry) -> Self {
        let requests = Family::default();
        registry.register(
            "dns_requests",
            "Total number of DNS requests",
            requests.clone(),
        );

        let forwarded_requests = Family::default();
        registry.register(
            "dns_upstream_requests",
            "Total number of DNS requests forwarded to the upstream resolver",
            forwarded_requests.clone(),
        );

        let forwarded_failures = Family::default();
        registry.register(
            "dns_upstream_failures",
            "Total number of DNS requests that failed to forward upstream",
            forwarded_failures.clone(),
        );

        let forwarded_duration = Family::<DnsLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(vec![0.005f64, 0.001, 0.01, 0.1, 1.0, 5.0].into_iter())
        });
        registry.register_with_unit(
            "dns_upstream_request_duration",
            "Time taken to get a DNS response from the upstream resolver",
            Unit::Seconds,
            forwarded_duration.clone(),
        );

        Self {
            requests,
            forwarded_requests,
            forwarded_failures,
            forwarded_duration,
        }
    }
}

impl DeferRecorder for Metrics {}

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct DnsLabels {
    request_query_type: String,
    request_protocol: String,
}

impl DnsLabels {
    pub fn new(r: &Request) -> Self {
        let info = r.request_info();
        Self {
            request_query_type: info.query.query_type().to_string().to_lowercase(),
            request_protocol: info.protocol.to_string().to_lowercase(),
        }
    }
}

/// A DNS request of any kind.
pub struct DnsRequest(pub DnsLabels);

impl Recorder<DnsRequest, u64> for Metrics {
    fn record(&self, reason: &DnsRequest, count: u64) {
        self.requests.get_or_create(&reason.0).inc_by(count);
    }
}

/// A DNS request that was sent to the upstream resolver.
pub struct ForwardedRequest(pub DnsLabels);

impl Recorder<ForwardedRequest, u64> for Metrics {
    fn record(&self, reason: &ForwardedRequest, count: u64) {
        self.forwarded_requests.get_or_create(&reason.0).inc_by(count);
    }
}

/// A forwarded request that failed.
pub struct ForwardedFailure(pub DnsLabels);

impl Recorder<ForwardedFailure, u64> for Metrics {
    fn record(&self, reason: &ForwardedFailure, count: u64) {
        self.forwarded_failures.get_or_create(&reason.0).inc_by(count);
    }
}

/// Time spent waiting for the upstream resolver.
pub struct ForwardedDuration(pub DnsLabels);

impl Recorder<ForwardedDuration, Duration> for Metrics {
    fn record(&self, reason: &ForwardedDuration, duration: Duration) {
        self.forwarded_duration
            .get_or_create(&reason.0)
            .observe(duration.as_secs_f64());
    }
}
