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

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const CLUSTER_DOMAIN: &str = "PODLINK_CLUSTER_DOMAIN";
const DNS_LISTEN_ADDR: &str = "PODLINK_DNS_ADDR";
const UPSTREAM_DNS: &str = "PODLINK_UPSTREAM_DNS";
const UPSTREAM_TIMEOUT: &str = "PODLINK_UPSTREAM_TIMEOUT";
const RESOLV_CONF_PATH: &str = "PODLINK_RESOLV_CONF";
const DNS_INTERFACE: &str = "PODLINK_DNS_INTERFACE";
const POOL_CAPACITY: &str = "PODLINK_POOL_CAPACITY";
const TERMINATION_GRACE_PERIOD: &str = "PODLINK_TERMINATION_GRACE_PERIOD";
const MOUNT_GRACE_PERIOD: &str = "PODLINK_MOUNT_GRACE_PERIOD";
const AGENT_IP_TIMEOUT: &str = "PODLINK_AGENT_IP_TIMEOUT";

const DEFAULT_CLUSTER_DOMAIN: &str = "cluster.local";
const DEFAULT_POOL_CAPACITY: usize = 10;
const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_TERMINATION_GRACE_PERIOD: Duration = Duration::from_secs(5);
const DEFAULT_MOUNT_GRACE_PERIOD: Duration = Duration::from_secs(3);
const DEFAULT_AGENT_IP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, serde::Serialize)]
pub struct Config {
    /// The DNS domain of the connected cluster.
    pub cluster_domain: String,

    /// Address the local DNS server binds to. Port 0 picks an ephemeral port;
    /// the routing layer learns the real port from the bound listener.
    pub dns_listen_addr: SocketAddr,

    /// The upstream resolver to fall back to for names the cluster does not
    /// answer. When unset, the first nameserver of the host resolver file is
    /// used.
    pub upstream_dns: Option<IpAddr>,

    /// Deadline for one fallback exchange with the upstream resolver.
    /// Deployments where the cluster DNS runs on the same host should lower
    /// this to a few hundred milliseconds.
    pub upstream_timeout: Duration,

    /// Host resolver file consulted for the upstream address and the search
    /// entries to strip.
    pub resolv_conf_path: PathBuf,

    /// Interface to register with the managed system resolver. When unset, the
    /// managed path is unavailable and the overriding server is used.
    pub dns_interface: Option<String>,

    /// Number of UDP sockets kept for fallback conversations with the
    /// upstream resolver.
    pub pool_capacity: usize,

    pub termination_grace_period: Duration,

    /// How long an unmount may take before it is abandoned.
    pub mount_grace_period: Duration,

    /// How long to wait for an agent to report a usable pod IP.
    pub agent_ip_timeout: Duration,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid env var {0}={1}")]
    EnvVar(String, String),
}

/// Builds the configuration from the process environment, falling back to the
/// documented defaults.
pub fn construct_config() -> Result<Config, Error> {
    Ok(Config {
        cluster_domain: parse_var(CLUSTER_DOMAIN)?
            .unwrap_or_else(|| DEFAULT_CLUSTER_DOMAIN.to_string()),
        dns_listen_addr: parse_var(DNS_LISTEN_ADDR)?
            .unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)),
        upstream_dns: parse_var(UPSTREAM_DNS)?,
        upstream_timeout: parse_var(UPSTREAM_TIMEOUT)?
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_UPSTREAM_TIMEOUT),
        resolv_conf_path: parse_var(RESOLV_CONF_PATH)?
            .unwrap_or_else(|| PathBuf::from("/etc/resolv.conf")),
        dns_interface: parse_var(DNS_INTERFACE)?,
        pool_capacity: parse_var(POOL_CAPACITY)?.unwrap_or(DEFAULT_POOL_CAPACITY),
        termination_grace_period: parse_var(TERMINATION_GRACE_PERIOD)?
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TERMINATION_GRACE_PERIOD),
        mount_grace_period: parse_var(MOUNT_GRACE_PERIOD)?
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_MOUNT_GRACE_PERIOD),
        agent_ip_timeout: parse_var(AGENT_IP_TIMEOUT)?
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_AGENT_IP_TIMEOUT),
    })
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cluster_domain: DEFAULT_CLUSTER_DOMAIN.to_string(),
            dns_listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            upstream_dns: None,
            upstream_timeout: DEFAULT_UPSTREAM_TIMEOUT,
            resolv_conf_path: PathBuf::from("/etc/resolv.conf"),
            dns_interface: None,
            pool_capacity: DEFAULT_POOL_CAPACITY,
            termination_grace_period: DEFAULT_TERMINATION_GRACE_PERIOD,
            mount_grace_period: DEFAULT_MOUNT_GRACE_PERIOD,
            agent_ip_timeout: DEFAULT_AGENT_IP_TIMEOUT,
        }
    }
}

fn parse_var<T: FromStr>(name: &str) -> Result<Option<T>, Error> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val
            .parse()
            .map(Some)
            .map_err(|_| Error::EnvVar(name.to_string(), val)),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = Config::default();
        assert_eq!("cluster.local", cfg.cluster_domain);
        assert_eq!(DEFAULT_POOL_CAPACITY, cfg.pool_capacity);
        assert_eq!(0, cfg.dns_listen_addr.port());
        assert!(cfg.dns_listen_addr.ip().is_loopback());
        assert!(cfg.upstream_dns.is_none());
    }

    #[test]
    fn parse_var_rejects_garbage() {
        std::env::set_var(POOL_CAPACITY, "not-a-number");
        let res = construct_config();
        std::env::remove_var(POOL_CAPACITY);
        assert!(matches!(res, Err(Error::EnvVar(_, _))));
    }
}
