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

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::process::Command;
use tracing::debug;

/// Name of the chain podlink owns in the nat table. There is exactly one per
/// host; install and uninstall are its only writers.
pub const DNS_CHAIN: &str = "PODLINK_DNS";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} {args} exited with {status}: {stderr}")]
    Command {
        program: String,
        args: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
}

/// Seam for executing host network tools, so rule management can be exercised
/// in tests without CAP_NET_ADMIN.
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> Result<(), Error>;
}

#[derive(Default)]
pub struct HostCommandRunner;

#[async_trait::async_trait]
impl CommandRunner for HostCommandRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<(), Error> {
        debug!("{} {}", program, args.join(" "));
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|source| Error::Spawn {
                program: program.to_string(),
                source,
            })?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::Command {
                program: program.to_string(),
                args: args.join(" "),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

/// Owns the nat-table chain that steers DNS traffic into the local listener.
///
/// The chain holds one RETURN rule per pool source address, so the fallback
/// sockets reach the real upstream instead of being redirected back into the
/// local server, followed by the DNAT rule that performs the redirection.
pub struct NatRouter {
    runner: Arc<dyn CommandRunner>,
}

impl NatRouter {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn nat(&self, args: &[&str]) -> Result<(), Error> {
        let mut full: Vec<String> = vec!["-t".to_string(), "nat".to_string()];
        full.extend(args.iter().map(|s| s.to_string()));
        self.runner.run("iptables", &full).await
    }

    /// Installs the redirect chain. Any previous chain with the same name is
    /// torn down first, and a failed step removes whatever was created, so
    /// the OUTPUT hook never references a partially built chain.
    pub async fn install(
        &self,
        upstream: IpAddr,
        local_dns: SocketAddr,
        pool_addrs: &[SocketAddr],
    ) -> Result<(), Error> {
        self.uninstall().await;
        if let Err(e) = self.create_chain(upstream, local_dns, pool_addrs).await {
            self.uninstall().await;
            return Err(e);
        }
        Ok(())
    }

    async fn create_chain(
        &self,
        upstream: IpAddr,
        local_dns: SocketAddr,
        pool_addrs: &[SocketAddr],
    ) -> Result<(), Error> {
        self.nat(&["-N", DNS_CHAIN]).await?;

        // Let the pool sockets through to the original destination; without
        // these, their forwarded queries would loop back into the server.
        for addr in pool_addrs {
            let source = addr.ip().to_string();
            let sport = addr.port().to_string();
            self.nat(&[
                "-A", DNS_CHAIN, "-p", "udp", "--source", &source, "--sport", &sport, "-j",
                "RETURN",
            ])
            .await?;
        }

        // Redirect everything else aimed at the upstream resolver to the
        // local DNS server.
        let dest = format!("{upstream}/32");
        let to = local_dns.to_string();
        self.nat(&[
            "-A",
            DNS_CHAIN,
            "-p",
            "udp",
            "--dest",
            &dest,
            "--dport",
            "53",
            "-j",
            "DNAT",
            "--to-destination",
            &to,
        ])
        .await?;

        // Alter locally generated packets before routing.
        self.nat(&["-I", "OUTPUT", "1", "-j", DNS_CHAIN]).await
    }

    /// Removes the chain. Failures are logged only; during teardown there is
    /// nothing useful a caller can do with them.
    pub async fn uninstall(&self) {
        for args in [
            ["-D", "OUTPUT", "-j", DNS_CHAIN].as_slice(),
            &["-F", DNS_CHAIN],
            &["-X", DNS_CHAIN],
        ] {
            if let Err(e) = self.nat(args).await {
                debug!("firewall teardown: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::RecordingRunner;

    fn pool_addrs(n: u16) -> Vec<SocketAddr> {
        (0..n)
            .map(|i| format!("192.168.1.2:{}", 40000 + i).parse().unwrap())
            .collect()
    }

    #[tokio::test]
    async fn install_emits_expected_rules() {
        let runner = Arc::new(RecordingRunner::default());
        let router = NatRouter::new(runner.clone());

        router
            .install(
                "10.96.0.10".parse().unwrap(),
                "127.0.0.1:37123".parse().unwrap(),
                &pool_addrs(10),
            )
            .await
            .unwrap();

        let commands = runner.commands();
        // Teardown of any previous chain comes first.
        assert_eq!(
            commands[..3],
            [
                format!("iptables -t nat -D OUTPUT -j {DNS_CHAIN}"),
                format!("iptables -t nat -F {DNS_CHAIN}"),
                format!("iptables -t nat -X {DNS_CHAIN}"),
            ]
        );
        assert_eq!(format!("iptables -t nat -N {DNS_CHAIN}"), commands[3]);

        // One RETURN per pool address, in order.
        for (i, addr) in pool_addrs(10).iter().enumerate() {
            assert_eq!(
                format!(
                    "iptables -t nat -A {DNS_CHAIN} -p udp --source {} --sport {} -j RETURN",
                    addr.ip(),
                    addr.port()
                ),
                commands[4 + i]
            );
        }

        assert_eq!(
            format!(
                "iptables -t nat -A {DNS_CHAIN} -p udp --dest 10.96.0.10/32 --dport 53 \
                 -j DNAT --to-destination 127.0.0.1:37123"
            ),
            commands[14]
        );
        assert_eq!(
            format!("iptables -t nat -I OUTPUT 1 -j {DNS_CHAIN}"),
            commands[15]
        );
        assert_eq!(16, commands.len());
    }

    #[tokio::test]
    async fn failed_install_rolls_back() {
        let runner = Arc::new(RecordingRunner::failing_on("DNAT"));
        let router = NatRouter::new(runner.clone());

        let res = router
            .install(
                "10.96.0.10".parse().unwrap(),
                "127.0.0.1:37123".parse().unwrap(),
                &pool_addrs(2),
            )
            .await;
        assert!(res.is_err());

        let commands = runner.commands();
        // The OUTPUT hook was never linked to the chain.
        assert!(!commands
            .iter()
            .any(|c| c.contains(&format!("-I OUTPUT 1 -j {DNS_CHAIN}"))));
        // The rollback flushed and deleted the partially built chain.
        assert_eq!(
            commands[commands.len() - 3..],
            [
                format!("iptables -t nat -D OUTPUT -j {DNS_CHAIN}"),
                format!("iptables -t nat -F {DNS_CHAIN}"),
                format!("iptables -t nat -X {DNS_CHAIN}"),
            ]
        );
    }

    #[tokio::test]
    async fn uninstall_is_best_effort() {
        // Every command fails; uninstall must still run all three.
        let runner = Arc::new(RecordingRunner::failing_on("iptables"));
        let router = NatRouter::new(runner.clone());

        router.uninstall().await;
        assert_eq!(3, runner.commands().len());
    }

    #[tokio::test]
    async fn install_then_uninstall_leaves_no_trace() {
        let runner = Arc::new(RecordingRunner::default());
        let router = NatRouter::new(runner.clone());

        router
            .install(
                "10.96.0.10".parse().unwrap(),
                "127.0.0.1:37123".parse().unwrap(),
                &pool_addrs(1),
            )
            .await
            .unwrap();
        router.uninstall().await;

        // Every chain-creating command has a matching removal afterwards.
        let commands = runner.commands();
        let create_pos = commands
            .iter()
            .position(|c| c.contains(&format!("-N {DNS_CHAIN}")))
            .unwrap();
        let delete_pos = commands
            .iter()
            .rposition(|c| c.contains(&format!("-X {DNS_CHAIN}")))
            .unwrap();
        assert!(delete_pos > create_pos);
        let link_pos = commands
            .iter()
            .position(|c| c.contains(&format!("-I OUTPUT 1 -j {DNS_CHAIN}")))
            .unwrap();
        let unlink_pos = commands
            .iter()
            .rposition(|c| c.contains(&format!("-D OUTPUT -j {DNS_CHAIN}")))
            .unwrap();
        assert!(unlink_pos > link_pos);
    }
}
