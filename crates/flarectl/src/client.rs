//! Wrapper around the store's command-line client.
//!
//! All wire commands to the cluster (PING, CLUSTER NODES, CLUSTER FAILOVER,
//! CONFIG GET/SET, plus the cluster assembly calls) are issued through the
//! local `flare-cli` binary and parsed as line-oriented text. Every
//! invocation carries an explicit deadline; a probe that outlives it is
//! killed and reported as a timeout rather than hanging the caller.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::config::{Settings, Timing};
use crate::error::{Error, Result};
use crate::health::{classify_probe_exit, NodeStatus};
use crate::remote::ExecOutput;

/// Parses a `host:port` address.
pub fn parse_host_port(addr: &str) -> Result<(String, u16)> {
    let (host, port_str) = addr.rsplit_once(':').ok_or_else(|| {
        Error::Configuration(format!("invalid address '{addr}': expected host:port"))
    })?;
    let port: u16 = port_str.parse().map_err(|_| {
        Error::Configuration(format!("invalid address '{addr}': bad port '{port_str}'"))
    })?;
    if host.is_empty() {
        return Err(Error::Configuration(format!(
            "invalid address '{addr}': empty host"
        )));
    }
    Ok((host.to_string(), port))
}

/// Strips the quoting the client puts around bulk-string replies.
fn unquote(s: &str) -> &str {
    s.trim().trim_matches('"')
}

/// Handle on the local store client binary.
#[derive(Debug, Clone)]
pub struct StoreCli {
    bin: PathBuf,
    ping_timeout: Duration,
    nodes_timeout: Duration,
    ping_retries: u32,
    command_timeout: Duration,
}

impl StoreCli {
    pub fn new(settings: &Settings, timing: &Timing) -> Self {
        Self {
            bin: settings.cli_bin(),
            ping_timeout: timing.ping_timeout(),
            nodes_timeout: timing.nodes_timeout(),
            ping_retries: timing.ping_retries.max(1),
            command_timeout: Duration::from_secs(30),
        }
    }

    /// Runs the client against one node. `None` means the deadline expired
    /// and the child was killed.
    async fn invoke(
        &self,
        host: &str,
        port: u16,
        args: &[&str],
        deadline: Duration,
    ) -> std::io::Result<Option<ExecOutput>> {
        let mut cmd = Command::new(&self.bin);
        cmd.arg("-H")
            .arg(host)
            .arg("-p")
            .arg(port.to_string())
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        match tokio::time::timeout(deadline, cmd.output()).await {
            Ok(output) => {
                let output = output?;
                Ok(Some(ExecOutput {
                    status: output.status.code().unwrap_or(-1),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                }))
            }
            Err(_) => Ok(None),
        }
    }

    /// Like `invoke` but for commands that must succeed; a timeout or
    /// non-zero exit becomes an error carrying the node address.
    async fn invoke_checked(
        &self,
        host: &str,
        port: u16,
        args: &[&str],
    ) -> Result<ExecOutput> {
        let addr = format!("{host}:{port}");
        match self.invoke(host, port, args, self.command_timeout).await? {
            None => Err(Error::RemoteCommand {
                host: addr,
                status: crate::health::EXIT_TIMEOUT,
                stderr: "client timed out".into(),
            }),
            Some(out) if out.success() => Ok(out),
            Some(out) => Err(Error::RemoteCommand {
                host: addr,
                status: out.status,
                stderr: out.stderr.trim().to_string(),
            }),
        }
    }

    /// Probes reachability of one node address.
    ///
    /// Retried a few times before settling so a transient network blip is
    /// not misclassified as node failure. The final attempt's classification
    /// wins: exit 0 is connected, a timeout is paused, anything else is
    /// disconnected.
    pub async fn ping(&self, addr: &str) -> NodeStatus {
        let Ok((host, port)) = parse_host_port(addr) else {
            return NodeStatus::Disconnected;
        };
        let mut status = NodeStatus::Disconnected;
        for attempt in 1..=self.ping_retries {
            status = match self.invoke(&host, port, &["ping"], self.ping_timeout).await {
                Ok(Some(out)) => classify_probe_exit(Some(out.status)),
                Ok(None) => classify_probe_exit(None),
                Err(e) => {
                    debug!(addr, error = %e, "ping invocation failed");
                    NodeStatus::Disconnected
                }
            };
            debug!(addr, attempt, %status, "ping");
            if status == NodeStatus::Connected {
                break;
            }
        }
        status
    }

    /// Fetches the raw membership listing from one node, or `None` when the
    /// node is unreachable, times out, or answers with nothing usable.
    pub async fn cluster_nodes(&self, host: &str, port: u16) -> Option<String> {
        match self
            .invoke(host, port, &["cluster", "nodes"], self.nodes_timeout)
            .await
        {
            Ok(Some(out)) if out.success() && !out.stdout.trim().is_empty() => Some(out.stdout),
            Ok(_) => None,
            Err(e) => {
                debug!(host, port, error = %e, "cluster nodes invocation failed");
                None
            }
        }
    }

    /// Asks one node for its cluster node id.
    pub async fn node_id(&self, host: &str, port: u16) -> Result<String> {
        let out = self.invoke_checked(host, port, &["cluster", "myid"]).await?;
        let id = unquote(&out.stdout).to_string();
        if id.is_empty() {
            return Err(Error::RemoteCommand {
                host: format!("{host}:{port}"),
                status: 0,
                stderr: "empty node id".into(),
            });
        }
        Ok(id)
    }

    /// Forms the initial cluster from the master addresses, spreading the
    /// hash slots evenly. Replication is handled separately.
    pub async fn cluster_create(&self, targets: &[(String, u16)]) -> Result<()> {
        let (first_host, first_port) = targets
            .first()
            .ok_or_else(|| Error::Configuration("no master nodes to create from".into()))?;
        let addrs: Vec<String> = targets
            .iter()
            .map(|(host, port)| format!("{host}:{port}"))
            .collect();
        let mut args = vec!["cluster", "create"];
        args.extend(addrs.iter().map(String::as_str));
        self.invoke_checked(first_host, *first_port, &args).await?;
        Ok(())
    }

    /// Attaches one slave to one master.
    pub async fn replicate(
        &self,
        master_host: &str,
        master_port: u16,
        slave_host: &str,
        slave_port: u16,
    ) -> Result<()> {
        let master_id = self.node_id(master_host, master_port).await?;
        self.invoke_checked(slave_host, slave_port, &["cluster", "replicate", &master_id])
            .await?;
        Ok(())
    }

    /// Sends the failover command directly to a slave node.
    pub async fn failover(&self, addr: &str, takeover: bool) -> Result<String> {
        let (host, port) = parse_host_port(addr)?;
        let mut args = vec!["cluster", "failover"];
        if takeover {
            args.push("takeover");
        }
        let out = self.invoke_checked(&host, port, &args).await?;
        Ok(out.stdout.trim().to_string())
    }

    /// CONFIG GET against one node; `None` when the key is unknown.
    pub async fn config_get(&self, addr: &str, key: &str) -> Result<Option<String>> {
        let (host, port) = parse_host_port(addr)?;
        let out = self
            .invoke_checked(&host, port, &["config", "get", key])
            .await?;
        // reply is a key/value listing; the value follows the key line
        let mut lines = out.stdout.lines().map(unquote);
        match lines.find(|line| line.eq_ignore_ascii_case(key)) {
            Some(_) => Ok(lines.next().map(|v| v.to_string())),
            None => Ok(None),
        }
    }

    /// CONFIG SET against one node; true when the node acknowledged.
    pub async fn config_set(
        &self,
        host: &str,
        port: u16,
        key: &str,
        value: &str,
    ) -> Result<bool> {
        let out = self
            .invoke_checked(host, port, &["config", "set", key, value])
            .await?;
        Ok(out.stdout.trim() == "OK")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_host_port_simple() {
        assert_eq!(
            parse_host_port("127.0.0.1:18100").unwrap(),
            ("127.0.0.1".into(), 18100)
        );
    }

    #[test]
    fn parse_host_port_hostname() {
        assert_eq!(
            parse_host_port("node1.example.com:6379").unwrap(),
            ("node1.example.com".into(), 6379)
        );
    }

    #[test]
    fn parse_host_port_invalid() {
        assert!(parse_host_port("no-port").is_err());
        assert!(parse_host_port("host:abc").is_err());
        assert!(parse_host_port(":18100").is_err());
    }

    #[test]
    fn unquote_strips_bulk_quoting() {
        assert_eq!(unquote("\"abc123\"\n"), "abc123");
        assert_eq!(unquote("plain"), "plain");
    }
}
