//! Error types for orchestrator operations.
//!
//! Every failure an operator can hit maps to one variant here, so status
//! tables and exit paths can render a specific cause instead of a generic
//! "remote call failed".

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving a cluster.
#[derive(Debug, Error)]
pub enum Error {
    /// The host name did not resolve.
    #[error("unknown host: {host}")]
    UnknownHost { host: String },

    /// The SSH connection to the host could not be established.
    #[error("host unreachable: {host}")]
    HostUnreachable { host: String },

    /// The remote shell rejected our credentials.
    #[error("ssh authentication failed for {host}")]
    Authentication { host: String },

    /// A remote command exited with an unexpected status.
    #[error("remote command failed on {host} (exit {status}): {stderr}")]
    RemoteCommand {
        host: String,
        status: i32,
        stderr: String,
    },

    /// The observed process count never converged within the retry budget.
    #[error(
        "process count did not converge: {observed}/{expected} alive after {attempts} attempts"
    )]
    ClusterHealth {
        expected: usize,
        observed: usize,
        attempts: u32,
    },

    /// No node answered the cluster membership query.
    #[error("no node answered the membership query; cluster is unreachable")]
    NoQuorum,

    /// A master has no connected slave to fail over to.
    #[error("master {master} has no alive slave")]
    NoEligibleSlave { master: String },

    /// Unknown cluster id, missing template, or a malformed settings file.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Requested ports are already bound on remote hosts.
    #[error("ports already in use: {}", format_conflicts(.0))]
    PortConflict(Vec<(String, u16)>),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn format_conflicts(conflicts: &[(String, u16)]) -> String {
    let parts: Vec<String> = conflicts
        .iter()
        .map(|(host, port)| format!("{host}:{port}"))
        .collect();
    parts.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_conflict_lists_every_pair() {
        let err = Error::PortConflict(vec![
            ("node1".into(), 18100),
            ("node2".into(), 18101),
        ]);
        assert_eq!(
            err.to_string(),
            "ports already in use: node1:18100, node2:18101"
        );
    }

    #[test]
    fn remote_command_keeps_exit_code_and_stderr() {
        let err = Error::RemoteCommand {
            host: "node1".into(),
            status: 127,
            stderr: "command not found".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("127"));
        assert!(msg.contains("command not found"));
    }

    #[test]
    fn cluster_health_reports_counts() {
        let err = Error::ClusterHealth {
            expected: 8,
            observed: 5,
            attempts: 10,
        };
        assert_eq!(
            err.to_string(),
            "process count did not converge: 5/8 alive after 10 attempts"
        );
    }
}
