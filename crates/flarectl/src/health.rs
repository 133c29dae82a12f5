//! Node health classification.
//!
//! A node's health is judged from two signals: the link flag reported by the
//! cluster membership listing, and a direct reachability probe against the
//! node's address. The probe is a `PING` issued with an explicit timeout, so
//! a process that is alive but blocked (loading a dataset, swapping) is
//! distinguishable from one that is gone.

use std::fmt;

/// Exit status the probe reports when the command timed out rather than
/// failing outright (the coreutils `timeout` convention).
pub const EXIT_TIMEOUT: i32 = 124;

/// Health of a single node as seen by one query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    /// Membership link is up and the node answers probes.
    Connected,
    /// Membership link is down or the node refuses connections.
    Disconnected,
    /// Membership link is up but the direct probe timed out: the process is
    /// alive but unresponsive.
    Paused,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeStatus::Connected => write!(f, "connected"),
            NodeStatus::Disconnected => write!(f, "disconnected"),
            NodeStatus::Paused => write!(f, "paused"),
        }
    }
}

/// Classifies a probe's exit status.
///
/// `None` means the probe process was killed by our own deadline, which is
/// equivalent to the timeout exit status.
pub fn classify_probe_exit(code: Option<i32>) -> NodeStatus {
    match code {
        Some(0) => NodeStatus::Connected,
        Some(EXIT_TIMEOUT) | None => NodeStatus::Paused,
        Some(_) => NodeStatus::Disconnected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_is_connected() {
        assert_eq!(classify_probe_exit(Some(0)), NodeStatus::Connected);
    }

    #[test]
    fn timeout_status_is_paused() {
        assert_eq!(classify_probe_exit(Some(124)), NodeStatus::Paused);
    }

    #[test]
    fn killed_by_deadline_is_paused() {
        assert_eq!(classify_probe_exit(None), NodeStatus::Paused);
    }

    #[test]
    fn refused_is_disconnected() {
        assert_eq!(classify_probe_exit(Some(1)), NodeStatus::Disconnected);
        assert_eq!(classify_probe_exit(Some(255)), NodeStatus::Disconnected);
    }

    #[test]
    fn display_is_lowercase() {
        assert_eq!(NodeStatus::Connected.to_string(), "connected");
        assert_eq!(NodeStatus::Disconnected.to_string(), "disconnected");
        assert_eq!(NodeStatus::Paused.to_string(), "paused");
    }
}
