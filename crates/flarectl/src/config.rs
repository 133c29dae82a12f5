//! Settings file parsing and the remote filesystem layout.
//!
//! All topology comes from a TOML settings file: cluster definitions keyed by
//! cluster id, retry/backoff knobs, and SSH options. Nothing here talks to
//! the network; the rest of the crate takes these values as plain data.
//!
//! Resolution order for the active cluster: `--cluster` flag, then the
//! `default_cluster` key in the settings file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Top-level settings loaded from `flarectl.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Cluster id used when `--cluster` is not given.
    pub default_cluster: String,
    /// Per-cluster topology definitions keyed by cluster id.
    pub clusters: BTreeMap<String, ClusterSpec>,
    /// Retry/backoff knobs shared by every operation.
    pub timing: Timing,
    /// Remote shell options.
    pub ssh: SshSettings,
    /// Path of the store's command-line client on this machine.
    pub cli_bin: Option<PathBuf>,
}

impl Settings {
    /// Loads settings from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        toml::from_str(&content).map_err(|e| {
            Error::Configuration(format!("cannot parse {}: {e}", path.display()))
        })
    }

    /// Looks up a cluster definition by id.
    pub fn cluster(&self, id: &str) -> Result<&ClusterSpec> {
        self.clusters
            .get(id)
            .ok_or_else(|| Error::Configuration(format!("unknown cluster id '{id}'")))
    }

    /// Path of the local `flare-cli` binary, defaulting to PATH lookup.
    pub fn cli_bin(&self) -> PathBuf {
        self.cli_bin
            .clone()
            .unwrap_or_else(|| PathBuf::from("flare-cli"))
    }
}

/// Topology and layout for one cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSpec {
    /// Hosts serving every master port.
    pub master_hosts: Vec<String>,
    /// Hosts serving every slave port.
    pub slave_hosts: Vec<String>,
    /// Ports every master host listens on.
    pub master_ports: Vec<u16>,
    /// Ports every slave host listens on.
    pub slave_ports: Vec<u16>,
    /// Root of the flare installation on every remote host.
    pub base_dir: PathBuf,
    /// Prefix for per-device data mounts, e.g. `/nvme/data`.
    pub data_dir_prefix: String,
    /// Number of data devices per host. Ports are spread across devices by
    /// `port mod device_count`.
    pub device_count: u16,
}

impl Default for ClusterSpec {
    fn default() -> Self {
        Self {
            master_hosts: Vec::new(),
            slave_hosts: Vec::new(),
            master_ports: Vec::new(),
            slave_ports: Vec::new(),
            base_dir: PathBuf::from("/opt/flare"),
            data_dir_prefix: "/nvme/data".into(),
            device_count: 1,
        }
    }
}

/// Retry and backoff knobs.
///
/// The defaults mirror long-standing operational practice (ten one-second
/// polls, re-signal every third round) but are deliberately configurable:
/// they were tuned on mid-sized clusters and are not guaranteed to fit all
/// deployments.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
    /// Polling rounds before a count check gives up.
    pub wait_attempts: u32,
    /// Delay between polling rounds, in milliseconds.
    pub poll_interval_ms: u64,
    /// During stop, re-send signals every this many polling rounds.
    pub resignal_every: u32,
    /// Delay between launching parallel replication units, in milliseconds.
    pub stagger_ms: u64,
    /// Maximum statements batched into one remote shell call.
    pub chunk_size: usize,
    /// Deadline for a single reachability probe, in seconds.
    pub ping_timeout_secs: u64,
    /// Probe attempts before settling on a final status.
    pub ping_retries: u32,
    /// Deadline for one membership-listing query, in seconds.
    pub nodes_timeout_secs: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            wait_attempts: 10,
            poll_interval_ms: 1000,
            resignal_every: 3,
            stagger_ms: 20,
            chunk_size: 100,
            ping_timeout_secs: 3,
            ping_retries: 3,
            nodes_timeout_secs: 2,
        }
    }
}

impl Timing {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stagger(&self) -> Duration {
        Duration::from_millis(self.stagger_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }

    pub fn nodes_timeout(&self) -> Duration {
        Duration::from_secs(self.nodes_timeout_secs)
    }
}

/// Remote shell options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSettings {
    /// Remote user; defaults to the current user.
    pub user: Option<String>,
    /// TCP connect deadline, in seconds.
    pub connect_timeout_secs: u64,
    /// Overall deadline for one remote command, in seconds.
    pub command_timeout_secs: u64,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            user: None,
            connect_timeout_secs: 5,
            command_timeout_secs: 60,
        }
    }
}

/// Filesystem layout for one cluster id, identical on every host (and on the
/// operator's machine, which keeps the templates and rendered config).
#[derive(Debug, Clone)]
pub struct ClusterPaths {
    base: PathBuf,
    cluster_id: String,
    root: PathBuf,
    data_dir_prefix: String,
    device_count: u16,
}

impl ClusterPaths {
    pub fn new(spec: &ClusterSpec, cluster_id: &str) -> Self {
        Self {
            base: spec.base_dir.clone(),
            cluster_id: cluster_id.to_string(),
            root: spec.base_dir.join(format!("cluster_{cluster_id}")),
            data_dir_prefix: spec.data_dir_prefix.clone(),
            device_count: spec.device_count.max(1),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.root.join("bin")
    }

    pub fn lib_dir(&self) -> PathBuf {
        self.root.join("lib")
    }

    pub fn conf_dir(&self) -> PathBuf {
        self.root.join("conf")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("log")
    }

    pub fn log_backup_dir(&self, timestamp: &str) -> PathBuf {
        self.log_dir().join("backup").join(timestamp)
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.root.join("backup")
    }

    pub fn conf_backup_dir(&self, tag: &str) -> PathBuf {
        self.backup_dir().join(format!("conf-{tag}"))
    }

    /// Backup area outside the cluster root, so the whole root can be moved
    /// into it.
    pub fn global_backup_dir(&self) -> PathBuf {
        self.base.join("backup")
    }

    pub fn cluster_backup_target(&self, tag: &str) -> PathBuf {
        self.global_backup_dir()
            .join(format!("cluster_{}-{tag}", self.cluster_id))
    }

    pub fn master_template(&self) -> PathBuf {
        self.conf_dir().join("flare-master.conf.template")
    }

    pub fn slave_template(&self) -> PathBuf {
        self.conf_dir().join("flare-slave.conf.template")
    }

    pub fn conf_file(&self, port: u16) -> PathBuf {
        self.conf_dir().join(format!("flare-{port}.conf"))
    }

    pub fn log_file(&self, timestamp: &str, port: u16) -> PathBuf {
        self.log_dir().join(format!("server-{timestamp}-{port}.log"))
    }

    /// Device a port's data lands on: `port mod device_count`.
    pub fn device_index(&self, port: u16) -> u16 {
        port % self.device_count
    }

    /// Per-device data directory, e.g. `/nvme/data2/flare/deploy`.
    pub fn data_dir(&self, port: u16, user: &str) -> String {
        format!(
            "{}{}/flare/{user}",
            self.data_dir_prefix,
            self.device_index(port)
        )
    }

    /// Per-port database directory under the data directory.
    pub fn db_path(&self, port: u16, user: &str) -> String {
        format!("{}/db/db-{port}", self.data_dir(port, user))
    }

    /// Per-port cluster membership state file.
    pub fn node_state_file(&self, port: u16, user: &str) -> String {
        format!("{}/nodes-{port}.conf", self.data_dir(port, user))
    }
}

/// Name of the operating user, used for data paths and process-table
/// filtering. Falls back to `flare` when the environment gives nothing.
pub fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "flare".into())
}
