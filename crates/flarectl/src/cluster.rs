//! Replication assignment, membership introspection, and failover.
//!
//! The pairing algorithm is deterministic and order-stable so repeated runs
//! produce the same assignment regardless of network conditions. Membership
//! is read through `CLUSTER NODES`, which is globally consistent across
//! healthy nodes, so the first usable answer from any node is authoritative.

use std::collections::{HashMap, HashSet};

use futures::future::join_all;
use tracing::{debug, info};

use crate::client::StoreCli;
use crate::command::LISTENING_PORTS_COMMAND;
use crate::config::Timing;
use crate::error::{Error, Result};
use crate::health::NodeStatus;
use crate::remote::{run_checked, RemoteExecutor};
use crate::topology::{NodeInventory, RoleFilter};

// ---------------------------------------------------------------------------
// assignment
// ---------------------------------------------------------------------------

/// One master/slave attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaPair {
    pub master_host: String,
    pub master_port: u16,
    pub slave_host: String,
    pub slave_port: u16,
}

impl ReplicaPair {
    pub fn master_addr(&self) -> String {
        format!("{}:{}", self.master_host, self.master_port)
    }

    pub fn slave_addr(&self) -> String {
        format!("{}:{}", self.slave_host, self.slave_port)
    }
}

/// Computes the master→slave assignment for an inventory.
///
/// Slave port `j` on rotation `i` attaches to `master_ports[j mod P]` on
/// `master_hosts[(i + 1 + j / P) mod M]`. The `+1` offset keeps a replica
/// off the master co-located at its own host index, spreading failure
/// domains. Produces exactly `M × |slave_ports|` pairs.
pub fn build_assignment(inventory: &NodeInventory) -> Vec<ReplicaPair> {
    let m = inventory.master_hosts.len();
    let p = inventory.master_ports.len();
    let s = inventory.slave_hosts.len();
    if m == 0 || p == 0 || s == 0 || inventory.slave_ports.is_empty() {
        return Vec::new();
    }
    let mut pairs = Vec::with_capacity(m * inventory.slave_ports.len());
    for i in 0..m {
        for (j, &slave_port) in inventory.slave_ports.iter().enumerate() {
            pairs.push(ReplicaPair {
                master_host: inventory.master_hosts[(i + 1 + j / p) % m].clone(),
                master_port: inventory.master_ports[j % p],
                slave_host: inventory.slave_hosts[i % s].clone(),
                slave_port,
            });
        }
    }
    pairs
}

// ---------------------------------------------------------------------------
// membership parsing
// ---------------------------------------------------------------------------

/// One line of `CLUSTER NODES` output.
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub id: String,
    pub addr: String,
    pub is_master: bool,
    /// Link state reported by the membership protocol.
    pub link_connected: bool,
    /// For slaves, the node id of their master.
    pub master_id: Option<String>,
}

/// Parses `CLUSTER NODES` text into records, keeping only master and slave
/// lines. The address field may carry a `@gossip-port` suffix, which is
/// stripped.
pub fn parse_cluster_nodes(text: &str) -> Vec<NodeRecord> {
    let mut records = Vec::new();
    for line in text.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 3 {
            continue;
        }
        let flags = parts[2];
        let is_master = flags.contains("master");
        let is_slave = flags.contains("slave");
        if !is_master && !is_slave {
            continue;
        }
        let addr = parts[1].split('@').next().unwrap_or(parts[1]).to_string();
        let master_id = if is_slave {
            parts.get(3).filter(|id| **id != "-").map(|id| id.to_string())
        } else {
            None
        };
        records.push(NodeRecord {
            id: parts[0].to_string(),
            addr,
            is_master,
            link_connected: !parts.iter().any(|p| *p == "disconnected"),
            master_id,
        });
    }
    records
}

// ---------------------------------------------------------------------------
// master tree
// ---------------------------------------------------------------------------

/// A slave in the per-invocation snapshot tree.
#[derive(Debug, Clone)]
pub struct SlaveNode {
    pub node_id: String,
    pub addr: String,
    pub status: NodeStatus,
}

/// A master with its attached slaves.
#[derive(Debug, Clone)]
pub struct MasterNode {
    pub node_id: String,
    pub addr: String,
    pub status: NodeStatus,
    pub slaves: Vec<SlaveNode>,
}

fn addr_port(addr: &str) -> u16 {
    addr.rsplit(':').next().and_then(|p| p.parse().ok()).unwrap_or(0)
}

/// Resolved status of one record: a disconnected membership link wins; a
/// connected link is downgraded to paused only when the direct probe timed
/// out (the process exists but does not answer).
fn resolve_status(record: &NodeRecord, probes: &HashMap<String, NodeStatus>) -> NodeStatus {
    if !record.link_connected {
        return NodeStatus::Disconnected;
    }
    match probes.get(&record.addr) {
        Some(NodeStatus::Paused) => NodeStatus::Paused,
        _ => NodeStatus::Connected,
    }
}

/// Assembles the master tree from parsed records and probe results, sorted
/// by port for stable display.
pub fn build_master_tree(
    records: &[NodeRecord],
    probes: &HashMap<String, NodeStatus>,
) -> Vec<MasterNode> {
    let mut masters: Vec<MasterNode> = records
        .iter()
        .filter(|r| r.is_master)
        .map(|r| MasterNode {
            node_id: r.id.clone(),
            addr: r.addr.clone(),
            status: resolve_status(r, probes),
            slaves: Vec::new(),
        })
        .collect();
    for record in records.iter().filter(|r| !r.is_master) {
        let Some(master_id) = &record.master_id else {
            continue;
        };
        if let Some(master) = masters.iter_mut().find(|m| &m.node_id == master_id) {
            master.slaves.push(SlaveNode {
                node_id: record.id.clone(),
                addr: record.addr.clone(),
                status: resolve_status(record, probes),
            });
        }
    }
    masters.sort_by_key(|m| addr_port(&m.addr));
    for master in &mut masters {
        master.slaves.sort_by_key(|s| addr_port(&s.addr));
    }
    masters
}

/// Picks the first connected slave of every master as its failover target.
///
/// Fails fast with `NoEligibleSlave` before any failover command is issued
/// when some master has no connected slave: a partial failover is worse
/// than no failover.
pub fn check_all_masters_have_alive_slave(tree: &[MasterNode]) -> Result<Vec<String>> {
    let mut targets = Vec::with_capacity(tree.len());
    for master in tree {
        match master
            .slaves
            .iter()
            .find(|s| s.status == NodeStatus::Connected)
        {
            Some(slave) => targets.push(slave.addr.clone()),
            None => {
                return Err(Error::NoEligibleSlave {
                    master: master.addr.clone(),
                })
            }
        }
    }
    Ok(targets)
}

// ---------------------------------------------------------------------------
// engine
// ---------------------------------------------------------------------------

/// Result of one replication attempt.
#[derive(Debug, Clone)]
pub struct ReplicationOutcome {
    pub pair: ReplicaPair,
    pub error: Option<String>,
}

/// Aggregate result of a replication run, in assignment order.
#[derive(Debug, Clone, Default)]
pub struct ReplicationReport {
    pub outcomes: Vec<ReplicationOutcome>,
}

impl ReplicationReport {
    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    pub fn success_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.error.is_none()).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &ReplicationOutcome> {
        self.outcomes.iter().filter(|o| o.error.is_some())
    }

    pub fn all_ok(&self) -> bool {
        self.success_count() == self.total()
    }
}

/// Drives replication, introspection, and failover against a live cluster.
pub struct ClusterEngine<'a, E> {
    exec: &'a E,
    cli: &'a StoreCli,
    timing: &'a Timing,
}

impl<'a, E: RemoteExecutor> ClusterEngine<'a, E> {
    pub fn new(exec: &'a E, cli: &'a StoreCli, timing: &'a Timing) -> Self {
        Self { exec, cli, timing }
    }

    /// Establishes replication for every computed pair.
    ///
    /// All pairs run concurrently; launches are staggered to avoid a
    /// thundering herd of simultaneous commands against the cluster. A
    /// failing pair records its addresses and error without aborting the
    /// others.
    pub async fn replicate(&self, inventory: &NodeInventory) -> ReplicationReport {
        let pairs = build_assignment(inventory);
        let stagger = self.timing.stagger();
        let futures = pairs.into_iter().enumerate().map(|(idx, pair)| {
            let cli = self.cli;
            async move {
                tokio::time::sleep(stagger * idx as u32).await;
                info!(
                    master = %pair.master_addr(),
                    slave = %pair.slave_addr(),
                    "establishing replication"
                );
                let result = cli
                    .replicate(
                        &pair.master_host,
                        pair.master_port,
                        &pair.slave_host,
                        pair.slave_port,
                    )
                    .await;
                ReplicationOutcome {
                    pair,
                    error: result.err().map(|e| e.to_string()),
                }
            }
        });
        ReplicationReport {
            outcomes: join_all(futures).await,
        }
    }

    /// Builds the master/slave snapshot tree from live cluster state.
    ///
    /// Queries every known node in parallel and keeps the first usable
    /// membership listing; raises `NoQuorum` when every node is unreachable
    /// or still loading its dataset. Every listed address is then probed in
    /// parallel to refine the per-node status.
    pub async fn master_tree(&self, inventory: &NodeInventory) -> Result<Vec<MasterNode>> {
        let addrs = inventory.addrs_for(RoleFilter::All);
        let listings = join_all(
            addrs
                .iter()
                .map(|(host, port)| self.cli.cluster_nodes(host, *port)),
        )
        .await;
        let listing = listings
            .into_iter()
            .flatten()
            .find(|text| !text.contains("loading the dataset"))
            .ok_or(Error::NoQuorum)?;
        debug!(listing = listing.as_str(), "membership listing");

        let records = parse_cluster_nodes(&listing);
        if records.iter().filter(|r| r.is_master).count() <= 1 {
            return Err(Error::Configuration(
                "cluster has not been formed yet; run 'flarectl create-cluster'".into(),
            ));
        }

        let probe_addrs: Vec<String> = records.iter().map(|r| r.addr.clone()).collect();
        let statuses = join_all(probe_addrs.iter().map(|addr| self.cli.ping(addr))).await;
        let probes: HashMap<String, NodeStatus> =
            probe_addrs.into_iter().zip(statuses).collect();

        Ok(build_master_tree(&records, &probes))
    }

    /// Fails a master over to the slave at `addr`.
    ///
    /// The pre-flight guard walks the whole tree first and aborts before
    /// any command is sent if any master lacks a connected slave. With
    /// `takeover` the promotion bypasses majority agreement; that path is
    /// for manual disaster recovery only.
    pub async fn run_failover(
        &self,
        inventory: &NodeInventory,
        addr: &str,
        takeover: bool,
    ) -> Result<String> {
        let tree = self.master_tree(inventory).await?;
        check_all_masters_have_alive_slave(&tree)?;
        info!(addr, takeover, "running failover");
        self.cli.failover(addr, takeover).await
    }

    /// Reports requested ports that are already bound on their hosts.
    /// Intended as a pre-flight guard before `start`.
    pub async fn check_ports_enabled(&self, inventory: &NodeInventory) -> Result<()> {
        let hosts = inventory.all_hosts();
        let futures = hosts.iter().map(|host| async move {
            let out = run_checked(self.exec, host, LISTENING_PORTS_COMMAND, &[]).await?;
            let bound = parse_listening_ports(&out.stdout);
            let conflicts: Vec<u16> = inventory
                .ports_on_host(host, RoleFilter::All)
                .into_iter()
                .filter(|port| bound.contains(port))
                .collect();
            Ok::<_, Error>(conflicts)
        });
        let mut all_conflicts = Vec::new();
        for (host, result) in hosts.iter().zip(join_all(futures).await) {
            for port in result? {
                all_conflicts.push((host.clone(), port));
            }
        }
        if all_conflicts.is_empty() {
            Ok(())
        } else {
            Err(Error::PortConflict(all_conflicts))
        }
    }
}

/// Extracts the port set from a listening-socket listing (one local
/// address per line, `host:port`).
pub fn parse_listening_ports(stdout: &str) -> HashSet<u16> {
    stdout
        .split_whitespace()
        .filter_map(|addr| addr.rsplit(':').next())
        .filter_map(|port| port.parse().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::remote::testing::ScriptedExecutor;
    use crate::remote::testing::Step;

    fn inventory(
        master_hosts: &[&str],
        master_ports: &[u16],
        slave_hosts: &[&str],
        slave_ports: &[u16],
    ) -> NodeInventory {
        NodeInventory {
            master_hosts: master_hosts.iter().map(|h| h.to_string()).collect(),
            slave_hosts: slave_hosts.iter().map(|h| h.to_string()).collect(),
            master_ports: master_ports.to_vec(),
            slave_ports: slave_ports.to_vec(),
        }
    }

    // --- assignment ---

    #[test]
    fn assignment_yields_m_times_slave_ports_pairs() {
        let inv = inventory(
            &["m1", "m2", "m3"],
            &[7000, 7001],
            &["s1", "s2", "s3"],
            &[7100, 7101],
        );
        assert_eq!(build_assignment(&inv).len(), 3 * 2);
    }

    #[test]
    fn assignment_never_lands_on_own_host_index() {
        let inv = inventory(
            &["m1", "m2", "m3"],
            &[7000, 7001],
            &["m1", "m2", "m3"],
            &[7100, 7101],
        );
        let pairs = build_assignment(&inv);
        for (i, chunk) in pairs.chunks(inv.slave_ports.len()).enumerate() {
            for pair in chunk {
                let master_idx = inv
                    .master_hosts
                    .iter()
                    .position(|h| *h == pair.master_host)
                    .unwrap();
                assert_ne!(master_idx, i, "rotation {i} paired with its own host");
            }
        }
    }

    #[test]
    fn assignment_applies_the_offset() {
        // 2 master hosts x 2 master ports, 1 slave host x 2 slave ports
        let inv = inventory(&["m1", "m2"], &[7000, 7001], &["s1"], &[7100, 7101]);
        let pairs = build_assignment(&inv);
        assert_eq!(pairs.len(), 4);
        // rotation 0, port 0 goes to master_hosts[1], not master_hosts[0]
        assert_eq!(
            pairs[0],
            ReplicaPair {
                master_host: "m2".into(),
                master_port: 7000,
                slave_host: "s1".into(),
                slave_port: 7100,
            }
        );
        assert_eq!(pairs[1].master_host, "m2");
        assert_eq!(pairs[1].master_port, 7001);
        // rotation 1 wraps back to master_hosts[0]
        assert_eq!(pairs[2].master_host, "m1");
    }

    #[test]
    fn assignment_is_deterministic() {
        let inv = inventory(
            &["m1", "m2", "m3"],
            &[7000, 7001],
            &["s1", "s2"],
            &[7100, 7101],
        );
        assert_eq!(build_assignment(&inv), build_assignment(&inv));
    }

    #[test]
    fn assignment_without_slaves_is_empty() {
        let inv = inventory(&["m1"], &[7000], &[], &[]);
        assert!(build_assignment(&inv).is_empty());
    }

    // --- membership parsing ---

    const NODES_FIXTURE: &str = "\
aaa111 10.0.0.1:7000@17000 myself,master - 0 0 1 connected 0-8191\n\
bbb222 10.0.0.2:7000@17000 master - 0 0 2 connected 8192-16383\n\
ccc333 10.0.0.3:7100@17100 slave aaa111 0 0 1 connected\n\
ddd444 10.0.0.3:7101@17101 slave bbb222 0 0 2 disconnected\n";

    #[test]
    fn parse_splits_masters_and_slaves() {
        let records = parse_cluster_nodes(NODES_FIXTURE);
        assert_eq!(records.len(), 4);
        assert!(records[0].is_master);
        assert_eq!(records[0].addr, "10.0.0.1:7000");
        assert!(records[0].master_id.is_none());
        assert!(!records[2].is_master);
        assert_eq!(records[2].master_id.as_deref(), Some("aaa111"));
        assert!(records[2].link_connected);
        assert!(!records[3].link_connected);
    }

    #[test]
    fn parse_skips_noise_lines() {
        let text = "\n\
eee555 10.0.0.5:7000@17000 handshake - 0 0 0 connected\n\
garbage\n";
        assert!(parse_cluster_nodes(text).is_empty());
    }

    // --- master tree ---

    fn all_connected(records: &[NodeRecord]) -> HashMap<String, NodeStatus> {
        records
            .iter()
            .map(|r| (r.addr.clone(), NodeStatus::Connected))
            .collect()
    }

    #[test]
    fn tree_lists_every_master_once_and_every_slave_under_one_master() {
        let records = parse_cluster_nodes(NODES_FIXTURE);
        let tree = build_master_tree(&records, &all_connected(&records));
        assert_eq!(tree.len(), 2);
        let mut master_addrs: Vec<&str> = tree.iter().map(|m| m.addr.as_str()).collect();
        master_addrs.dedup();
        assert_eq!(master_addrs.len(), 2);
        let slave_total: usize = tree.iter().map(|m| m.slaves.len()).sum();
        assert_eq!(slave_total, 2);
        assert_eq!(tree[0].slaves[0].node_id, "ccc333");
        assert_eq!(tree[1].slaves[0].node_id, "ddd444");
    }

    #[test]
    fn tree_is_sorted_by_port() {
        let text = "\
bbb222 10.0.0.2:7001@17001 master - 0 0 2 connected\n\
aaa111 10.0.0.1:7000@17000 master - 0 0 1 connected\n";
        let records = parse_cluster_nodes(text);
        let tree = build_master_tree(&records, &all_connected(&records));
        assert_eq!(tree[0].addr, "10.0.0.1:7000");
        assert_eq!(tree[1].addr, "10.0.0.2:7001");
    }

    #[test]
    fn tree_marks_disconnected_links_and_paused_probes() {
        let records = parse_cluster_nodes(NODES_FIXTURE);
        let mut probes = all_connected(&records);
        probes.insert("10.0.0.1:7000".into(), NodeStatus::Paused);
        let tree = build_master_tree(&records, &probes);
        assert_eq!(tree[0].status, NodeStatus::Paused);
        // ddd444's link is down regardless of its probe result
        assert_eq!(tree[1].slaves[0].status, NodeStatus::Disconnected);
    }

    #[test]
    fn connected_link_survives_a_refused_probe() {
        // only a probe timeout downgrades a connected link
        let records = parse_cluster_nodes(NODES_FIXTURE);
        let mut probes = all_connected(&records);
        probes.insert("10.0.0.2:7000".into(), NodeStatus::Disconnected);
        let tree = build_master_tree(&records, &probes);
        assert_eq!(tree[1].status, NodeStatus::Connected);
    }

    // --- failover guard ---

    fn tree_fixture(slave_status: NodeStatus) -> Vec<MasterNode> {
        vec![
            MasterNode {
                node_id: "aaa111".into(),
                addr: "10.0.0.1:7000".into(),
                status: NodeStatus::Connected,
                slaves: vec![SlaveNode {
                    node_id: "ccc333".into(),
                    addr: "10.0.0.3:7100".into(),
                    status: NodeStatus::Connected,
                }],
            },
            MasterNode {
                node_id: "bbb222".into(),
                addr: "10.0.0.2:7000".into(),
                status: NodeStatus::Connected,
                slaves: vec![SlaveNode {
                    node_id: "ddd444".into(),
                    addr: "10.0.0.3:7101".into(),
                    status: slave_status,
                }],
            },
        ]
    }

    #[test]
    fn guard_picks_first_connected_slave_per_master() {
        let targets = check_all_masters_have_alive_slave(&tree_fixture(NodeStatus::Connected))
            .unwrap();
        assert_eq!(targets, vec!["10.0.0.3:7100", "10.0.0.3:7101"]);
    }

    #[test]
    fn guard_trips_iff_a_master_has_no_connected_slave() {
        for status in [NodeStatus::Disconnected, NodeStatus::Paused] {
            let err = check_all_masters_have_alive_slave(&tree_fixture(status)).unwrap_err();
            assert!(
                matches!(&err, Error::NoEligibleSlave { master } if master == "10.0.0.2:7000")
            );
        }
    }

    #[test]
    fn guard_trips_on_empty_slave_list() {
        let mut tree = tree_fixture(NodeStatus::Connected);
        tree[0].slaves.clear();
        assert!(check_all_masters_have_alive_slave(&tree).is_err());
    }

    // --- port pre-flight ---

    #[test]
    fn listening_ports_parse() {
        let stdout = "0.0.0.0:22\n127.0.0.1:631\n:::18100\n";
        let ports = parse_listening_ports(stdout);
        assert!(ports.contains(&22));
        assert!(ports.contains(&631));
        assert!(ports.contains(&18100));
        assert_eq!(ports.len(), 3);
    }

    #[tokio::test]
    async fn port_check_reports_conflicts_per_host() {
        let exec = ScriptedExecutor::new();
        exec.push("h1", Step::Out(0, "0.0.0.0:22\n0.0.0.0:18100\n"));
        exec.push("h2", Step::Out(0, "0.0.0.0:22\n"));
        let settings = Settings::default();
        let timing = Timing::default();
        let cli = StoreCli::new(&settings, &timing);
        let engine = ClusterEngine::new(&exec, &cli, &timing);
        let inv = inventory(&["h1", "h2"], &[18100], &[], &[]);
        let err = engine.check_ports_enabled(&inv).await.unwrap_err();
        assert!(
            matches!(&err, Error::PortConflict(list) if list == &[("h1".to_string(), 18100)])
        );
    }

    #[tokio::test]
    async fn port_check_passes_when_ports_are_free() {
        let exec = ScriptedExecutor::new();
        exec.push("h1", Step::Out(0, "0.0.0.0:22\n"));
        let settings = Settings::default();
        let timing = Timing::default();
        let cli = StoreCli::new(&settings, &timing);
        let engine = ClusterEngine::new(&exec, &cli, &timing);
        let inv = inventory(&["h1"], &[18100], &[], &[]);
        assert!(engine.check_ports_enabled(&inv).await.is_ok());
    }
}
