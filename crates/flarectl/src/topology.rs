//! Node inventory resolution.
//!
//! The inventory is a plain value recomputed from settings at the start of
//! every operation and passed explicitly to whoever needs it. Every master
//! host serves every master port (ports are per-role, not per-host), and
//! likewise for slaves.

use crate::config::Settings;
use crate::error::{Error, Result};

/// Which roles a bulk operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleFilter {
    All,
    MasterOnly,
    SlaveOnly,
}

impl RoleFilter {
    pub fn includes_masters(self) -> bool {
        !matches!(self, RoleFilter::SlaveOnly)
    }

    pub fn includes_slaves(self) -> bool {
        !matches!(self, RoleFilter::MasterOnly)
    }
}

/// The canonical `(host, port, role)` inventory for one cluster id.
#[derive(Debug, Clone)]
pub struct NodeInventory {
    pub master_hosts: Vec<String>,
    pub slave_hosts: Vec<String>,
    pub master_ports: Vec<u16>,
    pub slave_ports: Vec<u16>,
}

impl NodeInventory {
    /// Resolves the inventory for a cluster id from settings.
    ///
    /// Pure function of the loaded configuration: no caching, no side
    /// effects, safe to call repeatedly.
    pub fn resolve(settings: &Settings, cluster_id: &str) -> Result<Self> {
        let spec = settings.cluster(cluster_id)?;
        if spec.master_hosts.is_empty() || spec.master_ports.is_empty() {
            return Err(Error::Configuration(format!(
                "cluster '{cluster_id}' defines no master hosts or ports"
            )));
        }
        if spec.slave_hosts.is_empty() != spec.slave_ports.is_empty() {
            return Err(Error::Configuration(format!(
                "cluster '{cluster_id}' must define slave hosts and slave ports together"
            )));
        }
        Ok(Self {
            master_hosts: spec.master_hosts.clone(),
            slave_hosts: spec.slave_hosts.clone(),
            master_ports: spec.master_ports.clone(),
            slave_ports: spec.slave_ports.clone(),
        })
    }

    /// All distinct hosts, masters first, original order preserved.
    pub fn all_hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = Vec::new();
        for host in self.master_hosts.iter().chain(self.slave_hosts.iter()) {
            if !hosts.iter().any(|h| h == host) {
                hosts.push(host.clone());
            }
        }
        hosts
    }

    /// Distinct hosts serving the selected roles.
    pub fn hosts_for(&self, roles: RoleFilter) -> Vec<String> {
        let mut hosts: Vec<String> = Vec::new();
        let mut add = |list: &[String]| {
            for host in list {
                if !hosts.iter().any(|h| h == host) {
                    hosts.push(host.clone());
                }
            }
        };
        if roles.includes_masters() {
            add(&self.master_hosts);
        }
        if roles.includes_slaves() {
            add(&self.slave_hosts);
        }
        hosts
    }

    /// All ports for the selected roles, masters first.
    pub fn ports_for(&self, roles: RoleFilter) -> Vec<u16> {
        let mut ports = Vec::new();
        if roles.includes_masters() {
            ports.extend_from_slice(&self.master_ports);
        }
        if roles.includes_slaves() {
            ports.extend_from_slice(&self.slave_ports);
        }
        ports
    }

    /// Every `(host, port)` address for the selected roles.
    pub fn addrs_for(&self, roles: RoleFilter) -> Vec<(String, u16)> {
        let mut addrs = Vec::new();
        if roles.includes_masters() {
            for host in &self.master_hosts {
                for &port in &self.master_ports {
                    addrs.push((host.clone(), port));
                }
            }
        }
        if roles.includes_slaves() {
            for host in &self.slave_hosts {
                for &port in &self.slave_ports {
                    addrs.push((host.clone(), port));
                }
            }
        }
        addrs
    }

    /// Ports a specific host serves under the selected roles. A host that
    /// appears in both lists serves both port sets.
    pub fn ports_on_host(&self, host: &str, roles: RoleFilter) -> Vec<u16> {
        let mut ports = Vec::new();
        if roles.includes_masters() && self.master_hosts.iter().any(|h| h == host) {
            ports.extend_from_slice(&self.master_ports);
        }
        if roles.includes_slaves() && self.slave_hosts.iter().any(|h| h == host) {
            ports.extend_from_slice(&self.slave_ports);
        }
        ports
    }

    /// Expected process count for the selected roles.
    pub fn expected_count(&self, roles: RoleFilter) -> usize {
        let mut total = 0;
        if roles.includes_masters() {
            total += self.master_hosts.len() * self.master_ports.len();
        }
        if roles.includes_slaves() {
            total += self.slave_hosts.len() * self.slave_ports.len();
        }
        total
    }

    pub fn has_slaves(&self) -> bool {
        !self.slave_hosts.is_empty() && !self.slave_ports.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inventory() -> NodeInventory {
        NodeInventory {
            master_hosts: vec!["node1".into(), "node2".into()],
            slave_hosts: vec!["node2".into(), "node3".into()],
            master_ports: vec![18100, 18101],
            slave_ports: vec![18150, 18151],
        }
    }

    #[test]
    fn all_hosts_dedups_preserving_order() {
        assert_eq!(inventory().all_hosts(), vec!["node1", "node2", "node3"]);
    }

    #[test]
    fn hosts_for_role_filters() {
        let inv = inventory();
        assert_eq!(inv.hosts_for(RoleFilter::MasterOnly), vec!["node1", "node2"]);
        assert_eq!(inv.hosts_for(RoleFilter::SlaveOnly), vec!["node2", "node3"]);
        assert_eq!(inv.hosts_for(RoleFilter::All), vec!["node1", "node2", "node3"]);
    }

    #[test]
    fn expected_count_is_hosts_times_ports() {
        let inv = inventory();
        assert_eq!(inv.expected_count(RoleFilter::MasterOnly), 4);
        assert_eq!(inv.expected_count(RoleFilter::SlaveOnly), 4);
        assert_eq!(inv.expected_count(RoleFilter::All), 8);
    }

    #[test]
    fn addrs_cover_every_host_port_pair() {
        let inv = inventory();
        let addrs = inv.addrs_for(RoleFilter::MasterOnly);
        assert_eq!(addrs.len(), 4);
        assert!(addrs.contains(&("node1".into(), 18100)));
        assert!(addrs.contains(&("node2".into(), 18101)));
    }

    #[test]
    fn dual_role_host_serves_both_port_sets() {
        let inv = inventory();
        assert_eq!(
            inv.ports_on_host("node2", RoleFilter::All),
            vec![18100, 18101, 18150, 18151]
        );
        assert_eq!(inv.ports_on_host("node1", RoleFilter::All), vec![18100, 18101]);
        assert_eq!(
            inv.ports_on_host("node2", RoleFilter::SlaveOnly),
            vec![18150, 18151]
        );
        assert!(inv.ports_on_host("node9", RoleFilter::All).is_empty());
    }

    #[test]
    fn resolve_rejects_unknown_cluster() {
        let settings = Settings::default();
        assert!(matches!(
            NodeInventory::resolve(&settings, "nope"),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn resolve_rejects_half_defined_slaves() {
        let mut settings = Settings::default();
        settings.clusters.insert(
            "1".into(),
            crate::config::ClusterSpec {
                master_hosts: vec!["node1".into()],
                master_ports: vec![18100],
                slave_hosts: vec!["node2".into()],
                slave_ports: vec![],
                ..Default::default()
            },
        );
        assert!(matches!(
            NodeInventory::resolve(&settings, "1"),
            Err(Error::Configuration(_))
        ));
    }
}
