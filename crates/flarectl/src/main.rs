//! flarectl: operator CLI for flare clusters.
//!
//! Every subcommand is a finite batch job: resolve the inventory from
//! settings, drive the fleet, print a status table, exit. Exit status 0
//! means every host succeeded; any classified failure is non-zero.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use colored::Colorize;
use futures::future::join_all;
use tracing::info;

use flarectl::client::{parse_host_port, StoreCli};
use flarectl::cluster::{ClusterEngine, MasterNode, ReplicationReport};
use flarectl::config::{ClusterPaths, Settings};
use flarectl::error::{Error, Result};
use flarectl::health::NodeStatus;
use flarectl::lifecycle::ProcessManager;
use flarectl::remote::SshExecutor;
use flarectl::report::{Cell, OperationReport, Table};
use flarectl::topology::{NodeInventory, RoleFilter};

#[derive(Parser)]
#[command(name = "flarectl", version, about = "cluster lifecycle orchestrator for flare")]
struct Cli {
    /// Path of the settings file.
    #[arg(short, long, env = "FLARECTL_CONFIG", default_value = "flarectl.toml")]
    config: PathBuf,

    /// Cluster id to operate on. Defaults to the settings file's
    /// `default_cluster`.
    #[arg(long, env = "FLARECTL_CLUSTER")]
    cluster: Option<String>,

    #[command(subcommand)]
    command: CommandKind,
}

/// Role selection shared by several subcommands.
#[derive(Debug, clap::Args)]
struct RoleArgs {
    /// Only operate on master nodes.
    #[arg(long, conflicts_with = "slave_only")]
    master_only: bool,

    /// Only operate on slave nodes.
    #[arg(long)]
    slave_only: bool,
}

impl RoleArgs {
    fn filter(&self) -> RoleFilter {
        if self.master_only {
            RoleFilter::MasterOnly
        } else if self.slave_only {
            RoleFilter::SlaveOnly
        } else {
            RoleFilter::All
        }
    }
}

#[derive(Subcommand)]
enum CommandKind {
    /// Create the cluster from scratch and establish replication.
    CreateCluster {
        /// Skip the confirmation prompt.
        #[arg(long)]
        yes: bool,
    },

    /// Render per-port config files and push them to every host.
    Configure {
        #[command(flatten)]
        roles: RoleArgs,
    },

    /// Start server processes and wait until they are all up.
    Start {
        /// Launch with allocator leak profiling enabled.
        #[arg(long)]
        profile: bool,
    },

    /// Stop server processes and wait until they are gone.
    Stop {
        /// Send SIGKILL instead of SIGINT.
        #[arg(long)]
        force: bool,

        #[command(flatten)]
        roles: RoleArgs,
    },

    /// Establish master/slave replication for the configured topology.
    Replicate,

    /// Promote the slave at the given address to master.
    Failover {
        /// Address of the slave to promote (host:port).
        addr: String,

        /// Force promotion without majority agreement (disaster recovery).
        #[arg(long)]
        takeover: bool,
    },

    /// Show the master/slave tree with per-node health.
    Status,

    /// Verify SSH connectivity to every host.
    CheckHosts,

    /// Verify no requested port is already bound on its host.
    CheckPorts,

    /// Push the local conf directory to every host.
    SyncConf,

    /// Rotate server logs into a timestamped backup directory.
    BackupLogs {
        #[command(flatten)]
        roles: RoleArgs,
    },

    /// Snapshot one host's conf directory into a local tag.
    BackupConf {
        tag: String,

        /// Host to copy from. Defaults to the first master host.
        #[arg(long)]
        host: Option<String>,
    },

    /// Restore a local conf backup tag onto every host.
    RestoreConf { tag: String },

    /// Move the remote cluster directory aside under a tag.
    BackupCluster { tag: String },

    /// Remove generated config, data files, and cluster state.
    Clean {
        #[command(flatten)]
        roles: RoleArgs,
    },

    /// CONFIG GET one key from one node.
    ConfigGet { key: String, addr: String },

    /// CONFIG SET a key on every node of the selected roles.
    ConfigSet {
        key: String,
        value: String,

        #[command(flatten)]
        roles: RoleArgs,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flarectl=info".into()),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", e.to_string().red());
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let settings = Settings::from_file(&cli.config)?;
    let cluster_id = cli
        .cluster
        .clone()
        .unwrap_or_else(|| settings.default_cluster.clone());
    if cluster_id.is_empty() {
        return Err(Error::Configuration(
            "no cluster selected: set default_cluster or pass --cluster".into(),
        ));
    }
    let inventory = NodeInventory::resolve(&settings, &cluster_id)?;
    let spec = settings.cluster(&cluster_id)?;
    let paths = ClusterPaths::new(spec, &cluster_id);
    let exec = SshExecutor::new(&settings.ssh);
    let store = StoreCli::new(&settings, &settings.timing);
    let manager = ProcessManager::new(&exec, &paths, &settings.timing, &cluster_id);
    let engine = ClusterEngine::new(&exec, &store, &settings.timing);

    match cli.command {
        CommandKind::CreateCluster { yes } => {
            println!("{}", node_port_table(&inventory).render());
            if !yes && !confirm("proceed with cluster create?")? {
                println!("{}", "cancelled".yellow());
                return Ok(ExitCode::FAILURE);
            }
            let hosts = inventory.all_hosts();
            let report = manager.check_hosts(&hosts).await;
            if !report.all_ok() {
                println!("{}", report.render());
                return Ok(ExitCode::FAILURE);
            }
            let targets = inventory.addrs_for(RoleFilter::MasterOnly);
            store.cluster_create(&targets).await?;
            info!("cluster metadata created");
            if inventory.has_slaves() {
                let report = engine.replicate(&inventory).await;
                print_replication(&report);
                if !report.all_ok() {
                    return Ok(ExitCode::FAILURE);
                }
            }
            println!("{}", "cluster created".green());
            Ok(ExitCode::SUCCESS)
        }

        CommandKind::Configure { roles } => {
            let report = manager.configure(&inventory, roles.filter()).await?;
            Ok(finish(&report))
        }

        CommandKind::Start { profile } => {
            engine.check_ports_enabled(&inventory).await?;
            manager.check_conf_exists(&inventory, RoleFilter::All).await?;
            let timestamp = run_timestamp();
            let report = manager
                .backup_logs(&inventory, RoleFilter::All, &timestamp)
                .await?;
            if !report.all_ok() {
                println!("{}", report.render());
                return Ok(ExitCode::FAILURE);
            }
            let report = manager
                .create_data_dirs(&inventory, RoleFilter::All)
                .await?;
            if !report.all_ok() {
                println!("{}", report.render());
                return Ok(ExitCode::FAILURE);
            }
            let report = manager
                .start(&inventory, RoleFilter::All, profile, &timestamp)
                .await?;
            if !report.all_ok() {
                println!("{}", report.render());
                return Ok(ExitCode::FAILURE);
            }
            info!("waiting for all server processes to come up");
            manager
                .wait_until_count(
                    &inventory.hosts_for(RoleFilter::All),
                    &inventory.ports_for(RoleFilter::All),
                    inventory.expected_count(RoleFilter::All),
                    None,
                )
                .await?;
            println!("{}", "all server processes are up".green());
            Ok(ExitCode::SUCCESS)
        }

        CommandKind::Stop { force, roles } => {
            let report = manager.stop(&inventory, roles.filter(), force).await?;
            if report.all_ok() {
                println!("{}", "all server processes stopped".green());
            }
            Ok(finish(&report))
        }

        CommandKind::Replicate => {
            let report = engine.replicate(&inventory).await;
            print_replication(&report);
            Ok(if report.all_ok() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }

        CommandKind::Failover { addr, takeover } => {
            parse_host_port(&addr)?;
            let reply = engine.run_failover(&inventory, &addr, takeover).await?;
            println!("{reply}");
            Ok(ExitCode::SUCCESS)
        }

        CommandKind::Status => {
            let tree = engine.master_tree(&inventory).await?;
            println!("{}", status_table(&tree).render());
            Ok(ExitCode::SUCCESS)
        }

        CommandKind::CheckHosts => {
            let report = manager.check_hosts(&inventory.all_hosts()).await;
            println!("{}", report.render());
            Ok(exit_for(&report))
        }

        CommandKind::CheckPorts => match engine.check_ports_enabled(&inventory).await {
            Ok(()) => {
                println!("{}", "all requested ports are free".green());
                Ok(ExitCode::SUCCESS)
            }
            Err(Error::PortConflict(conflicts)) => {
                let mut table = Table::new(&["HOST", "PORT"]);
                for (host, port) in &conflicts {
                    table.row(vec![
                        Cell::plain(host.as_str()),
                        Cell::red(port.to_string()),
                    ]);
                }
                println!("{}", table.render());
                Ok(ExitCode::FAILURE)
            }
            Err(e) => Err(e),
        },

        CommandKind::SyncConf => {
            let report = manager.sync_conf(&inventory).await?;
            Ok(finish(&report))
        }

        CommandKind::BackupLogs { roles } => {
            let report = manager
                .backup_logs(&inventory, roles.filter(), &run_timestamp())
                .await?;
            Ok(finish(&report))
        }

        CommandKind::BackupConf { tag, host } => {
            let host = host.unwrap_or_else(|| inventory.master_hosts[0].clone());
            manager.conf_backup(&host, &tag).await?;
            println!("{}", format!("conf backed up as '{tag}'").green());
            Ok(ExitCode::SUCCESS)
        }

        CommandKind::RestoreConf { tag } => {
            let report = manager.conf_restore(&inventory, &tag).await?;
            Ok(finish(&report))
        }

        CommandKind::BackupCluster { tag } => {
            let report = manager.cluster_backup(&inventory, &tag).await?;
            println!("{}", report.render());
            Ok(exit_for(&report))
        }

        CommandKind::Clean { roles } => {
            let report = manager.clean(&inventory, roles.filter()).await?;
            Ok(finish(&report))
        }

        CommandKind::ConfigGet { key, addr } => match store.config_get(&addr, &key).await? {
            Some(value) => {
                println!("{value}");
                Ok(ExitCode::SUCCESS)
            }
            None => {
                eprintln!("{}", format!("no value for key '{key}'").yellow());
                Ok(ExitCode::FAILURE)
            }
        },

        CommandKind::ConfigSet { key, value, roles } => {
            let addrs = inventory.addrs_for(roles.filter());
            let results = join_all(
                addrs
                    .iter()
                    .map(|(host, port)| store.config_set(host, *port, &key, &value)),
            )
            .await;
            let mut report = OperationReport::new();
            for ((host, port), result) in addrs.iter().zip(results) {
                let label = format!("{host}:{port}");
                match result {
                    Ok(true) => report.push_ok(label),
                    Ok(false) => report.push_failed(label, "not acknowledged"),
                    Err(e) => report.push_failed(label, e.to_string()),
                }
            }
            Ok(finish(&report))
        }
    }
}

/// Timestamp suffix for log files and backup directories.
fn run_timestamp() -> String {
    chrono::Utc::now().format("%Y%m%d-%H%M%S").to_string()
}

/// Prints the table only when something failed; exit code follows it.
fn finish(report: &OperationReport) -> ExitCode {
    if report.all_ok() {
        info!("OK");
        ExitCode::SUCCESS
    } else {
        println!("{}", report.render());
        ExitCode::FAILURE
    }
}

fn exit_for(report: &OperationReport) -> ExitCode {
    if report.all_ok() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{prompt} (y/n) ");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

/// HOST/PORT/TYPE confirmation table shown before cluster create.
fn node_port_table(inventory: &NodeInventory) -> Table {
    let mut table = Table::new(&["HOST", "PORT", "TYPE"]);
    for host in &inventory.master_hosts {
        for port in &inventory.master_ports {
            table.row(vec![
                Cell::plain(host.as_str()),
                Cell::plain(port.to_string()),
                Cell::plain("MASTER"),
            ]);
        }
    }
    for host in &inventory.slave_hosts {
        for port in &inventory.slave_ports {
            table.row(vec![
                Cell::plain(host.as_str()),
                Cell::plain(port.to_string()),
                Cell::plain("SLAVE"),
            ]);
        }
    }
    table
}

fn status_cell(status: NodeStatus) -> Cell {
    match status {
        NodeStatus::Connected => Cell::green(status.to_string()),
        NodeStatus::Paused => Cell::yellow(status.to_string()),
        NodeStatus::Disconnected => Cell::red(status.to_string()),
    }
}

/// Master/slave tree as a flat table, one row per slave.
fn status_table(tree: &[MasterNode]) -> Table {
    let mut table = Table::new(&["MASTER", "STATUS", "SLAVE", "SLAVE STATUS"]);
    for master in tree {
        if master.slaves.is_empty() {
            table.row(vec![
                Cell::plain(master.addr.as_str()),
                status_cell(master.status),
                Cell::plain("-"),
                Cell::plain("-"),
            ]);
        }
        for slave in &master.slaves {
            table.row(vec![
                Cell::plain(master.addr.as_str()),
                status_cell(master.status),
                Cell::plain(slave.addr.as_str()),
                status_cell(slave.status),
            ]);
        }
    }
    table
}

fn print_replication(report: &ReplicationReport) {
    for outcome in report.failures() {
        let cause = outcome.error.as_deref().unwrap_or("unknown error");
        eprintln!(
            "{}",
            format!(
                "replication failed {} -> {}: {cause}",
                outcome.pair.master_addr(),
                outcome.pair.slave_addr()
            )
            .red()
        );
    }
    println!(
        "replication complete: {}/{} pairs",
        report.success_count(),
        report.total()
    );
}
