//! Process lifecycle management.
//!
//! Renders per-port configuration, starts and stops server processes
//! host-by-host, and polls the remote process table until the expected
//! number of processes is observably running (or drained) within a bounded
//! retry budget. Per-host failures inside a bulk action never abort the
//! sibling hosts; they land in the returned `OperationReport`.

use std::path::Path;

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::command::{
    env_exports, kill_command, ps_count_command, sh_quote, ShellBatch, KILL_ALLOWED_STATUSES,
};
use crate::config::{current_user, ClusterPaths, Timing};
use crate::error::{Error, Result};
use crate::remote::{run_checked, RemoteExecutor};
use crate::report::{OperationReport, Outcome};
use crate::topology::{NodeInventory, RoleFilter};

/// Substitutes `${NAME}` placeholders in a config template.
///
/// Unknown placeholders are left untouched so template typos surface in the
/// rendered file instead of vanishing silently.
pub fn render_template(template: &str, vars: &[(&str, String)]) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("${{{key}}}"), value);
    }
    out
}

/// Signals to re-send while waiting for processes to drain.
pub struct SignalPlan<'p> {
    pub targets: &'p [(String, Vec<u16>)],
    pub force: bool,
}

/// Drives server processes on the remote fleet.
pub struct ProcessManager<'a, E> {
    exec: &'a E,
    paths: &'a ClusterPaths,
    timing: &'a Timing,
    cluster_id: &'a str,
}

impl<'a, E: RemoteExecutor> ProcessManager<'a, E> {
    pub fn new(exec: &'a E, paths: &'a ClusterPaths, timing: &'a Timing, cluster_id: &'a str) -> Self {
        Self {
            exec,
            paths,
            timing,
            cluster_id,
        }
    }

    // -----------------------------------------------------------------------
    // configure
    // -----------------------------------------------------------------------

    /// Renders per-port config files locally and pushes the conf directory
    /// to every host serving the selected roles.
    ///
    /// Rendering is deterministic: running it twice over the same inventory
    /// produces byte-identical files.
    pub async fn configure(
        &self,
        inventory: &NodeInventory,
        roles: RoleFilter,
    ) -> Result<OperationReport> {
        let user = current_user();
        std::fs::create_dir_all(self.paths.conf_dir())?;
        if roles.includes_masters() {
            self.render_role(
                &self.paths.master_template(),
                &inventory.master_ports,
                &user,
            )?;
        }
        if roles.includes_slaves() && inventory.has_slaves() {
            self.render_role(&self.paths.slave_template(), &inventory.slave_ports, &user)?;
        }
        info!("pushing rendered config to hosts");
        Ok(self.push_conf(&inventory.hosts_for(roles)).await)
    }

    fn render_role(&self, template_path: &Path, ports: &[u16], user: &str) -> Result<()> {
        let template = std::fs::read_to_string(template_path).map_err(|e| {
            Error::Configuration(format!(
                "cannot read template {}: {e}",
                template_path.display()
            ))
        })?;
        for &port in ports {
            let vars = [
                ("FLARE_PORT", port.to_string()),
                ("FLARE_DATA_DIR", self.paths.data_dir(port, user)),
                ("FLARE_DB_PATH", self.paths.db_path(port, user)),
            ];
            let rendered = render_template(&template, &vars);
            let target = self.paths.conf_file(port);
            std::fs::write(&target, rendered)?;
            debug!(port, target = %target.display(), "rendered config");
        }
        Ok(())
    }

    /// Pushes the local conf directory to each host, one outcome per host.
    async fn push_conf(&self, hosts: &[String]) -> OperationReport {
        let conf_dir = self.paths.conf_dir();
        let root = self.paths.root().to_path_buf();
        let futures = hosts.iter().map(|host| {
            let conf_dir = conf_dir.clone();
            let root = root.clone();
            async move {
                let ensure_root = format!("mkdir -p {}", sh_quote(&root.display().to_string()));
                match run_checked(self.exec, host, &ensure_root, &[]).await {
                    Ok(_) => match self.exec.copy_to_remote(host, &conf_dir, &root).await {
                        Ok(()) => Outcome::Ok,
                        Err(e) => Outcome::Failed(failure_label(&e)),
                    },
                    Err(e) => Outcome::Failed(failure_label(&e)),
                }
            }
        });
        collect_report(hosts, join_all(futures).await)
    }

    /// Verifies every host has the cluster directory, then pushes the conf
    /// directory everywhere. The first phase is fail-fast: a host without
    /// the cluster layout gets a NO CLUSTER row and nothing is copied.
    pub async fn sync_conf(&self, inventory: &NodeInventory) -> Result<OperationReport> {
        let hosts = inventory.all_hosts();
        let root = self.paths.root().to_path_buf();
        let checks = join_all(hosts.iter().map(|host| {
            let root = root.clone();
            async move {
                match self.exec.is_dir(host, &root).await {
                    Ok(true) => Outcome::Ok,
                    Ok(false) => Outcome::Failed("NO CLUSTER".into()),
                    Err(e) => Outcome::Failed(failure_label(&e)),
                }
            }
        }))
        .await;
        let check_report = collect_report(&hosts, checks);
        if !check_report.all_ok() {
            return Ok(check_report);
        }
        Ok(self.push_conf(&hosts).await)
    }

    // -----------------------------------------------------------------------
    // directories and pre-flight
    // -----------------------------------------------------------------------

    /// Creates the per-device data and db directories on every host.
    pub async fn create_data_dirs(
        &self,
        inventory: &NodeInventory,
        roles: RoleFilter,
    ) -> Result<OperationReport> {
        let user = current_user();
        let hosts = inventory.hosts_for(roles);
        let futures = hosts.iter().map(|host| {
            let ports = inventory.ports_on_host(host, roles);
            let user = user.clone();
            async move {
                let mut batch = ShellBatch::new(self.timing.chunk_size);
                for port in ports {
                    batch.push(format!(
                        "mkdir -p {} {};",
                        sh_quote(&self.paths.data_dir(port, &user)),
                        sh_quote(&self.paths.db_path(port, &user)),
                    ));
                }
                self.run_batch(host, &batch, &[]).await
            }
        });
        Ok(collect_report(&hosts, join_all(futures).await))
    }

    /// Fails fast when any host is missing a rendered config file.
    pub async fn check_conf_exists(
        &self,
        inventory: &NodeInventory,
        roles: RoleFilter,
    ) -> Result<()> {
        for host in inventory.hosts_for(roles) {
            let mut batch = ShellBatch::new(self.timing.chunk_size).with_prelude("ls");
            for port in inventory.ports_on_host(&host, roles) {
                batch.push(self.paths.conf_file(port).display().to_string());
            }
            for chunk in batch.chunks() {
                let out = self.exec.run(&host, &chunk).await?;
                if !out.success() {
                    return Err(Error::Configuration(format!(
                        "config files missing on {host}; run 'flarectl configure' first"
                    )));
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // start
    // -----------------------------------------------------------------------

    /// Launches every port's server process on each host serving the
    /// selected roles. One shell invocation per host (chunked), each process
    /// backgrounded with output redirected to a per-port, per-run log file.
    pub async fn start(
        &self,
        inventory: &NodeInventory,
        roles: RoleFilter,
        profile: bool,
        timestamp: &str,
    ) -> Result<OperationReport> {
        let hosts = inventory.hosts_for(roles);
        let futures = hosts.iter().map(|host| {
            let ports = inventory.ports_on_host(host, roles);
            async move {
                let port_list: Vec<String> = ports.iter().map(|p| p.to_string()).collect();
                info!(host = host.as_str(), ports = %port_list.join("|"), "starting servers");
                let mut batch = ShellBatch::new(self.timing.chunk_size)
                    .with_prelude(self.launch_prelude(profile));
                for port in ports {
                    batch.push(format!(
                        "($FLARE_BIN/flare-server $FLARE_CONF/flare-{port}.conf \
                         >> $FLARE_LOG/server-{timestamp}-{port}.log 2>&1) &"
                    ));
                }
                self.run_batch(host, &batch, &[]).await
            }
        });
        Ok(collect_report(&hosts, join_all(futures).await))
    }

    fn launch_prelude(&self, profile: bool) -> String {
        let lib_dir = self.paths.lib_dir().display().to_string();
        let mut prelude = format!(
            "mkdir -p {}; {}",
            sh_quote(&self.paths.log_dir().display().to_string()),
            env_exports(&[
                ("FLARE_BIN", self.paths.bin_dir().display().to_string()),
                ("FLARE_CONF", self.paths.conf_dir().display().to_string()),
                ("FLARE_LOG", self.paths.log_dir().display().to_string()),
                ("FLARE_LIB", lib_dir.clone()),
                ("LD_LIBRARY_PATH", lib_dir),
            ]),
        );
        if profile {
            // leak profiling via jemalloc, mirroring the server's allocator
            prelude.push_str(
                " export MALLOC_CONF=prof_leak:true,lg_prof_sample:0,prof_final:true;",
            );
            prelude.push_str(" export LD_PRELOAD=$FLARE_LIB/libjemalloc.so;");
        }
        prelude
    }

    // -----------------------------------------------------------------------
    // stop
    // -----------------------------------------------------------------------

    /// Stops the selected roles: slaves drain before masters so masters do
    /// not fail over onto dying replicas mid-shutdown.
    ///
    /// Returns the per-host signalling report; an unreachable host is a FAIL
    /// row, not an abort. Raises `ClusterHealth` when reachable hosts never
    /// drain within the retry budget.
    pub async fn stop(
        &self,
        inventory: &NodeInventory,
        roles: RoleFilter,
        force: bool,
    ) -> Result<OperationReport> {
        let mut combined = OperationReport::new();
        if roles.includes_slaves() && inventory.has_slaves() {
            info!("stopping slave processes");
            let report = self
                .stop_group(&inventory.slave_hosts, &inventory.slave_ports, force)
                .await?;
            merge_reports(&mut combined, report);
        }
        if roles.includes_masters() {
            info!("stopping master processes");
            let report = self
                .stop_group(&inventory.master_hosts, &inventory.master_ports, force)
                .await?;
            merge_reports(&mut combined, report);
        }
        Ok(combined)
    }

    async fn stop_group(
        &self,
        hosts: &[String],
        ports: &[u16],
        force: bool,
    ) -> Result<OperationReport> {
        let targets: Vec<(String, Vec<u16>)> = hosts
            .iter()
            .map(|h| (h.clone(), ports.to_vec()))
            .collect();
        let report = self.signal(&targets, force).await;
        let live_targets: Vec<(String, Vec<u16>)> = {
            let ok = report.ok_hosts();
            targets
                .into_iter()
                .filter(|(h, _)| ok.iter().any(|o| o == h))
                .collect()
        };
        if !live_targets.is_empty() {
            let live_hosts: Vec<String> =
                live_targets.iter().map(|(h, _)| h.clone()).collect();
            self.wait_until_count(
                &live_hosts,
                ports,
                0,
                Some(SignalPlan {
                    targets: &live_targets,
                    force,
                }),
            )
            .await?;
        }
        Ok(report)
    }

    /// Sends the stop signal to every target host in parallel.
    ///
    /// Exit statuses from the expected listing/kill races are tolerated; the
    /// process table can change between matching and signalling.
    async fn signal(&self, targets: &[(String, Vec<u16>)], force: bool) -> OperationReport {
        let hosts: Vec<String> = targets.iter().map(|(h, _)| h.clone()).collect();
        let futures = targets.iter().map(|(host, ports)| async move {
            let command = kill_command(ports, force);
            match run_checked(self.exec, host, &command, KILL_ALLOWED_STATUSES).await {
                Ok(_) => Outcome::Ok,
                Err(e) => Outcome::Failed(failure_label(&e)),
            }
        });
        collect_report(&hosts, join_all(futures).await)
    }

    // -----------------------------------------------------------------------
    // polling
    // -----------------------------------------------------------------------

    /// Counts alive server processes matching the port set, the invoking
    /// user, and this cluster id, across all given hosts.
    pub async fn alive_count(&self, hosts: &[String], ports: &[u16]) -> Result<usize> {
        let command = ps_count_command(ports, Some(self.cluster_id));
        let mut total = 0usize;
        for host in hosts {
            let out = self.exec.run(host, &command).await?;
            let count: usize = out.stdout.trim().parse().unwrap_or_else(|_| {
                debug!(host = host.as_str(), stdout = %out.stdout.trim(), "unparseable count");
                0
            });
            total += count;
        }
        debug!(total, "alive processes");
        Ok(total)
    }

    /// Polls until the observed process count satisfies `target`.
    ///
    /// With `target > 0` the poll succeeds as soon as the count reaches or
    /// exceeds the target; an excess is logged as a warning (stale or
    /// duplicate processes), not a failure. With `target == 0` the poll
    /// waits for a full drain, re-sending `resignal` every
    /// `resignal_every`-th round. Exhausting the attempt budget raises
    /// `ClusterHealth` with the last observed count.
    pub async fn wait_until_count(
        &self,
        hosts: &[String],
        ports: &[u16],
        target: usize,
        resignal: Option<SignalPlan<'_>>,
    ) -> Result<usize> {
        let attempts = self.timing.wait_attempts.max(1);
        let mut observed = 0usize;
        for attempt in 1..=attempts {
            if let Some(ref plan) = resignal {
                if attempt % self.timing.resignal_every.max(1) == 0 {
                    debug!(attempt, "re-sending stop signals");
                    let report = self.signal(plan.targets, plan.force).await;
                    if !report.all_ok() {
                        warn!("some hosts could not be re-signalled");
                    }
                }
            }
            observed = self.alive_count(hosts, ports).await?;
            info!(alive = observed, target, attempt, "counting alive processes");
            let satisfied = if target == 0 {
                observed == 0
            } else {
                observed >= target
            };
            if satisfied {
                if observed > target {
                    warn!(
                        alive = observed,
                        target, "more processes alive than expected; stale processes may remain"
                    );
                }
                return Ok(observed);
            }
            if attempt < attempts {
                tokio::time::sleep(self.timing.poll_interval()).await;
            }
        }
        Err(Error::ClusterHealth {
            expected: target,
            observed,
            attempts,
        })
    }

    // -----------------------------------------------------------------------
    // cleanup and backups
    // -----------------------------------------------------------------------

    /// Removes generated config, data, append-only/dump files, and cluster
    /// membership state for the selected roles.
    pub async fn clean(
        &self,
        inventory: &NodeInventory,
        roles: RoleFilter,
    ) -> Result<OperationReport> {
        let user = current_user();
        let hosts = inventory.hosts_for(roles);
        let futures = hosts.iter().map(|host| {
            let ports = inventory.ports_on_host(host, roles);
            let user = user.clone();
            async move {
                info!(host = host.as_str(), "cleaning cluster state");
                let mut batch = ShellBatch::new(self.timing.chunk_size);
                for port in ports {
                    let data_dir = self.paths.data_dir(port, &user);
                    batch.push(format!(
                        "rm -f {};",
                        sh_quote(&self.paths.conf_file(port).display().to_string())
                    ));
                    batch.push(format!(
                        "rm -rf {} {data_dir}/appendonly-{port}*.aof {data_dir}/dump-{port}.rdb;",
                        sh_quote(&self.paths.db_path(port, &user)),
                    ));
                    batch.push(format!(
                        "rm -f {};",
                        sh_quote(&self.paths.node_state_file(port, &user))
                    ));
                }
                self.run_batch(host, &batch, &[]).await
            }
        });
        Ok(collect_report(&hosts, join_all(futures).await))
    }

    /// Rotates per-port server logs into `log/backup/<timestamp>/` on every
    /// host before a restart.
    pub async fn backup_logs(
        &self,
        inventory: &NodeInventory,
        roles: RoleFilter,
        timestamp: &str,
    ) -> Result<OperationReport> {
        let backup_path = self.paths.log_backup_dir(timestamp);
        let log_dir = self.paths.log_dir();
        let hosts = inventory.hosts_for(roles);
        let futures = hosts.iter().map(|host| {
            let ports = inventory.ports_on_host(host, roles);
            let backup = sh_quote(&backup_path.display().to_string());
            let logs = log_dir.display().to_string();
            async move {
                let mut batch = ShellBatch::new(self.timing.chunk_size)
                    .with_prelude(format!("mkdir -p {backup};"));
                for port in ports {
                    // glob may match nothing once logs were already rotated
                    batch.push(format!("mv {logs}/*-{port}.log {backup} > /dev/null 2>&1;"));
                }
                self.run_batch(host, &batch, &[0, 1]).await
            }
        });
        Ok(collect_report(&hosts, join_all(futures).await))
    }

    /// Copies the conf directory of one host into a local tag directory.
    pub async fn conf_backup(&self, host: &str, tag: &str) -> Result<()> {
        let target = self.paths.conf_backup_dir(tag);
        if target.exists() {
            return Err(Error::Configuration(format!(
                "conf backup tag '{tag}' already exists at {}",
                target.display()
            )));
        }
        std::fs::create_dir_all(self.paths.backup_dir())?;
        self.exec
            .copy_from_remote(host, &self.paths.conf_dir(), &target)
            .await?;
        info!(tag, host, "conf backed up");
        Ok(())
    }

    /// Restores a local conf backup tag onto every host.
    pub async fn conf_restore(
        &self,
        inventory: &NodeInventory,
        tag: &str,
    ) -> Result<OperationReport> {
        let source = self.paths.conf_backup_dir(tag);
        if !source.is_dir() {
            return Err(Error::Configuration(format!(
                "no conf backup with tag '{tag}' at {}",
                source.display()
            )));
        }
        let conf_dir = self.paths.conf_dir();
        let hosts = inventory.all_hosts();
        let futures = hosts.iter().map(|host| {
            let source = source.clone();
            let conf_dir = conf_dir.clone();
            async move {
                let wipe = format!("rm -rf {}", sh_quote(&conf_dir.display().to_string()));
                match run_checked(self.exec, host, &wipe, &[]).await {
                    Ok(_) => match self.exec.copy_to_remote(host, &source, &conf_dir).await {
                        Ok(()) => Outcome::Ok,
                        Err(e) => Outcome::Failed(failure_label(&e)),
                    },
                    Err(e) => Outcome::Failed(failure_label(&e)),
                }
            }
        });
        Ok(collect_report(&hosts, join_all(futures).await))
    }

    /// Moves the remote cluster directory aside into the backup area on
    /// every host. Hosts without a cluster directory are skipped.
    pub async fn cluster_backup(
        &self,
        inventory: &NodeInventory,
        tag: &str,
    ) -> Result<OperationReport> {
        let root = self.paths.root().to_path_buf();
        let backup_dir = self.paths.global_backup_dir();
        let target = self.paths.cluster_backup_target(tag);
        let hosts = inventory.all_hosts();
        let futures = hosts.iter().map(|host| {
            let root = root.clone();
            let backup_dir = backup_dir.clone();
            let target = target.clone();
            async move {
                match self.exec.is_dir(host, &root).await {
                    Ok(false) => {
                        return Outcome::Skipped("no cluster directory".into());
                    }
                    Err(e) => return Outcome::Failed(failure_label(&e)),
                    Ok(true) => {}
                }
                let command = format!(
                    "mkdir -p {} && mv {} {}",
                    sh_quote(&backup_dir.display().to_string()),
                    sh_quote(&root.display().to_string()),
                    sh_quote(&target.display().to_string()),
                );
                match run_checked(self.exec, host, &command, &[]).await {
                    Ok(_) => Outcome::Ok,
                    Err(e) => Outcome::Failed(failure_label(&e)),
                }
            }
        });
        Ok(collect_report(&hosts, join_all(futures).await))
    }

    // -----------------------------------------------------------------------
    // host checks
    // -----------------------------------------------------------------------

    /// Verifies every host accepts a session, one labelled outcome per host.
    pub async fn check_hosts(&self, hosts: &[String]) -> OperationReport {
        let futures = hosts.iter().map(|host| async move {
            match self.exec.connect_check(host).await {
                Ok(()) => Outcome::Ok,
                Err(e) => Outcome::Failed(failure_label(&e)),
            }
        });
        collect_report(hosts, join_all(futures).await)
    }

    async fn run_batch(&self, host: &str, batch: &ShellBatch, allow: &[i32]) -> Outcome {
        for chunk in batch.chunks() {
            if let Err(e) = run_checked(self.exec, host, &chunk, allow).await {
                return Outcome::Failed(failure_label(&e));
            }
        }
        Outcome::Ok
    }
}

/// Short cause label for status tables.
fn failure_label(err: &Error) -> String {
    match err {
        Error::UnknownHost { .. } => "unknown host".into(),
        Error::HostUnreachable { .. } => "host unreachable".into(),
        Error::Authentication { .. } => "ssh auth failed".into(),
        Error::RemoteCommand { status, .. } => format!("command failed (exit {status})"),
        other => other.to_string(),
    }
}

fn collect_report(hosts: &[String], outcomes: Vec<Outcome>) -> OperationReport {
    let mut report = OperationReport::new();
    for (host, outcome) in hosts.iter().zip(outcomes) {
        report.push(host.clone(), outcome);
    }
    report
}

fn merge_reports(into: &mut OperationReport, from: OperationReport) {
    for row in from.rows() {
        into.push(row.host.clone(), row.outcome.clone());
    }
}
