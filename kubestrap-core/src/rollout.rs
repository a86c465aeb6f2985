// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The phased rollout engine.
//!
//! Installation proceeds strictly sequentially, in dependency order: the
//! bootstrap seed first (it is the join target for everything else), then
//! the remaining etcd members, then dedicated control-plane nodes, then
//! workers. Every phase gates on the previous one; an unjoined etcd or
//! control-plane member would leave the cluster's quorum assumptions
//! violated, so a host failure inside a phase aborts the run.
//!
//! There is no rollback and no installer-local persistence: recovery is by
//! re-running the orchestrator, which re-probes every host and skips
//! whatever is already converged. Cancellation is cooperative; it is
//! checked between remote operations and never interrupts one in flight.

use std::fmt;
use std::time::Duration;

use camino::Utf8PathBuf;
use slog::{info, o, warn, Logger};
use tokio_util::sync::CancellationToken;

use crate::artifact::{ArtifactError, ArtifactPlan, Distributor};
use crate::config::{Config, Host};
use crate::exec::{run_checked, ExecError, RemoteRunner};
use crate::ops::{
    RemoteOp, ServiceKind, CONFIG_DROPIN_FILE, CONFIG_FILE, JOIN_PORT,
    KUBECONFIG_PATH, NODE_TOKEN_PATH, REGISTRIES_FILE,
};
use crate::probe::{ClusterStatus, NodeProber, NodeState};
use crate::retry::{poll_until, PollOutcome, RetryPolicy};
use crate::taint::recommended_taints;
use crate::topology::{Role, Topology, TopologyError};

/// Polling bounds for the two readiness waits.
#[derive(Clone, Copy, Debug)]
pub struct RolloutTunables {
    /// Seed readiness: the run cannot proceed without a live seed.
    pub seed_ready: RetryPolicy,
    /// Cluster-wide convergence: expiring is a warning, not a failure.
    pub convergence: RetryPolicy,
}

impl Default for RolloutTunables {
    fn default() -> RolloutTunables {
        RolloutTunables {
            seed_ready: RetryPolicy::new(Duration::from_secs(10), 60),
            convergence: RetryPolicy::new(Duration::from_secs(10), 12),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RolloutState {
    Init,
    SeedInstalling,
    SeedReady,
    EtcdExpanding,
    ControlPlaneExpanding,
    WorkersJoining,
    ClusterConverging,
    Done,
    Failed,
}

impl fmt::Display for RolloutState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RolloutState::Init => "initialization",
            RolloutState::SeedInstalling => "seed installation",
            RolloutState::SeedReady => "seed readiness wait",
            RolloutState::EtcdExpanding => "etcd expansion",
            RolloutState::ControlPlaneExpanding => "control-plane expansion",
            RolloutState::WorkersJoining => "worker join",
            RolloutState::ClusterConverging => "cluster convergence",
            RolloutState::Done => "done",
            RolloutState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Where downstream installers find the cluster after a successful run.
/// This is their only coupling point with the bootstrap.
#[derive(Clone, Debug)]
pub struct ClusterHandoff {
    pub seed_address: String,
    pub kubeconfig: Utf8PathBuf,
    pub join_token: Utf8PathBuf,
}

#[derive(Clone, Debug)]
pub struct RolloutReport {
    /// Terminal probed state of every host.
    pub status: ClusterStatus,
    /// Whether every joined node reported ready within the convergence
    /// bound. `false` is a warning: start latency is expected and
    /// recoverable by re-running the status check later.
    pub converged: bool,
    /// Hosts not yet ready when the run finished.
    pub not_ready: Vec<String>,
    pub handoff: ClusterHandoff,
}

#[derive(Debug, thiserror::Error)]
pub enum RolloutError {
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error("artifact distribution to {host} failed")]
    ArtifactIntegrity {
        host: String,
        #[source]
        err: ArtifactError,
    },
    #[error("bootstrap seed {host} did not become ready within {waited:?}")]
    SeedNotReadyTimeout { host: String, waited: Duration },
    #[error(
        "rollout left hosts uninstalled: {}",
        .hosts.join(", ")
    )]
    PartialRolloutFailure { hosts: Vec<String> },
    #[error("remote operation failed during {state}")]
    Command {
        state: RolloutState,
        #[source]
        err: ExecError,
    },
    #[error("rollout cancelled during {state}")]
    Cancelled { state: RolloutState },
}

enum SeedPoll {
    Ready,
    Cancelled,
}

enum ConvergePoll {
    Converged,
    Cancelled,
}

/// Parses the `ready=<n> total=<m>` reply of
/// [`RemoteOp::ClusterReadyCount`].
fn parse_ready_count(line: &str) -> Option<(usize, usize)> {
    let mut fields = line.split_whitespace();
    let ready = fields.next()?.strip_prefix("ready=")?.parse().ok()?;
    let total = fields.next()?.strip_prefix("total=")?.parse().ok()?;
    Some((ready, total))
}

pub struct RolloutEngine<'a> {
    config: &'a Config,
    topology: Topology,
    runner: &'a dyn RemoteRunner,
    tunables: RolloutTunables,
    cancel: CancellationToken,
    log: Logger,
}

impl<'a> RolloutEngine<'a> {
    pub fn new(
        config: &'a Config,
        runner: &'a dyn RemoteRunner,
        tunables: RolloutTunables,
        cancel: CancellationToken,
        log: &Logger,
    ) -> Result<RolloutEngine<'a>, RolloutError> {
        let topology = Topology::resolve(&config.hosts)?;
        Ok(RolloutEngine {
            config,
            topology,
            runner,
            tunables,
            cancel,
            log: log.new(o!("component" => "rollout")),
        })
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    fn handoff(&self) -> ClusterHandoff {
        ClusterHandoff {
            seed_address: self.topology.seed().address.clone(),
            kubeconfig: KUBECONFIG_PATH.into(),
            join_token: NODE_TOKEN_PATH.into(),
        }
    }

    fn check_cancelled(&self, state: RolloutState) -> Result<(), RolloutError> {
        if self.cancel.is_cancelled() {
            Err(RolloutError::Cancelled { state })
        } else {
            Ok(())
        }
    }

    /// Probes every host without changing anything.
    pub async fn status(&self) -> Result<ClusterStatus, ExecError> {
        NodeProber::new(self.runner, &self.topology, &self.log)
            .probe_all()
            .await
    }

    /// Runs the full phased rollout.
    pub async fn run(&self) -> Result<RolloutReport, RolloutError> {
        let prober = NodeProber::new(self.runner, &self.topology, &self.log);

        info!(
            self.log,
            "starting rollout: {} etcd (beyond the seed), {} dedicated \
             control-plane, {} workers",
            self.topology.remaining_etcd().len(),
            self.topology.dedicated_control_plane().len(),
            self.topology.workers().len();
            "seed" => self.topology.seed().display_name()
        );

        self.check_cancelled(RolloutState::Init)?;
        let status = prober.probe_all().await.map_err(|err| {
            RolloutError::Command { state: RolloutState::Init, err }
        })?;
        info!(self.log, "initial fleet state: {}", status.summary());

        if status.all_ready() {
            info!(
                self.log,
                "all nodes already ready; skipping installation phases"
            );
            return self.converge_and_report(&prober).await;
        }

        // Global artifact pass: every node gets its bundle before any
        // service is installed, so a mid-rollout failure never leaves a
        // node joined but unable to start.
        let plan = ArtifactPlan::offline_bundle(&self.config.cluster.bundle_dir);
        let distributor = Distributor::new(self.runner, &self.log);
        for host in self.topology.hosts() {
            self.check_cancelled(RolloutState::Init)?;
            distributor.distribute(host, &plan).await.map_err(|err| {
                RolloutError::ArtifactIntegrity {
                    host: host.display_name().to_string(),
                    err,
                }
            })?;
        }

        let seed = self.topology.seed();
        self.check_cancelled(RolloutState::SeedInstalling)?;
        self.install_server(&prober, seed, true, RolloutState::SeedInstalling)
            .await?;
        self.wait_for_seed(seed).await?;

        for host in self.topology.remaining_etcd() {
            self.check_cancelled(RolloutState::EtcdExpanding)?;
            self.install_server(
                &prober,
                host,
                false,
                RolloutState::EtcdExpanding,
            )
            .await?;
        }

        for host in self.topology.dedicated_control_plane() {
            self.check_cancelled(RolloutState::ControlPlaneExpanding)?;
            self.install_server(
                &prober,
                host,
                false,
                RolloutState::ControlPlaneExpanding,
            )
            .await?;
        }

        for host in self.topology.workers() {
            self.check_cancelled(RolloutState::WorkersJoining)?;
            self.install_agent(&prober, host, RolloutState::WorkersJoining)
                .await?;
        }

        self.converge_and_report(&prober).await
    }

    async fn install_server(
        &self,
        prober: &NodeProber<'_>,
        host: &Host,
        first: bool,
        state: RolloutState,
    ) -> Result<(), RolloutError> {
        self.install_node(prober, host, ServiceKind::Server, first, state)
            .await
    }

    async fn install_agent(
        &self,
        prober: &NodeProber<'_>,
        host: &Host,
        state: RolloutState,
    ) -> Result<(), RolloutError> {
        self.install_node(prober, host, ServiceKind::Agent, false, state)
            .await
    }

    async fn install_node(
        &self,
        prober: &NodeProber<'_>,
        host: &Host,
        kind: ServiceKind,
        first: bool,
        state: RolloutState,
    ) -> Result<(), RolloutError> {
        let as_command_err =
            |err| RolloutError::Command { state, err };

        let probed =
            prober.probe(host).await.map_err(as_command_err)?;
        match probed {
            NodeState::Ready => {
                info!(
                    self.log,
                    "{} is already ready; skipping",
                    host.display_name()
                );
                return Ok(());
            }
            NodeState::InstalledNotRunning | NodeState::RunningNotReady => {
                info!(
                    self.log,
                    "{} is already installed; ensuring the {kind} service \
                     is running",
                    host.display_name()
                );
                run_checked(
                    self.runner,
                    host,
                    &RemoteOp::StartService { kind },
                )
                .await
                .map_err(as_command_err)?;
            }
            NodeState::Absent => {
                info!(
                    self.log,
                    "installing {kind} on {}",
                    host.display_name()
                );
                self.write_node_config(host, kind, first)
                    .await
                    .map_err(as_command_err)?;
                run_checked(
                    self.runner,
                    host,
                    &RemoteOp::RunInstaller { kind },
                )
                .await
                .map_err(as_command_err)?;
                run_checked(
                    self.runner,
                    host,
                    &RemoteOp::StartService { kind },
                )
                .await
                .map_err(as_command_err)?;
            }
        }

        if first {
            run_checked(self.runner, host, &RemoteOp::ConfigureKubectl)
                .await
                .map_err(as_command_err)?;
        }
        Ok(())
    }

    async fn write_node_config(
        &self,
        host: &Host,
        kind: ServiceKind,
        first: bool,
    ) -> Result<(), ExecError> {
        run_checked(
            self.runner,
            host,
            &RemoteOp::WriteFile {
                path: CONFIG_FILE.into(),
                contents: self.render_main_config(host, kind, first),
            },
        )
        .await?;
        run_checked(
            self.runner,
            host,
            &RemoteOp::WriteFile {
                path: CONFIG_DROPIN_FILE.into(),
                contents: self.render_dropin_config(),
            },
        )
        .await?;
        if let Some(contents) = self.render_registries_config() {
            run_checked(
                self.runner,
                host,
                &RemoteOp::WriteFile {
                    path: REGISTRIES_FILE.into(),
                    contents,
                },
            )
            .await?;
        }
        Ok(())
    }

    /// Renders the node's primary config file. The seed gets no `server:`
    /// line; everyone else joins through the seed.
    fn render_main_config(
        &self,
        host: &Host,
        kind: ServiceKind,
        first: bool,
    ) -> String {
        let mut lines = Vec::new();
        if !first {
            lines.push(format!(
                "server: https://{}:{JOIN_PORT}",
                self.topology.join_address()
            ));
        }
        lines.push(format!("token: {}", self.config.cluster.token));
        lines.push(format!("node-name: {}", host.display_name()));
        lines.push(format!("node-ip: {}", host.internal_address()));
        if host.internal_address() != host.address {
            lines.push(format!("node-external-ip: {}", host.address));
        }

        let taints = recommended_taints(
            &host.taints,
            self.topology.is_control_plane_member(host),
            self.topology.has_dedicated_worker_pool(),
            &self.log,
        );
        if !taints.is_empty() {
            lines.push("node-taint:".to_string());
            for taint in &taints {
                lines.push(format!("  - \"{taint}\""));
            }
        }

        if kind == ServiceKind::Server {
            let etcd = self.topology.host_has_role(host, Role::Etcd);
            let control =
                self.topology.host_has_role(host, Role::ControlPlane);
            if etcd && !control {
                lines.push("disable-apiserver: true".to_string());
                lines.push("disable-controller-manager: true".to_string());
                lines.push("disable-scheduler: true".to_string());
            }
            // The seed always keeps etcd; the cluster starts there.
            if control && !etcd && !first {
                lines.push("disable-etcd: true".to_string());
            }
        }

        let mut contents = lines.join("\n");
        contents.push('\n');
        contents
    }

    fn render_dropin_config(&self) -> String {
        let mut lines =
            vec!["disable:".to_string(), "- rke2-ingress-nginx".to_string()];
        if let Some(registry) = &self.config.cluster.system_default_registry {
            lines.push(format!("system-default-registry: {registry}"));
        }
        let mut contents = lines.join("\n");
        contents.push('\n');
        contents
    }

    fn render_registries_config(&self) -> Option<String> {
        let mirror = self.config.cluster.registry_mirror.as_ref()?;
        let mut out = format!(
            "mirrors:\n  \"{}\":\n    endpoint:\n      - \"{}\"\n",
            mirror.host, mirror.endpoint
        );
        if mirror.username.is_some() || mirror.insecure_skip_verify {
            out.push_str(&format!("configs:\n  \"{}\":\n", mirror.host));
            if let Some(username) = &mirror.username {
                out.push_str(&format!(
                    "    auth:\n      username: {username}\n"
                ));
                if let Some(password) = &mirror.password {
                    out.push_str(&format!("      password: {password}\n"));
                }
            }
            if mirror.insecure_skip_verify {
                out.push_str("    tls:\n      insecure_skip_verify: true\n");
            }
        }
        Some(out)
    }

    /// Blocks until the seed's server is active and its join token is
    /// minted. Every later join targets the seed, so expiry is fatal.
    async fn wait_for_seed(&self, seed: &Host) -> Result<(), RolloutError> {
        info!(
            self.log,
            "waiting for the seed to become ready";
            "seed" => seed.display_name()
        );
        match poll_until(&self.tunables.seed_ready, |_| {
            self.seed_ready_once(seed)
        })
        .await
        {
            Ok(SeedPoll::Ready) => {
                info!(self.log, "seed is ready; proceeding with joins");
                Ok(())
            }
            Ok(SeedPoll::Cancelled) => {
                Err(RolloutError::Cancelled { state: RolloutState::SeedReady })
            }
            Err(timeout) => Err(RolloutError::SeedNotReadyTimeout {
                host: seed.display_name().to_string(),
                waited: timeout.waited,
            }),
        }
    }

    async fn seed_ready_once(&self, seed: &Host) -> PollOutcome<SeedPoll> {
        if self.cancel.is_cancelled() {
            return PollOutcome::Ready(SeedPoll::Cancelled);
        }
        match self.runner.run(seed, &RemoteOp::SeedReady).await {
            Ok(output)
                if output.success() && output.stdout.trim() == "ready" =>
            {
                PollOutcome::Ready(SeedPoll::Ready)
            }
            Ok(_) => PollOutcome::Pending,
            Err(err) => {
                warn!(self.log, "seed readiness probe failed: {err}");
                PollOutcome::Pending
            }
        }
    }

    /// Waits for every joined node to report ready, then produces the
    /// final report from a fresh probe of the whole fleet.
    async fn converge_and_report(
        &self,
        prober: &NodeProber<'_>,
    ) -> Result<RolloutReport, RolloutError> {
        let converged = self.wait_for_convergence().await;

        let status = prober.probe_all().await.map_err(|err| {
            RolloutError::Command {
                state: RolloutState::ClusterConverging,
                err,
            }
        })?;
        info!(self.log, "final fleet state: {}", status.summary());

        let stuck: Vec<String> = status
            .hosts_in(NodeState::Absent)
            .iter()
            .map(|h| h.address.clone())
            .collect();
        if !stuck.is_empty() {
            return Err(RolloutError::PartialRolloutFailure { hosts: stuck });
        }

        for host in status.hosts_in(NodeState::InstalledNotRunning) {
            warn!(
                self.log,
                "{} is installed but its service is not running; it may \
                 still be starting",
                host.name
            );
        }

        let not_ready: Vec<String> = status
            .hosts
            .iter()
            .filter(|h| h.state != NodeState::Ready)
            .map(|h| h.address.clone())
            .collect();
        if !converged && !not_ready.is_empty() {
            warn!(
                self.log,
                "cluster did not fully converge in time; not yet ready: {}",
                not_ready.join(", ")
            );
        }

        Ok(RolloutReport {
            status,
            converged,
            not_ready,
            handoff: self.handoff(),
        })
    }

    async fn wait_for_convergence(&self) -> bool {
        let seed = self.topology.seed();
        info!(self.log, "waiting for cluster convergence");
        match poll_until(&self.tunables.convergence, |attempt| {
            self.converged_once(seed, attempt)
        })
        .await
        {
            Ok(ConvergePoll::Converged) => {
                info!(self.log, "cluster converged: all nodes ready");
                true
            }
            Ok(ConvergePoll::Cancelled) => {
                warn!(self.log, "convergence wait cancelled");
                false
            }
            Err(timeout) => {
                warn!(
                    self.log,
                    "cluster convergence not reached after {:?}",
                    timeout.waited
                );
                false
            }
        }
    }

    async fn converged_once(
        &self,
        seed: &Host,
        attempt: usize,
    ) -> PollOutcome<ConvergePoll> {
        if self.cancel.is_cancelled() {
            return PollOutcome::Ready(ConvergePoll::Cancelled);
        }
        match self.runner.run(seed, &RemoteOp::ClusterReadyCount).await {
            Ok(output) if output.success() => {
                match parse_ready_count(output.stdout.trim()) {
                    Some((ready, total)) if total > 0 && ready == total => {
                        PollOutcome::Ready(ConvergePoll::Converged)
                    }
                    Some((ready, total)) => {
                        info!(
                            self.log,
                            "cluster readiness {ready}/{total}";
                            "attempt" => attempt
                        );
                        PollOutcome::Pending
                    }
                    None => {
                        warn!(
                            self.log,
                            "malformed readiness reply: {:?}",
                            output.stdout.trim()
                        );
                        PollOutcome::Pending
                    }
                }
            }
            Ok(_) => PollOutcome::Pending,
            Err(err) => {
                warn!(self.log, "convergence probe failed: {err}");
                PollOutcome::Pending
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{ClusterConfig, DatabaseConfig};
    use crate::sim::{SimEvent, SimFleet};
    use camino_tempfile::Utf8TempDir;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    fn host(address: &str, roles: &[&str]) -> Host {
        Host {
            address: address.to_string(),
            internal_address: None,
            name: None,
            user: "root".to_string(),
            password: Some("pw".to_string()),
            key_file: None,
            roles: roles.iter().map(|r| r.to_string()).collect(),
            platform_roles: Vec::new(),
            taints: Vec::new(),
        }
    }

    /// Builds a config whose bundle directory actually exists, so the
    /// artifact pass has something to distribute.
    fn test_config(hosts: Vec<Host>) -> (Config, Utf8TempDir) {
        let dir = Utf8TempDir::new().unwrap();
        for name in [
            "rke2-install.sh",
            "rke2.linux-amd64.tar.gz",
            "sha256sum-amd64.txt",
            "rke2-images-linux.tar",
        ] {
            std::fs::write(dir.path().join(name), name).unwrap();
        }
        let config = Config {
            hosts,
            cluster: ClusterConfig {
                bundle_dir: dir.path().to_path_buf(),
                token: "test-token".to_string(),
                system_default_registry: None,
                registry_mirror: None,
            },
            database: DatabaseConfig::default(),
        };
        (config, dir)
    }

    fn engine<'a>(
        config: &'a Config,
        fleet: &'a SimFleet,
        cancel: CancellationToken,
        log: &Logger,
    ) -> RolloutEngine<'a> {
        RolloutEngine::new(
            config,
            fleet,
            RolloutTunables::default(),
            cancel,
            log,
        )
        .unwrap()
    }

    fn install_order(fleet: &SimFleet) -> Vec<String> {
        fleet
            .events()
            .into_iter()
            .filter_map(|event| match event {
                SimEvent::Install { host, .. } => Some(host),
                _ => None,
            })
            .collect()
    }

    fn written_config(fleet: &SimFleet, host: &str) -> String {
        fleet
            .events()
            .into_iter()
            .find_map(|event| match event {
                SimEvent::WriteConfig { host: h, path, contents }
                    if h == host && path == CONFIG_FILE =>
                {
                    Some(contents)
                }
                _ => None,
            })
            .expect("no config written for host")
    }

    #[tokio::test(start_paused = true)]
    async fn rollout_follows_phase_order_regardless_of_declaration() {
        let hosts = vec![
            host("w1", &["worker"]),
            host("e1", &["etcd", "master"]),
            host("cp1", &["master"]),
            host("e2", &["etcd"]),
        ];
        let (config, _dir) = test_config(hosts);
        let fleet = SimFleet::new(&config.hosts);
        let log = test_logger();
        let engine = engine(&config, &fleet, CancellationToken::new(), &log);

        let report = engine.run().await.unwrap();
        assert!(report.converged);
        assert!(report.status.all_ready());
        assert_eq!(install_order(&fleet), vec!["e1", "e2", "cp1", "w1"]);
        assert_eq!(report.handoff.seed_address, "e1");
        assert_eq!(report.handoff.kubeconfig, KUBECONFIG_PATH);
        assert_eq!(report.handoff.join_token, NODE_TOKEN_PATH);

        // The seed bootstraps without a join target; everyone else joins
        // through it.
        let seed_config = written_config(&fleet, "e1");
        assert!(!seed_config.contains("server:"));
        assert!(seed_config.contains("token: test-token"));
        let join_config = written_config(&fleet, "e2");
        assert!(join_config.contains("server: https://e1:9345"));
    }

    #[tokio::test(start_paused = true)]
    async fn control_plane_hosts_get_hard_taint_with_worker_pool() {
        let hosts = vec![
            host("h1", &["etcd", "master"]),
            host("h2", &["master"]),
            host("h3", &["worker"]),
        ];
        let (config, _dir) = test_config(hosts);
        let fleet = SimFleet::new(&config.hosts);
        let log = test_logger();
        let engine = engine(&config, &fleet, CancellationToken::new(), &log);

        engine.run().await.unwrap();
        assert_eq!(install_order(&fleet), vec!["h1", "h2", "h3"]);
        for h in ["h1", "h2"] {
            let contents = written_config(&fleet, h);
            assert!(contents.contains(
                "node-role.kubernetes.io/control-plane:NoSchedule"
            ));
            assert!(!contents.contains("PreferNoSchedule"));
        }
        assert!(!written_config(&fleet, "h3").contains("node-taint"));
    }

    #[tokio::test(start_paused = true)]
    async fn all_in_one_host_gets_soft_taint() {
        let hosts = vec![host("h1", &["etcd", "master", "worker"])];
        let (config, _dir) = test_config(hosts);
        let fleet = SimFleet::new(&config.hosts);
        let log = test_logger();
        let engine = engine(&config, &fleet, CancellationToken::new(), &log);

        engine.run().await.unwrap();
        assert_eq!(install_order(&fleet), vec!["h1"]);
        let contents = written_config(&fleet, "h1");
        assert!(contents.contains(
            "node-role.kubernetes.io/control-plane:PreferNoSchedule"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn converged_cluster_is_not_touched_again() {
        let hosts =
            vec![host("e1", &["etcd", "master"]), host("w1", &["worker"])];
        let (config, _dir) = test_config(hosts);
        let fleet = SimFleet::new(&config.hosts);
        for address in ["e1", "w1"] {
            fleet.with_host(address, |sim| {
                sim.installed = true;
                sim.active = true;
                sim.ready = true;
            });
        }
        let log = test_logger();
        let engine = engine(&config, &fleet, CancellationToken::new(), &log);

        let report = engine.run().await.unwrap();
        assert!(report.converged);
        assert!(install_order(&fleet).is_empty());
        assert_eq!(fleet.upload_count(), 0);
        assert!(!fleet
            .events()
            .iter()
            .any(|e| matches!(e, SimEvent::Start { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn installed_hosts_are_restarted_not_reinstalled() {
        let hosts =
            vec![host("e1", &["etcd", "master"]), host("w1", &["worker"])];
        let (config, _dir) = test_config(hosts);
        let fleet = SimFleet::new(&config.hosts);
        fleet.with_host("w1", |sim| sim.installed = true);
        let log = test_logger();
        let engine = engine(&config, &fleet, CancellationToken::new(), &log);

        let report = engine.run().await.unwrap();
        assert!(report.converged);
        // Only the seed needed a full install.
        assert_eq!(install_order(&fleet), vec!["e1"]);
        assert!(fleet
            .events()
            .iter()
            .any(|e| matches!(e, SimEvent::Start { host } if host == "w1")));
    }

    #[tokio::test(start_paused = true)]
    async fn host_stuck_absent_is_a_partial_rollout_failure() {
        let hosts =
            vec![host("e1", &["etcd", "master"]), host("w1", &["worker"])];
        let (config, _dir) = test_config(hosts);
        let fleet = SimFleet::new(&config.hosts);
        // The installer claims success but installs nothing.
        fleet.with_host("w1", |sim| sim.install_is_noop = true);
        let log = test_logger();
        let engine = engine(&config, &fleet, CancellationToken::new(), &log);

        let err = engine.run().await.unwrap_err();
        match err {
            RolloutError::PartialRolloutFailure { hosts } => {
                assert_eq!(hosts, vec!["w1".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn seed_that_never_readies_aborts_the_run() {
        let hosts =
            vec![host("e1", &["etcd", "master"]), host("w1", &["worker"])];
        let (config, _dir) = test_config(hosts);
        let fleet = SimFleet::new(&config.hosts);
        fleet.with_host("e1", |sim| sim.seed_stuck = true);
        let log = test_logger();
        let engine = engine(&config, &fleet, CancellationToken::new(), &log);

        let err = engine.run().await.unwrap_err();
        assert!(matches!(
            err,
            RolloutError::SeedNotReadyTimeout { ref host, .. } if host == "e1"
        ));
        // No join was attempted without a live seed.
        assert_eq!(install_order(&fleet), vec!["e1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn convergence_timeout_degrades_to_a_warning() {
        let hosts =
            vec![host("e1", &["etcd", "master"]), host("w1", &["worker"])];
        let (config, _dir) = test_config(hosts);
        let fleet = SimFleet::new(&config.hosts);
        // The worker's service starts but the node never reports ready.
        fleet.with_host("w1", |sim| sim.stuck_not_ready = true);
        let log = test_logger();
        let engine = engine(&config, &fleet, CancellationToken::new(), &log);

        let report = engine.run().await.unwrap();
        assert!(!report.converged);
        assert_eq!(report.not_ready, vec!["w1".to_string()]);
        assert_eq!(
            report.status.hosts_in(NodeState::RunningNotReady)[0].address,
            "w1"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_the_run_before_the_next_operation() {
        let hosts = vec![host("e1", &["etcd", "master"])];
        let (config, _dir) = test_config(hosts);
        let fleet = SimFleet::new(&config.hosts);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let log = test_logger();
        let engine = engine(&config, &fleet, cancel, &log);

        let err = engine.run().await.unwrap_err();
        assert!(matches!(err, RolloutError::Cancelled { .. }));
        assert!(install_order(&fleet).is_empty());
    }

    #[test]
    fn ready_count_replies_parse_strictly() {
        assert_eq!(parse_ready_count("ready=2 total=3"), Some((2, 3)));
        assert_eq!(parse_ready_count("ready=0 total=0"), Some((0, 0)));
        assert_eq!(parse_ready_count("2/3 ready"), None);
        assert_eq!(parse_ready_count(""), None);
        assert_eq!(parse_ready_count("ready=x total=3"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn dedicated_role_hosts_disable_unused_components() {
        let hosts = vec![
            host("seed", &["etcd"]),
            host("e2", &["etcd"]),
            host("cp1", &["master"]),
        ];
        let (config, _dir) = test_config(hosts);
        let fleet = SimFleet::new(&config.hosts);
        let log = test_logger();
        let engine = engine(&config, &fleet, CancellationToken::new(), &log);
        engine.run().await.unwrap();

        // Dedicated etcd members run no control-plane components; the
        // seed keeps etcd either way.
        let e2 = written_config(&fleet, "e2");
        assert!(e2.contains("disable-apiserver: true"));
        let cp1 = written_config(&fleet, "cp1");
        assert!(cp1.contains("disable-etcd: true"));
        let seed = written_config(&fleet, "seed");
        assert!(!seed.contains("disable-etcd: true"));
    }
}
