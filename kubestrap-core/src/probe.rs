// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Node installation-state probing.
//!
//! No single remote signal is trustworthy: partial installs, stale unit
//! files, and external cleanup all occur in practice. A node's state is
//! therefore folded from four independently-verified facts (unit file,
//! binary, directories, service activity), plus a cluster-level readiness
//! check obtained from the seed. State is recomputed from the host on
//! every probe and never cached across runs, so a killed and restarted
//! orchestrator re-derives everything.

use std::fmt;

use slog::{debug, o, Logger};

use crate::config::Host;
use crate::exec::{ExecError, RemoteRunner};
use crate::ops::RemoteOp;
use crate::topology::Topology;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    Absent,
    InstalledNotRunning,
    RunningNotReady,
    Ready,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::Absent => "absent",
            NodeState::InstalledNotRunning => "installed, not running",
            NodeState::RunningNotReady => "running, not ready",
            NodeState::Ready => "ready",
        };
        write!(f, "{}", s)
    }
}

/// The four independent installation signals gathered from a host.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InstallSignals {
    pub unit_file: bool,
    pub binary: bool,
    pub directories: bool,
    pub service_active: bool,
}

impl InstallSignals {
    /// Folds the signals, ignoring cluster-level readiness: an active
    /// service is at least running; a complete install without an active
    /// service is installed; anything else (including residue from a
    /// partial install) counts as absent.
    pub fn fold(&self) -> NodeState {
        if self.service_active {
            NodeState::RunningNotReady
        } else if self.unit_file && self.binary && self.directories {
            NodeState::InstalledNotRunning
        } else {
            NodeState::Absent
        }
    }
}

#[derive(Clone, Debug)]
pub struct HostStatus {
    pub address: String,
    pub name: String,
    pub state: NodeState,
}

/// A point-in-time view of every host's probed state.
#[derive(Clone, Debug)]
pub struct ClusterStatus {
    pub hosts: Vec<HostStatus>,
}

impl ClusterStatus {
    pub fn all_ready(&self) -> bool {
        self.hosts.iter().all(|h| h.state == NodeState::Ready)
    }

    pub fn count(&self, state: NodeState) -> usize {
        self.hosts.iter().filter(|h| h.state == state).count()
    }

    pub fn hosts_in(&self, state: NodeState) -> Vec<&HostStatus> {
        self.hosts.iter().filter(|h| h.state == state).collect()
    }

    /// One-line summary for logging.
    pub fn summary(&self) -> String {
        let total = self.hosts.len();
        format!(
            "{}/{total} ready, {}/{total} running not ready, \
             {}/{total} installed not running, {}/{total} absent",
            self.count(NodeState::Ready),
            self.count(NodeState::RunningNotReady),
            self.count(NodeState::InstalledNotRunning),
            self.count(NodeState::Absent),
        )
    }
}

pub struct NodeProber<'a> {
    runner: &'a dyn RemoteRunner,
    topology: &'a Topology,
    log: Logger,
}

impl<'a> NodeProber<'a> {
    pub fn new(
        runner: &'a dyn RemoteRunner,
        topology: &'a Topology,
        log: &Logger,
    ) -> NodeProber<'a> {
        NodeProber {
            runner,
            topology,
            log: log.new(o!("component" => "probe")),
        }
    }

    async fn signal(
        &self,
        host: &Host,
        op: RemoteOp,
    ) -> Result<bool, ExecError> {
        Ok(self.runner.run(host, &op).await?.success())
    }

    pub async fn gather_signals(
        &self,
        host: &Host,
    ) -> Result<InstallSignals, ExecError> {
        let kind = self.topology.service_kind(host);
        Ok(InstallSignals {
            unit_file: self
                .signal(host, RemoteOp::UnitFilePresent { kind })
                .await?,
            binary: self.signal(host, RemoteOp::BinaryPresent).await?,
            directories: self.signal(host, RemoteOp::DataDirsPresent).await?,
            service_active: self
                .signal(host, RemoteOp::ServiceActive { kind })
                .await?,
        })
    }

    pub async fn probe(&self, host: &Host) -> Result<NodeState, ExecError> {
        let signals = self.gather_signals(host).await?;
        let state = match signals.fold() {
            NodeState::RunningNotReady => {
                if self.node_ready(host).await? {
                    NodeState::Ready
                } else {
                    NodeState::RunningNotReady
                }
            }
            other => other,
        };
        debug!(
            self.log,
            "probed {}: {state}",
            host.display_name();
            "signals" => ?signals
        );
        Ok(state)
    }

    /// Queries the node's Ready condition through the seed. Advisory: any
    /// failure to ask (or an unknown node) reads as not ready.
    async fn node_ready(&self, host: &Host) -> Result<bool, ExecError> {
        let op = RemoteOp::NodeReady {
            node_name: host.display_name().to_string(),
        };
        let output = self.runner.run(self.topology.seed(), &op).await?;
        Ok(output.success() && output.stdout.trim() == "True")
    }

    pub async fn probe_all(&self) -> Result<ClusterStatus, ExecError> {
        let mut hosts = Vec::with_capacity(self.topology.hosts().len());
        for host in self.topology.hosts() {
            let state = self.probe(host).await?;
            hosts.push(HostStatus {
                address: host.address.clone(),
                name: host.display_name().to_string(),
                state,
            });
        }
        Ok(ClusterStatus { hosts })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::SimFleet;

    #[test]
    fn signals_fold_to_states() {
        let cases = [
            (InstallSignals::default(), NodeState::Absent),
            (
                // Residue: binary present but no unit files or directories.
                InstallSignals { binary: true, ..Default::default() },
                NodeState::Absent,
            ),
            (
                InstallSignals {
                    unit_file: true,
                    binary: true,
                    directories: true,
                    service_active: false,
                },
                NodeState::InstalledNotRunning,
            ),
            (
                // Activity wins even if other signals look incomplete.
                InstallSignals {
                    service_active: true,
                    ..Default::default()
                },
                NodeState::RunningNotReady,
            ),
        ];
        for (signals, expected) in cases {
            assert_eq!(signals.fold(), expected, "signals: {signals:?}");
        }
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

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    #[tokio::test]
    async fn probe_distinguishes_running_from_ready() {
        let hosts =
            vec![host("seed", &["etcd", "master"]), host("w1", &["worker"])];
        let topology = Topology::resolve(&hosts).unwrap();
        let fleet = SimFleet::new(&hosts);
        fleet.with_host("seed", |sim| {
            sim.installed = true;
            sim.active = true;
            sim.ready = true;
        });
        fleet.with_host("w1", |sim| {
            sim.installed = true;
            sim.active = true;
            sim.ready = false;
        });

        let log = test_logger();
        let prober = NodeProber::new(&fleet, &topology, &log);
        assert_eq!(prober.probe(&hosts[0]).await.unwrap(), NodeState::Ready);
        assert_eq!(
            prober.probe(&hosts[1]).await.unwrap(),
            NodeState::RunningNotReady
        );

        let status = prober.probe_all().await.unwrap();
        assert!(!status.all_ready());
        assert_eq!(status.count(NodeState::Ready), 1);
        assert_eq!(status.hosts_in(NodeState::RunningNotReady)[0].address, "w1");
    }

    #[tokio::test]
    async fn probe_reports_installed_and_absent_hosts() {
        let hosts =
            vec![host("seed", &["etcd"]), host("w1", &["worker"])];
        let topology = Topology::resolve(&hosts).unwrap();
        let fleet = SimFleet::new(&hosts);
        fleet.with_host("seed", |sim| sim.installed = true);

        let log = test_logger();
        let prober = NodeProber::new(&fleet, &topology, &log);
        assert_eq!(
            prober.probe(&hosts[0]).await.unwrap(),
            NodeState::InstalledNotRunning
        );
        assert_eq!(prober.probe(&hosts[1]).await.unwrap(), NodeState::Absent);
    }
}
