// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A simulated fleet implementing [`RemoteRunner`] for tests.
//!
//! Each host is a small state machine (installed, active, ready, plus the
//! remote files it holds) with knobs for the interesting failure modes.
//! Mutating operations are recorded as [`SimEvent`]s so tests can assert
//! on ordering and on the absence of side effects.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};

use crate::artifact::{local_file_info, FileInfo};
use crate::config::Host;
use crate::exec::{CommandOutput, ExecError, RemoteRunner};
use crate::ops::{RemoteOp, ServiceKind};

#[derive(Clone, Debug, Default)]
pub struct SimHost {
    pub name: String,
    /// Unit files, binary, and directories all present.
    pub installed: bool,
    pub active: bool,
    pub ready: bool,
    /// Remote files by path, as written by uploads or seeded by tests.
    pub files: BTreeMap<Utf8PathBuf, FileInfo>,
    /// The installer exits zero but installs nothing.
    pub install_is_noop: bool,
    /// The server runs but never mints a join token.
    pub seed_stuck: bool,
    /// The service starts but the node never reports ready.
    pub stuck_not_ready: bool,
    /// Uploads arrive with a different digest than was sent.
    pub corrupt_uploads: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SimEvent {
    Install { host: String, kind: ServiceKind },
    Start { host: String },
    Upload { host: String, remote: Utf8PathBuf },
    WriteConfig { host: String, path: Utf8PathBuf, contents: String },
}

pub struct SimFleet {
    hosts: Mutex<BTreeMap<String, SimHost>>,
    events: Mutex<Vec<SimEvent>>,
}

fn ok(stdout: impl Into<String>) -> CommandOutput {
    CommandOutput { stdout: stdout.into(), stderr: String::new(), status: 0 }
}

fn exit_status(success: bool) -> CommandOutput {
    CommandOutput {
        stdout: String::new(),
        stderr: String::new(),
        status: if success { 0 } else { 1 },
    }
}

impl SimFleet {
    pub fn new(hosts: &[Host]) -> SimFleet {
        let hosts = hosts
            .iter()
            .map(|host| {
                (
                    host.address.clone(),
                    SimHost {
                        name: host.display_name().to_string(),
                        ..Default::default()
                    },
                )
            })
            .collect();
        SimFleet { hosts: Mutex::new(hosts), events: Mutex::new(Vec::new()) }
    }

    pub fn with_host(&self, address: &str, f: impl FnOnce(&mut SimHost)) {
        let mut hosts = self.hosts.lock().unwrap();
        f(hosts.get_mut(address).expect("unknown sim host"))
    }

    pub fn events(&self) -> Vec<SimEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn upload_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, SimEvent::Upload { .. }))
            .count()
    }

    fn record(&self, event: SimEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl RemoteRunner for SimFleet {
    async fn run(
        &self,
        host: &Host,
        op: &RemoteOp,
    ) -> Result<CommandOutput, ExecError> {
        let mut hosts = self.hosts.lock().unwrap();

        // Cluster-level probes run on the seed but answer for the fleet.
        match op {
            RemoteOp::NodeReady { node_name } => {
                let reply = hosts
                    .values()
                    .find(|sim| sim.name == *node_name)
                    .map(|sim| if sim.ready { "True" } else { "False" })
                    .unwrap_or("NotFound");
                return Ok(ok(format!("{reply}\n")));
            }
            RemoteOp::ClusterReadyCount => {
                let ready = hosts.values().filter(|sim| sim.ready).count();
                let total = hosts.len();
                return Ok(ok(format!("ready={ready} total={total}\n")));
            }
            _ => {}
        }

        let sim = hosts.get_mut(&host.address).expect("unknown sim host");
        let output = match op {
            RemoteOp::EnsureDirs { .. } => ok(""),
            RemoteOp::WriteFile { path, contents } => {
                self.record(SimEvent::WriteConfig {
                    host: host.address.clone(),
                    path: path.clone(),
                    contents: contents.clone(),
                });
                ok("")
            }
            RemoteOp::MakeExecutable { .. } => ok(""),
            RemoteOp::StatFile { path } => match sim.files.get(path) {
                Some(info) => {
                    ok(format!("present\n{}\n{}\n", info.size, info.digest))
                }
                None => ok("absent\n"),
            },
            RemoteOp::UnitFilePresent { .. }
            | RemoteOp::BinaryPresent
            | RemoteOp::DataDirsPresent => exit_status(sim.installed),
            RemoteOp::ServiceActive { .. } => exit_status(sim.active),
            RemoteOp::StartService { .. } => {
                self.record(SimEvent::Start { host: host.address.clone() });
                // Models `systemctl start --no-block`: the command itself
                // succeeds even when the service will go nowhere.
                if sim.installed {
                    sim.active = true;
                    sim.ready = !sim.stuck_not_ready;
                }
                ok("")
            }
            RemoteOp::RunInstaller { kind } => {
                self.record(SimEvent::Install {
                    host: host.address.clone(),
                    kind: *kind,
                });
                if !sim.install_is_noop {
                    sim.installed = true;
                }
                ok("")
            }
            RemoteOp::ConfigureKubectl => ok(""),
            RemoteOp::SeedReady => {
                if sim.active && !sim.seed_stuck {
                    ok("ready\n")
                } else {
                    ok("pending\n")
                }
            }
            RemoteOp::NodeReady { .. } | RemoteOp::ClusterReadyCount => {
                unreachable!("handled above")
            }
        };
        Ok(output)
    }

    async fn upload(
        &self,
        host: &Host,
        local: &Utf8Path,
        remote: &Utf8Path,
    ) -> Result<(), ExecError> {
        let mut info = local_file_info(local).await.map_err(|err| {
            ExecError::Transfer {
                host: host.address.clone(),
                local: local.to_owned(),
                remote: remote.to_owned(),
                detail: err.to_string(),
            }
        })?;
        let mut hosts = self.hosts.lock().unwrap();
        let sim = hosts.get_mut(&host.address).expect("unknown sim host");
        if sim.corrupt_uploads {
            info.digest = "0000000000000000".to_string();
        }
        sim.files.insert(remote.to_owned(), info);
        drop(hosts);
        self.record(SimEvent::Upload {
            host: host.address.clone(),
            remote: remote.to_owned(),
        });
        Ok(())
    }
}
