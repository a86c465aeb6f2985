// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Remote execution over SSH.
//!
//! [`RemoteRunner`] is the seam between the orchestrator and the fleet:
//! production code uses [`SshRunner`] (child `ssh`/`rsync`/`scp`
//! processes), tests substitute a simulated fleet. Every remote operation
//! is a blocking call with a bounded timeout; there is no concurrency
//! across hosts.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use slog::{debug, o, warn, Logger};
use tokio::process::Command;

use crate::config::Host;
use crate::ops::RemoteOp;

const SSH_OPTIONS: &[&str] = &[
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "UserKnownHostsFile=/dev/null",
];

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Clone, Copy, Debug)]
pub enum Credential<'a> {
    Password(&'a str),
    KeyFile(&'a Utf8Path),
    /// Ambient credentials: an agent or default keys.
    Agent,
}

#[derive(Clone, Debug)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Combined output with trailing whitespace trimmed, for error context.
    pub fn detail(&self) -> String {
        let mut detail = self.stdout.trim_end().to_string();
        let stderr = self.stderr.trim_end();
        if !stderr.is_empty() {
            if !detail.is_empty() {
                detail.push('\n');
            }
            detail.push_str(stderr);
        }
        detail
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("failed to spawn {program}")]
    Spawn {
        program: String,
        #[source]
        err: std::io::Error,
    },
    #[error("{intent} on {host} failed with status {status}: {detail}")]
    CommandFailed { host: String, intent: String, status: i32, detail: String },
    #[error("{intent} on {host} timed out after {after:?}")]
    Timeout { host: String, intent: String, after: Duration },
    #[error("{intent} on {host} produced unparseable output: {output:?}")]
    MalformedProbe { host: String, intent: String, output: String },
    #[error("transfer of {local} to {host}:{remote} failed: {detail}")]
    Transfer {
        host: String,
        local: Utf8PathBuf,
        remote: Utf8PathBuf,
        detail: String,
    },
}

/// Runs remote operations and file transfers against one host at a time.
#[async_trait]
pub trait RemoteRunner: Send + Sync {
    /// Runs one operation, returning combined output and exit status.
    /// A non-zero exit is not an error at this layer; advisory call sites
    /// interpret the status themselves.
    async fn run(
        &self,
        host: &Host,
        op: &RemoteOp,
    ) -> Result<CommandOutput, ExecError>;

    /// Copies a local file to `remote` on the host.
    async fn upload(
        &self,
        host: &Host,
        local: &Utf8Path,
        remote: &Utf8Path,
    ) -> Result<(), ExecError>;
}

/// Runs an operation whose success is required, mapping a non-zero exit to
/// [`ExecError::CommandFailed`] with host and operation context.
pub async fn run_checked(
    runner: &dyn RemoteRunner,
    host: &Host,
    op: &RemoteOp,
) -> Result<CommandOutput, ExecError> {
    let output = runner.run(host, op).await?;
    if output.success() {
        Ok(output)
    } else {
        Err(ExecError::CommandFailed {
            host: host.display_name().to_string(),
            intent: op.intent(),
            status: output.status,
            detail: output.detail(),
        })
    }
}

/// Production runner: `ssh` for commands, `rsync` (falling back to `scp`)
/// for transfers.
pub struct SshRunner {
    log: Logger,
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl SshRunner {
    pub fn new(log: &Logger) -> SshRunner {
        SshRunner {
            log: log.new(o!("component" => "ssh")),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    fn destination(host: &Host) -> String {
        format!("{}@{}", host.user, host.address)
    }

    async fn tool_available(tool: &str) -> bool {
        Command::new(tool)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .is_ok()
    }

    fn connect_timeout_opt(&self) -> String {
        format!("ConnectTimeout={}", self.connect_timeout.as_secs())
    }

    /// Builds the ssh invocation for `script`, honoring the host's
    /// credential. Password mode relies on sshpass; without it we fall
    /// back to letting ssh prompt interactively.
    async fn ssh_command(&self, host: &Host, script: &str) -> Command {
        let destination = Self::destination(host);
        let connect_timeout = self.connect_timeout_opt();
        match host.credential() {
            Credential::Password(password) => {
                if Self::tool_available("sshpass").await {
                    let mut cmd = Command::new("sshpass");
                    cmd.args(["-p", password, "ssh"]);
                    cmd.args(SSH_OPTIONS);
                    cmd.args(["-o", connect_timeout.as_str()]);
                    cmd.arg(&destination);
                    cmd.arg(script);
                    cmd
                } else {
                    warn!(
                        self.log,
                        "sshpass not found; falling back to an interactive \
                         password prompt";
                        "host" => host.display_name()
                    );
                    let mut cmd = Command::new("ssh");
                    cmd.args(SSH_OPTIONS);
                    cmd.args(["-o", "BatchMode=no"]);
                    cmd.args(["-o", connect_timeout.as_str()]);
                    cmd.arg(&destination);
                    cmd.arg(script);
                    cmd.stdin(Stdio::inherit());
                    cmd
                }
            }
            Credential::KeyFile(key_file) => {
                let mut cmd = Command::new("ssh");
                cmd.args(["-i", key_file.as_str()]);
                cmd.args(SSH_OPTIONS);
                cmd.args(["-o", connect_timeout.as_str()]);
                cmd.arg(&destination);
                cmd.arg(script);
                cmd
            }
            Credential::Agent => {
                let mut cmd = Command::new("ssh");
                cmd.args(SSH_OPTIONS);
                cmd.args(["-o", connect_timeout.as_str()]);
                cmd.arg(&destination);
                cmd.arg(script);
                cmd
            }
        }
    }

    /// rsync invocation, or `None` when rsync cannot work here (missing
    /// entirely, or password auth without sshpass).
    async fn rsync_command(
        &self,
        host: &Host,
        local: &Utf8Path,
        remote: &Utf8Path,
    ) -> Option<Command> {
        if !Self::tool_available("rsync").await {
            return None;
        }
        let target = format!("{}:{}", Self::destination(host), remote);
        let transport = match host.credential() {
            Credential::Password(_) => {
                if !Self::tool_available("sshpass").await {
                    return None;
                }
                format!("ssh {}", SSH_OPTIONS.join(" "))
            }
            Credential::KeyFile(key_file) => {
                format!("ssh -i {} {}", key_file, SSH_OPTIONS.join(" "))
            }
            Credential::Agent => format!("ssh {}", SSH_OPTIONS.join(" ")),
        };
        let mut cmd = match host.credential() {
            Credential::Password(password) => {
                let mut cmd = Command::new("sshpass");
                cmd.args(["-p", password, "rsync"]);
                cmd
            }
            _ => Command::new("rsync"),
        };
        cmd.args(["--compress", "--partial", "--inplace"]);
        cmd.args(["-e", transport.as_str()]);
        cmd.arg(local.as_str());
        cmd.arg(&target);
        Some(cmd)
    }

    fn scp_command(
        &self,
        host: &Host,
        local: &Utf8Path,
        remote: &Utf8Path,
    ) -> Command {
        let target = format!("{}:{}", Self::destination(host), remote);
        let mut cmd = match host.credential() {
            Credential::Password(password) => {
                let mut cmd = Command::new("sshpass");
                cmd.args(["-p", password, "scp"]);
                cmd
            }
            _ => Command::new("scp"),
        };
        cmd.arg("-C");
        if let Credential::KeyFile(key_file) = host.credential() {
            cmd.args(["-i", key_file.as_str()]);
        }
        cmd.args(SSH_OPTIONS);
        cmd.arg(local.as_str());
        cmd.arg(&target);
        cmd
    }

    async fn output(
        &self,
        mut cmd: Command,
        program: &str,
    ) -> Result<CommandOutput, ExecError> {
        let output = cmd.output().await.map_err(|err| ExecError::Spawn {
            program: program.to_string(),
            err,
        })?;
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            status: output.status.code().unwrap_or(-1),
        })
    }
}

#[async_trait]
impl RemoteRunner for SshRunner {
    async fn run(
        &self,
        host: &Host,
        op: &RemoteOp,
    ) -> Result<CommandOutput, ExecError> {
        debug!(
            self.log,
            "running remote operation";
            "host" => host.display_name(),
            "intent" => op.intent()
        );
        let cmd = self.ssh_command(host, &op.render()).await;
        let timeout = self.command_timeout;
        match tokio::time::timeout(timeout, self.output(cmd, "ssh")).await {
            Ok(result) => result,
            Err(_) => Err(ExecError::Timeout {
                host: host.display_name().to_string(),
                intent: op.intent(),
                after: timeout,
            }),
        }
    }

    async fn upload(
        &self,
        host: &Host,
        local: &Utf8Path,
        remote: &Utf8Path,
    ) -> Result<(), ExecError> {
        if let Some(cmd) = self.rsync_command(host, local, remote).await {
            match self.output(cmd, "rsync").await {
                Ok(output) if output.success() => return Ok(()),
                Ok(output) => {
                    debug!(
                        self.log,
                        "rsync failed (status {}); falling back to scp",
                        output.status;
                        "host" => host.display_name()
                    );
                }
                Err(err) => {
                    debug!(
                        self.log,
                        "rsync unavailable ({err}); falling back to scp";
                        "host" => host.display_name()
                    );
                }
            }
        }
        let output = self
            .output(self.scp_command(host, local, remote), "scp")
            .await?;
        if output.success() {
            Ok(())
        } else {
            Err(ExecError::Transfer {
                host: host.display_name().to_string(),
                local: local.to_owned(),
                remote: remote.to_owned(),
                detail: output.detail(),
            })
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn command_output_detail_combines_streams() {
        let output = CommandOutput {
            stdout: "out\n".to_string(),
            stderr: "err\n".to_string(),
            status: 1,
        };
        assert!(!output.success());
        assert_eq!(output.detail(), "out\nerr");

        let output = CommandOutput {
            stdout: String::new(),
            stderr: "only stderr".to_string(),
            status: 0,
        };
        assert!(output.success());
        assert_eq!(output.detail(), "only stderr");
    }
}
