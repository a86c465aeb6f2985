// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed remote operations.
//!
//! The target-environment contract is POSIX shell over SSH, but commands
//! are constructed as data ([`RemoteOp`]) and rendered to shell fragments
//! only at the execution boundary. Probes have a structured output
//! contract: a sentinel token or a fixed line format, judged by exact
//! comparison, never by grepping free-form log text.

use camino::Utf8PathBuf;

/// Remote filesystem layout. A killed and restarted run re-derives all
/// state from these paths; nothing is persisted on the orchestrating
/// machine.
pub const CONFIG_DIR: &str = "/etc/rancher/rke2";
pub const CONFIG_FILE: &str = "/etc/rancher/rke2/config.yaml";
pub const CONFIG_DROPIN_DIR: &str = "/etc/rancher/rke2/config.yaml.d";
pub const CONFIG_DROPIN_FILE: &str =
    "/etc/rancher/rke2/config.yaml.d/00-kubestrap.yaml";
pub const REGISTRIES_FILE: &str = "/etc/rancher/rke2/registries.yaml";
pub const DATA_DIR: &str = "/var/lib/rancher/rke2";
pub const LOG_DIR: &str = "/var/log/rke2";
pub const AGENT_IMAGES_DIR: &str = "/var/lib/rancher/rke2/agent/images";
pub const STAGING_DIR: &str = "/tmp/rke2-artifacts";
pub const INSTALL_SCRIPT: &str = "/tmp/rke2-artifacts/rke2-install.sh";
pub const BIN_PRIMARY: &str = "/usr/local/bin/rke2";
pub const BIN_BUNDLED: &str = "/var/lib/rancher/rke2/bin/rke2";
pub const KUBECTL_BIN: &str = "/var/lib/rancher/rke2/bin/kubectl";
pub const KUBECONFIG_PATH: &str = "/etc/rancher/rke2/rke2.yaml";
pub const NODE_TOKEN_PATH: &str = "/var/lib/rancher/rke2/server/node-token";
pub const JOIN_PORT: u16 = 9345;

/// Which service a host runs: control-plane members run the server, pure
/// workers run the agent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceKind {
    Server,
    Agent,
}

impl ServiceKind {
    pub fn unit(&self) -> &'static str {
        match self {
            ServiceKind::Server => "rke2-server",
            ServiceKind::Agent => "rke2-agent",
        }
    }

    pub fn install_type(&self) -> &'static str {
        match self {
            ServiceKind::Server => "server",
            ServiceKind::Agent => "agent",
        }
    }
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.install_type())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RemoteOp {
    /// `mkdir -p` over a fixed set of directories.
    EnsureDirs { dirs: Vec<Utf8PathBuf> },
    /// Write a file verbatim via a quoted heredoc, creating its parent.
    WriteFile { path: Utf8PathBuf, contents: String },
    MakeExecutable { path: Utf8PathBuf },
    /// Size + SHA-256 probe. Reply is `absent`, or `present` followed by a
    /// size line and a digest line.
    StatFile { path: Utf8PathBuf },
    /// Whether a unit file for the role exists in either systemd directory.
    UnitFilePresent { kind: ServiceKind },
    /// Whether the runtime binary exists at either install location.
    BinaryPresent,
    /// Whether the data and config directories both exist.
    DataDirsPresent,
    ServiceActive { kind: ServiceKind },
    /// Enable the unit and start it without blocking.
    StartService { kind: ServiceKind },
    /// Run the offline install script out of the staging directory.
    RunInstaller { kind: ServiceKind },
    /// On the seed: copy the generated kubeconfig into root's home and
    /// stage the bundled kubectl once it appears.
    ConfigureKubectl,
    /// On the seed: server unit active and join token minted. Replies
    /// `ready` or `pending`.
    SeedReady,
    /// On the seed: the Ready condition of one node. Replies `True`,
    /// `False`, or `NotFound`.
    NodeReady { node_name: String },
    /// On the seed: `ready=<n> total=<m>` across all joined nodes.
    ClusterReadyCount,
}

impl RemoteOp {
    /// Short description used for logging and error context.
    pub fn intent(&self) -> String {
        match self {
            RemoteOp::EnsureDirs { .. } => {
                "create remote directories".to_string()
            }
            RemoteOp::WriteFile { path, .. } => format!("write {path}"),
            RemoteOp::MakeExecutable { path } => {
                format!("mark {path} executable")
            }
            RemoteOp::StatFile { path } => format!("probe {path}"),
            RemoteOp::UnitFilePresent { kind } => {
                format!("check for {} unit file", kind.unit())
            }
            RemoteOp::BinaryPresent => "check for runtime binary".to_string(),
            RemoteOp::DataDirsPresent => {
                "check for data directories".to_string()
            }
            RemoteOp::ServiceActive { kind } => {
                format!("check whether {} is active", kind.unit())
            }
            RemoteOp::StartService { kind } => {
                format!("start {}", kind.unit())
            }
            RemoteOp::RunInstaller { kind } => {
                format!("run the {kind} installer")
            }
            RemoteOp::ConfigureKubectl => {
                "configure kubectl on the seed".to_string()
            }
            RemoteOp::SeedReady => "check seed readiness".to_string(),
            RemoteOp::NodeReady { node_name } => {
                format!("check readiness of node {node_name}")
            }
            RemoteOp::ClusterReadyCount => "count ready nodes".to_string(),
        }
    }

    /// Renders the operation to the POSIX shell fragment executed on the
    /// remote host.
    pub fn render(&self) -> String {
        match self {
            RemoteOp::EnsureDirs { dirs } => {
                let dirs: Vec<&str> =
                    dirs.iter().map(|d| d.as_str()).collect();
                format!("mkdir -p {}", dirs.join(" "))
            }
            RemoteOp::WriteFile { path, contents } => {
                let parent =
                    path.parent().map(|p| p.as_str()).unwrap_or("/");
                format!(
                    "mkdir -p {parent}\n\
                     cat > {path} << 'EOF'\n\
                     {}\n\
                     EOF\n",
                    contents.trim_end()
                )
            }
            RemoteOp::MakeExecutable { path } => format!("chmod +x {path}"),
            RemoteOp::StatFile { path } => format!(
                "if [ -f \"{path}\" ]; then\n\
                 \x20   echo present\n\
                 \x20   stat -c %s \"{path}\"\n\
                 \x20   sha256sum \"{path}\" | awk '{{print $1}}'\n\
                 else\n\
                 \x20   echo absent\n\
                 fi\n"
            ),
            RemoteOp::UnitFilePresent { kind } => {
                let unit = kind.unit();
                format!(
                    "test -f /etc/systemd/system/{unit}.service || \
                     test -f /usr/lib/systemd/system/{unit}.service"
                )
            }
            RemoteOp::BinaryPresent => {
                format!("test -x {BIN_PRIMARY} || test -x {BIN_BUNDLED}")
            }
            RemoteOp::DataDirsPresent => {
                format!("test -d {DATA_DIR} && test -d {CONFIG_DIR}")
            }
            RemoteOp::ServiceActive { kind } => {
                format!("systemctl is-active --quiet {}", kind.unit())
            }
            RemoteOp::StartService { kind } => {
                let unit = kind.unit();
                format!(
                    "systemctl enable {unit}\n\
                     systemctl start --no-block {unit}\n"
                )
            }
            RemoteOp::RunInstaller { kind } => format!(
                "if [ ! -f {INSTALL_SCRIPT} ]; then\n\
                 \x20   echo 'install script missing' >&2\n\
                 \x20   exit 1\n\
                 fi\n\
                 INSTALL_RKE2_TYPE={} \
                 INSTALL_RKE2_ARTIFACT_PATH={STAGING_DIR} \
                 {INSTALL_SCRIPT}\n",
                kind.install_type()
            ),
            RemoteOp::ConfigureKubectl => format!(
                "mkdir -p /root/.kube\n\
                 timeout=120\n\
                 while [ $timeout -gt 0 ]; do\n\
                 \x20   [ -f {KUBECONFIG_PATH} ] && break\n\
                 \x20   sleep 5\n\
                 \x20   timeout=$((timeout - 5))\n\
                 done\n\
                 if [ ! -f {KUBECONFIG_PATH} ]; then\n\
                 \x20   echo 'kubeconfig was not generated' >&2\n\
                 \x20   exit 1\n\
                 fi\n\
                 cp {KUBECONFIG_PATH} /root/.kube/config\n\
                 chmod 600 /root/.kube/config\n\
                 timeout=180\n\
                 while [ $timeout -gt 0 ]; do\n\
                 \x20   if [ -f {KUBECTL_BIN} ]; then\n\
                 \x20       cp {KUBECTL_BIN} /usr/local/bin/kubectl\n\
                 \x20       chmod +x /usr/local/bin/kubectl\n\
                 \x20       ln -sf /usr/local/bin/kubectl /usr/bin/kubectl\n\
                 \x20       break\n\
                 \x20   fi\n\
                 \x20   sleep 5\n\
                 \x20   timeout=$((timeout - 5))\n\
                 done\n"
            ),
            RemoteOp::SeedReady => format!(
                "if systemctl is-active --quiet rke2-server && \
                 [ -f {NODE_TOKEN_PATH} ]; then\n\
                 \x20   echo ready\n\
                 else\n\
                 \x20   echo pending\n\
                 fi\n"
            ),
            RemoteOp::NodeReady { node_name } => format!(
                "export KUBECONFIG={KUBECONFIG_PATH}\n\
                 export PATH=$PATH:{DATA_DIR}/bin\n\
                 kubectl get node \"{node_name}\" -o \
                 'jsonpath={{.status.conditions[?(@.type==\"Ready\")].status}}' \
                 2>/dev/null || echo NotFound\n"
            ),
            RemoteOp::ClusterReadyCount => format!(
                "export KUBECONFIG={KUBECONFIG_PATH}\n\
                 export PATH=$PATH:{DATA_DIR}/bin\n\
                 ready=$(kubectl get nodes --no-headers 2>/dev/null | \
                 awk '$2 == \"Ready\"' | wc -l)\n\
                 total=$(kubectl get nodes --no-headers 2>/dev/null | wc -l)\n\
                 echo \"ready=$ready total=$total\"\n"
            ),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn service_kinds_map_to_units() {
        assert_eq!(ServiceKind::Server.unit(), "rke2-server");
        assert_eq!(ServiceKind::Agent.unit(), "rke2-agent");
        assert_eq!(ServiceKind::Agent.install_type(), "agent");
    }

    #[test]
    fn write_file_renders_a_quoted_heredoc() {
        let op = RemoteOp::WriteFile {
            path: CONFIG_FILE.into(),
            contents: "token: abc\n".to_string(),
        };
        let script = op.render();
        assert!(script.starts_with(&format!("mkdir -p {CONFIG_DIR}\n")));
        assert!(script.contains(&format!("cat > {CONFIG_FILE} << 'EOF'\n")));
        assert!(script.contains("token: abc\nEOF\n"));
    }

    #[test]
    fn installer_selects_the_service_type() {
        let script =
            RemoteOp::RunInstaller { kind: ServiceKind::Agent }.render();
        assert!(script.contains("INSTALL_RKE2_TYPE=agent"));
        assert!(script.contains(INSTALL_SCRIPT));
    }

    #[test]
    fn probes_use_structured_replies() {
        let stat = RemoteOp::StatFile { path: "/tmp/f".into() }.render();
        assert!(stat.contains("echo present"));
        assert!(stat.contains("echo absent"));
        assert!(stat.contains("sha256sum"));

        let count = RemoteOp::ClusterReadyCount.render();
        assert!(count.contains("echo \"ready=$ready total=$total\""));

        let node = RemoteOp::NodeReady { node_name: "n1".to_string() }
            .render();
        assert!(node.contains("kubectl get node \"n1\""));
        assert!(node.contains("echo NotFound"));
    }
}
