// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cluster configuration: the immutable host list plus cluster-wide
//! settings, loaded from a TOML file and validated before the orchestrator
//! runs.

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use slog::{warn, Logger};

use crate::exec::Credential;
use crate::taint::Taint;

/// Join token used when the config does not specify one. Every node in a
/// cluster must share the same token.
pub const DEFAULT_CLUSTER_TOKEN: &str = "kubestrap-default-join-token";

/// Role tags accepted in host configuration.
pub const VALID_ROLE_TAGS: &[&str] = &["etcd", "master", "control", "worker"];

/// Platform sub-role tags accepted in host configuration. These are consumed
/// by the platform and database installers downstream of the bootstrap.
pub const VALID_PLATFORM_ROLES: &[&str] =
    &["gateway", "chaos", "db-primary", "db-replica"];

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub hosts: Vec<Host>,
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

/// One managed host. Hosts are supplied once, immutably, for the duration
/// of a run.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Host {
    /// External address, used for SSH and as the node's external IP.
    pub address: String,
    /// Internal address for node-to-node traffic; defaults to `address`.
    pub internal_address: Option<String>,
    /// Node display name; defaults to `address`.
    pub name: Option<String>,
    pub user: String,
    pub password: Option<String>,
    pub key_file: Option<Utf8PathBuf>,
    /// Raw role tags, matched case-insensitively against
    /// [`VALID_ROLE_TAGS`].
    pub roles: Vec<String>,
    #[serde(default)]
    pub platform_roles: Vec<String>,
    /// Explicit scheduling taints; when present these override the derived
    /// taint policy entirely.
    #[serde(default)]
    pub taints: Vec<Taint>,
}

impl Host {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.address)
    }

    pub fn internal_address(&self) -> &str {
        self.internal_address.as_deref().unwrap_or(&self.address)
    }

    /// Credential selection order: password, then key file, then whatever
    /// ambient credentials (agent, default keys) the environment provides.
    pub fn credential(&self) -> Credential<'_> {
        if let Some(password) = &self.password {
            Credential::Password(password)
        } else if let Some(key_file) = &self.key_file {
            Credential::KeyFile(key_file)
        } else {
            Credential::Agent
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    /// Local directory holding the offline artifact bundle.
    pub bundle_dir: Utf8PathBuf,
    #[serde(default = "default_token")]
    pub token: String,
    /// Registry prepended to unqualified image references on every node.
    pub system_default_registry: Option<String>,
    pub registry_mirror: Option<RegistryMirror>,
}

fn default_token() -> String {
    DEFAULT_CLUSTER_TOKEN.to_string()
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegistryMirror {
    /// Registry hostname being mirrored.
    pub host: String,
    pub endpoint: String,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    /// Whether the downstream database installer should run. Unset means
    /// "derive from host platform roles".
    pub enabled: Option<bool>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config from {path}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("failed to parse config from {path}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: toml::de::Error,
    },
    #[error("no hosts configured")]
    NoHosts,
    #[error("host {index}: address is required")]
    MissingAddress { index: usize },
    #[error("host {address}: user is required")]
    MissingUser { address: String },
    #[error("host {address}: at least one role is required")]
    NoRoles { address: String },
    #[error(
        "host {address}: unknown role {role:?} \
         (expected one of etcd, master, control, worker)"
    )]
    UnknownRole { address: String, role: String },
    #[error("host {address}: unknown platform role {role:?}")]
    UnknownPlatformRole { address: String, role: String },
    #[error("host {address}: either a password or a key file is required")]
    MissingCredential { address: String },
    #[error("host address {address} appears more than once")]
    DuplicateAddress { address: String },
}

impl Config {
    pub fn from_file(path: &Utf8Path) -> Result<Config, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|err| ConfigError::Io { path: path.to_owned(), err })?;
        let config = toml::from_str(&contents)
            .map_err(|err| ConfigError::Parse { path: path.to_owned(), err })?;
        Ok(config)
    }

    /// Validates the host list. Must pass before the orchestrator runs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hosts.is_empty() {
            return Err(ConfigError::NoHosts);
        }
        let mut seen = std::collections::BTreeSet::new();
        for (index, host) in self.hosts.iter().enumerate() {
            if host.address.trim().is_empty() {
                return Err(ConfigError::MissingAddress { index });
            }
            let address = host.address.clone();
            if !seen.insert(address.clone()) {
                return Err(ConfigError::DuplicateAddress { address });
            }
            if host.user.trim().is_empty() {
                return Err(ConfigError::MissingUser { address });
            }
            if host.roles.is_empty() {
                return Err(ConfigError::NoRoles { address });
            }
            for role in &host.roles {
                let normalized = crate::topology::normalize_tag(role);
                if !VALID_ROLE_TAGS.contains(&normalized.as_str()) {
                    return Err(ConfigError::UnknownRole {
                        address,
                        role: role.clone(),
                    });
                }
            }
            for role in &host.platform_roles {
                let normalized = crate::topology::normalize_tag(role);
                if !VALID_PLATFORM_ROLES.contains(&normalized.as_str()) {
                    return Err(ConfigError::UnknownPlatformRole {
                        address,
                        role: role.clone(),
                    });
                }
            }
            if host.password.is_none() && host.key_file.is_none() {
                return Err(ConfigError::MissingCredential { address });
            }
        }
        Ok(())
    }

    /// Whether the downstream database installer should run.
    ///
    /// An explicit `database.enabled` setting always wins; database platform
    /// roles on hosts only imply `true` when the setting is absent.
    pub fn database_enabled(&self, log: &Logger) -> bool {
        let tagged = self.hosts.iter().any(|host| {
            host.platform_roles.iter().any(|role| {
                let normalized = crate::topology::normalize_tag(role);
                normalized == "db-primary" || normalized == "db-replica"
            })
        });
        match self.database.enabled {
            Some(enabled) => {
                if !enabled && tagged {
                    warn!(
                        log,
                        "database roles are assigned to hosts but \
                         database.enabled = false; honoring the explicit \
                         setting"
                    );
                }
                enabled
            }
            None => tagged,
        }
    }
}
