// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cluster topology resolution.
//!
//! Classifies each host's free-form role tags into canonical roles and
//! derives the cluster-wide facts the rollout engine needs: the role sets,
//! the bootstrap seed (the first etcd-or-control-plane host in declaration
//! order, initialized without a join target), and whether a dedicated
//! worker pool exists. The resulting [`Topology`] is immutable; no
//! downstream component mutates host data.

use std::collections::BTreeSet;

use crate::config::Host;
use crate::ops::ServiceKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Role {
    Etcd,
    ControlPlane,
    Worker,
}

impl Role {
    pub fn from_tag(tag: &str) -> Option<Role> {
        match normalize_tag(tag).as_str() {
            "etcd" => Some(Role::Etcd),
            "master" | "control" => Some(Role::ControlPlane),
            "worker" => Some(Role::Worker),
            _ => None,
        }
    }
}

pub fn normalize_tag(tag: &str) -> String {
    tag.trim().to_ascii_lowercase()
}

#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error(
        "no host carries an etcd or control-plane role; \
         one is required to seed the cluster"
    )]
    NoBootstrapSeed,
}

#[derive(Clone, Debug)]
pub struct Topology {
    hosts: Vec<Host>,
    roles: Vec<BTreeSet<Role>>,
    seed: usize,
}

impl Topology {
    pub fn resolve(hosts: &[Host]) -> Result<Topology, TopologyError> {
        let roles: Vec<BTreeSet<Role>> = hosts
            .iter()
            .map(|host| {
                host.roles.iter().filter_map(|tag| Role::from_tag(tag)).collect()
            })
            .collect();
        let seed = roles
            .iter()
            .position(|r| {
                r.contains(&Role::Etcd) || r.contains(&Role::ControlPlane)
            })
            .ok_or(TopologyError::NoBootstrapSeed)?;
        Ok(Topology { hosts: hosts.to_vec(), roles, seed })
    }

    /// All hosts, in declaration order.
    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    /// The bootstrap seed: every other node joins the cluster through it.
    pub fn seed(&self) -> &Host {
        &self.hosts[self.seed]
    }

    fn index_of(&self, host: &Host) -> Option<usize> {
        self.hosts.iter().position(|h| h.address == host.address)
    }

    pub fn host_has_role(&self, host: &Host, role: Role) -> bool {
        self.index_of(host)
            .map(|i| self.roles[i].contains(&role))
            .unwrap_or(false)
    }

    /// Whether the host is part of the control plane (etcd or
    /// control-plane role), i.e. runs the server service rather than the
    /// agent.
    pub fn is_control_plane_member(&self, host: &Host) -> bool {
        self.host_has_role(host, Role::Etcd)
            || self.host_has_role(host, Role::ControlPlane)
    }

    pub fn service_kind(&self, host: &Host) -> ServiceKind {
        if self.is_control_plane_member(host) {
            ServiceKind::Server
        } else {
            ServiceKind::Agent
        }
    }

    /// Etcd members other than the seed, in declaration order.
    pub fn remaining_etcd(&self) -> Vec<&Host> {
        self.select(|i, roles| {
            i != self.seed && roles.contains(&Role::Etcd)
        })
    }

    /// Control-plane members that do not also run etcd, excluding the
    /// seed, in declaration order.
    pub fn dedicated_control_plane(&self) -> Vec<&Host> {
        self.select(|i, roles| {
            i != self.seed
                && roles.contains(&Role::ControlPlane)
                && !roles.contains(&Role::Etcd)
        })
    }

    /// Pure workers: hosts with only the worker role.
    pub fn workers(&self) -> Vec<&Host> {
        self.select(|_, roles| {
            roles.contains(&Role::Worker)
                && !roles.contains(&Role::Etcd)
                && !roles.contains(&Role::ControlPlane)
        })
    }

    /// A worker pool is "dedicated" only when at least one host is a pure
    /// worker; a worker tag on a control-plane host does not count.
    pub fn has_dedicated_worker_pool(&self) -> bool {
        !self.workers().is_empty()
    }

    /// Address other nodes use to join the cluster through the seed.
    pub fn join_address(&self) -> &str {
        &self.seed().address
    }

    fn select<F>(&self, mut pred: F) -> Vec<&Host>
    where
        F: FnMut(usize, &BTreeSet<Role>) -> bool,
    {
        self.roles
            .iter()
            .enumerate()
            .filter(|&(i, roles)| pred(i, roles))
            .map(|(i, _)| &self.hosts[i])
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

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

    fn addresses(hosts: Vec<&Host>) -> Vec<&str> {
        hosts.into_iter().map(|h| h.address.as_str()).collect()
    }

    #[test]
    fn seed_is_first_control_plane_eligible_host() {
        let hosts = vec![
            host("w1", &["worker"]),
            host("e1", &["etcd", "master"]),
            host("e2", &["etcd"]),
        ];
        let topology = Topology::resolve(&hosts).unwrap();
        assert_eq!(topology.seed().address, "e1");
        assert_eq!(addresses(topology.remaining_etcd()), vec!["e2"]);
        assert!(topology.dedicated_control_plane().is_empty());
        assert_eq!(addresses(topology.workers()), vec!["w1"]);
    }

    #[test]
    fn no_bootstrap_seed_without_control_plane_hosts() {
        let hosts = vec![host("w1", &["worker"]), host("w2", &["worker"])];
        assert!(matches!(
            Topology::resolve(&hosts),
            Err(TopologyError::NoBootstrapSeed)
        ));
    }

    #[test]
    fn tags_are_normalized_before_matching() {
        let hosts = vec![host("a", &[" ETCD ", "Control"])];
        let topology = Topology::resolve(&hosts).unwrap();
        assert!(topology.host_has_role(&hosts[0], Role::Etcd));
        assert!(topology.host_has_role(&hosts[0], Role::ControlPlane));
        assert_eq!(topology.service_kind(&hosts[0]), ServiceKind::Server);
    }

    #[test]
    fn worker_tag_on_control_plane_host_is_not_a_dedicated_pool() {
        let hosts = vec![host("a", &["etcd", "master", "worker"])];
        let topology = Topology::resolve(&hosts).unwrap();
        assert!(!topology.has_dedicated_worker_pool());
        assert!(topology.workers().is_empty());

        let hosts = vec![host("a", &["etcd"]), host("b", &["worker"])];
        let topology = Topology::resolve(&hosts).unwrap();
        assert!(topology.has_dedicated_worker_pool());
    }

    #[test]
    fn control_plane_only_hosts_are_separated_from_etcd() {
        let hosts = vec![
            host("seed", &["etcd"]),
            host("cp", &["master"]),
            host("both", &["etcd", "master"]),
            host("w", &["worker"]),
        ];
        let topology = Topology::resolve(&hosts).unwrap();
        assert_eq!(topology.seed().address, "seed");
        assert_eq!(addresses(topology.remaining_etcd()), vec!["both"]);
        assert_eq!(addresses(topology.dedicated_control_plane()), vec!["cp"]);
        assert_eq!(topology.service_kind(&hosts[3]), ServiceKind::Agent);
        assert_eq!(topology.join_address(), "seed");
    }
}
