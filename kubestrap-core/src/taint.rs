// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Scheduling taint policy for control-plane nodes.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use slog::{info, warn, Logger};

/// Taint key applied to control-plane nodes when no explicit taints are
/// configured. Widely tolerated by system components.
pub const CONTROL_PLANE_TAINT_KEY: &str =
    "node-role.kubernetes.io/control-plane";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaintEffect {
    NoSchedule,
    PreferNoSchedule,
    NoExecute,
}

impl fmt::Display for TaintEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaintEffect::NoSchedule => "NoSchedule",
            TaintEffect::PreferNoSchedule => "PreferNoSchedule",
            TaintEffect::NoExecute => "NoExecute",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for TaintEffect {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NoSchedule" => Ok(TaintEffect::NoSchedule),
            "PreferNoSchedule" => Ok(TaintEffect::PreferNoSchedule),
            "NoExecute" => Ok(TaintEffect::NoExecute),
            _ => Err(()),
        }
    }
}

/// A node taint in `key[=value]:Effect` form.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct Taint {
    pub key: String,
    pub value: Option<String>,
    pub effect: TaintEffect,
}

impl fmt::Display for Taint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(value) => write!(f, "{}={}:{}", self.key, value, self.effect),
            None => write!(f, "{}:{}", self.key, self.effect),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TaintParseError {
    #[error("taint {0:?} is missing an effect (expected key[=value]:Effect)")]
    MissingEffect(String),
    #[error("taint {input:?} has unknown effect {effect:?}")]
    UnknownEffect { input: String, effect: String },
    #[error("taint {0:?} has an empty key")]
    EmptyKey(String),
}

impl FromStr for Taint {
    type Err = TaintParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kv, effect) = s
            .rsplit_once(':')
            .ok_or_else(|| TaintParseError::MissingEffect(s.to_string()))?;
        let effect = effect.parse().map_err(|()| {
            TaintParseError::UnknownEffect {
                input: s.to_string(),
                effect: effect.to_string(),
            }
        })?;
        let (key, value) = match kv.split_once('=') {
            Some((key, value)) => (key, Some(value.to_string())),
            None => (kv, None),
        };
        if key.is_empty() {
            return Err(TaintParseError::EmptyKey(s.to_string()));
        }
        Ok(Taint { key: key.to_string(), value, effect })
    }
}

impl TryFrom<String> for Taint {
    type Error = TaintParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

fn control_plane_taint(effect: TaintEffect) -> Taint {
    Taint { key: CONTROL_PLANE_TAINT_KEY.to_string(), value: None, effect }
}

/// Computes the taints to apply to a node.
///
/// Explicit user-configured taints always win. Otherwise control-plane
/// nodes get the standard control-plane taint: a hard `NoSchedule` when a
/// dedicated worker pool exists to take ordinary workloads, and the softer
/// `PreferNoSchedule` when the control-plane nodes are all the cluster has,
/// so essential components can still land somewhere.
pub fn recommended_taints(
    explicit: &[Taint],
    is_control_plane: bool,
    has_worker_pool: bool,
    log: &Logger,
) -> Vec<Taint> {
    if !explicit.is_empty() {
        if is_control_plane && !has_worker_pool {
            for taint in explicit {
                if taint.effect == TaintEffect::NoSchedule {
                    warn!(
                        log,
                        "explicit NoSchedule taint {} on a control-plane \
                         node, but the cluster has no worker pool; system \
                         components may have nowhere to schedule",
                        taint
                    );
                }
            }
        }
        return explicit.to_vec();
    }

    if !is_control_plane {
        return Vec::new();
    }

    if has_worker_pool {
        vec![control_plane_taint(TaintEffect::NoSchedule)]
    } else {
        info!(
            log,
            "no dedicated worker pool; using PreferNoSchedule so system \
             components can run on control-plane nodes"
        );
        vec![control_plane_taint(TaintEffect::PreferNoSchedule)]
    }
}
