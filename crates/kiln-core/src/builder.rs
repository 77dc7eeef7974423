//! Builder definitions.
//!
//! A builder is a named, immutable pipeline: a capability requirement plus an
//! ordered list of steps. The steps themselves are opaque to the master; each
//! one is an external command the assigned worker runs in sequence.

use crate::capability::CapabilityRequirement;
use crate::ids::BuilderName;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuilderConfig {
    pub name: BuilderName,
    pub requires: CapabilityRequirement,
    pub steps: Vec<StepSpec>,
    /// Environment applied to every step of this builder.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Wall-clock ceiling for one build of this builder.
    #[serde(default = "default_max_duration_secs")]
    pub max_duration_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_step_timeout_secs")]
    pub timeout_secs: u64,
    /// Continue with later steps even if this one fails.
    #[serde(default)]
    pub continue_on_failure: bool,
}

fn default_max_duration_secs() -> u64 {
    7200
}

fn default_step_timeout_secs() -> u64 {
    3600
}

/// The full set of configured builders, fixed at startup.
///
/// Kept in name order so listings and fan-out are deterministic.
#[derive(Debug, Clone)]
pub struct BuilderSet {
    by_name: BTreeMap<BuilderName, BuilderConfig>,
}

impl BuilderSet {
    pub fn from_configs(configs: Vec<BuilderConfig>) -> Result<Self> {
        let mut by_name = BTreeMap::new();
        for config in configs {
            let name = config.name.clone();
            if by_name.insert(name.clone(), config).is_some() {
                return Err(Error::Internal(format!(
                    "duplicate builder in configuration: {name}"
                )));
            }
        }
        Ok(Self { by_name })
    }

    pub fn get(&self, name: &BuilderName) -> Option<&BuilderConfig> {
        self.by_name.get(name)
    }

    pub fn contains(&self, name: &BuilderName) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BuilderConfig> {
        self.by_name.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &BuilderName> {
        self.by_name.keys()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}
