// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipestep contributors

//! Resource requests for backend tasks

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Prefix of the environment variables a task sees its resources under
pub const ENV_PREFIX: &str = "PIPESTEP_";

/// CPU / GPU / memory request of a task
///
/// Every field is optional so that a pipeline definition can override only
/// part of a kind's defaults (see [`ResourceSpec::overlay`]).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceSpec {
    /// Number of CPU cores
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<u32>,

    /// Number of GPUs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpus: Option<u32>,

    /// Memory, in scheduler notation (e.g. `4G`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem: Option<String>,

    /// Wall-clock limit, in scheduler notation (e.g. `1:00:00`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_limit: Option<String>,

    /// Scheduler partition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<String>,

    /// Scheduler account
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
}

impl ResourceSpec {
    /// Request a number of CPUs
    pub fn with_cpus(mut self, cpus: u32) -> Self {
        self.cpus = Some(cpus);
        self
    }

    /// Request a number of GPUs
    pub fn with_gpus(mut self, gpus: u32) -> Self {
        self.gpus = Some(gpus);
        self
    }

    /// Request an amount of memory
    pub fn with_mem(mut self, mem: impl Into<String>) -> Self {
        self.mem = Some(mem.into());
        self
    }

    /// Set a wall-clock limit
    pub fn with_time_limit(mut self, limit: impl Into<String>) -> Self {
        self.time_limit = Some(limit.into());
        self
    }

    /// Effective CPU count (at least one)
    pub fn cpus(&self) -> u32 {
        self.cpus.unwrap_or(1).max(1)
    }

    /// Effective GPU count
    pub fn gpus(&self) -> u32 {
        self.gpus.unwrap_or(0)
    }

    /// Fields set in `other` replace the ones in `self`
    pub fn overlay(&self, other: &ResourceSpec) -> ResourceSpec {
        ResourceSpec {
            cpus: other.cpus.or(self.cpus),
            gpus: other.gpus.or(self.gpus),
            mem: other.mem.clone().or_else(|| self.mem.clone()),
            time_limit: other.time_limit.clone().or_else(|| self.time_limit.clone()),
            partition: other.partition.clone().or_else(|| self.partition.clone()),
            account: other.account.clone().or_else(|| self.account.clone()),
        }
    }

    /// Encode the request as environment variables for the task
    ///
    /// CPU and GPU counts are always present; the rest only when set.
    pub fn to_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert(format!("{}CPUS", ENV_PREFIX), self.cpus().to_string());
        env.insert(format!("{}GPUS", ENV_PREFIX), self.gpus().to_string());

        let optional = [
            ("MEM", &self.mem),
            ("TIME_LIMIT", &self.time_limit),
            ("PARTITION", &self.partition),
            ("ACCOUNT", &self.account),
        ];
        for (name, value) in optional {
            if let Some(value) = value {
                env.insert(format!("{}{}", ENV_PREFIX, name), value.clone());
            }
        }

        env
    }

    /// Decode a request previously produced by [`ResourceSpec::to_env`]
    pub fn from_env(env: &BTreeMap<String, String>) -> Self {
        let get = |name: &str| env.get(&format!("{}{}", ENV_PREFIX, name)).cloned();

        Self {
            cpus: get("CPUS").and_then(|v| v.parse().ok()),
            gpus: get("GPUS").and_then(|v| v.parse().ok()),
            mem: get("MEM"),
            time_limit: get("TIME_LIMIT"),
            partition: get("PARTITION"),
            account: get("ACCOUNT"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlay_prefers_override() {
        let defaults = ResourceSpec::default().with_cpus(4).with_mem("8G");
        let overrides = ResourceSpec::default().with_cpus(16).with_gpus(2);

        let merged = defaults.overlay(&overrides);
        assert_eq!(merged.cpus, Some(16));
        assert_eq!(merged.gpus, Some(2));
        assert_eq!(merged.mem.as_deref(), Some("8G"));
    }

    #[test]
    fn test_env_encoding() {
        let spec = ResourceSpec::default().with_gpus(1).with_mem("2G");
        let env = spec.to_env();

        assert_eq!(env["PIPESTEP_CPUS"], "1");
        assert_eq!(env["PIPESTEP_GPUS"], "1");
        assert_eq!(env["PIPESTEP_MEM"], "2G");
        assert!(!env.contains_key("PIPESTEP_TIME_LIMIT"));

        let decoded = ResourceSpec::from_env(&env);
        assert_eq!(decoded.gpus, Some(1));
        assert_eq!(decoded.mem.as_deref(), Some("2G"));
    }

    #[test]
    fn test_parse_yaml_partial() {
        let spec: ResourceSpec = serde_yaml::from_str("cpus: 8\ntime_limit: \"2:00:00\"").unwrap();
        assert_eq!(spec.cpus(), 8);
        assert_eq!(spec.gpus(), 0);
        assert_eq!(spec.time_limit.as_deref(), Some("2:00:00"));
    }
}
