//! Kernel configuration.

use serde::{Deserialize, Serialize};
use vk_axiom::commitlog::MAX_COMMITLOG_ENTRIES;
use vk_axiom::syslog::MAX_SYSLOG_EVENTS;

use crate::error::{HostError, HostResult};

/// Runtime options. Every field has a default, so `{}` is a valid config.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KernelConfig {
    /// Run the table invariant checker after every crank
    pub check_invariants: bool,
    /// Reap interval for vats created without one
    pub default_reap_interval: Option<u64>,
    /// Enable pipelining for every vat, whatever its own options say
    pub default_enable_pipelining: bool,
    /// Commits retained in memory
    pub commitlog_capacity: usize,
    /// Syscall audit events retained in memory
    pub syslog_capacity: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig {
            check_invariants: false,
            default_reap_interval: None,
            default_enable_pipelining: false,
            commitlog_capacity: MAX_COMMITLOG_ENTRIES,
            syslog_capacity: MAX_SYSLOG_EVENTS,
        }
    }
}

impl KernelConfig {
    /// Parse a JSON config, filling unset fields with defaults.
    pub fn from_json(json: &str) -> HostResult<Self> {
        serde_json::from_str(json).map_err(|e| HostError::Config(alloc::format!("{}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = KernelConfig::from_json("{}").unwrap();
        assert_eq!(config, KernelConfig::default());
    }

    #[test]
    fn test_partial_config() {
        let config =
            KernelConfig::from_json(r#"{"checkInvariants":true,"defaultReapInterval":5}"#).unwrap();
        assert!(config.check_invariants);
        assert_eq!(config.default_reap_interval, Some(5));
        assert!(!config.default_enable_pipelining);
    }

    #[test]
    fn test_bad_config_is_rejected() {
        assert!(matches!(
            KernelConfig::from_json("{\"checkInvariants\":\"yes\"}"),
            Err(HostError::Config(_))
        ));
    }
}
