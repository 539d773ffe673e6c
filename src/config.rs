//! Scan configuration.
//!
//! `ScanConfig` is immutable once a scan starts. Loading it (CLI, filter
//! files) happens in `cli`; this module only defines and validates it.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::scanner::probe::ProbeProfile;
use crate::targets::{AddressRange, AddressSet, AddressSpace};

/// Default grace period after the last probe, as in zmap.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(8);

/// Default ephemeral source port range used to encode cookies.
pub const DEFAULT_SOURCE_PORTS: (u16, u16) = (32768, 61000);

/// Default progress log period.
pub const DEFAULT_STATUS_INTERVAL: Duration = Duration::from_secs(1);

/// Everything a scan needs, fixed before it starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Destination port probed on every target.
    pub port: u16,
    /// Packet rate ceiling (packets/sec). `None` = unpaced.
    pub rate: Option<u64>,
    /// Bandwidth ceiling (bytes/sec), converted to a packet rate.
    pub bandwidth: Option<u64>,
    /// Target ranges; overlapping ranges are merged.
    pub ranges: Vec<AddressRange>,
    /// Addresses never probed. Wins over the whitelist.
    pub blacklist: AddressSet,
    /// When present, only these addresses are probed.
    pub whitelist: Option<AddressSet>,
    /// Permutation seed; the same seed reproduces the same order.
    pub seed: u64,
    /// Cookie key.
    pub secret: [u8; 16],
    /// Receive grace period after the last probe.
    pub cooldown: Duration,
    /// Inclusive ephemeral source port range.
    pub source_ports: (u16, u16),
    /// Stop sending after this many successes.
    pub max_results: Option<u64>,
    /// Stop sending after this long.
    pub max_runtime: Option<Duration>,
    /// Period of progress log events.
    pub status_interval: Duration,
    /// Probe header fields.
    #[serde(default)]
    pub probe: ProbeProfile,
}

impl ScanConfig {
    /// Config for `port` over `ranges` with a random seed and secret.
    pub fn new(port: u16, ranges: Vec<AddressRange>) -> Self {
        Self {
            port,
            rate: None,
            bandwidth: None,
            ranges,
            blacklist: AddressSet::new(),
            whitelist: None,
            seed: rand::random(),
            secret: rand::random(),
            cooldown: DEFAULT_COOLDOWN,
            source_ports: DEFAULT_SOURCE_PORTS,
            max_results: None,
            max_runtime: None,
            status_interval: DEFAULT_STATUS_INTERVAL,
            probe: ProbeProfile::default(),
        }
    }

    /// Check the invariants the engine relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidPort(self.port));
        }
        if self.ranges.is_empty() {
            return Err(ConfigError::NoTargets);
        }
        let (lo, hi) = self.source_ports;
        if lo == 0 || hi < lo {
            return Err(ConfigError::InvalidSourcePorts(lo, hi));
        }
        if self.max_results == Some(0) {
            return Err(ConfigError::InvalidLimit {
                name: "max_results",
                reason: "must be at least 1".into(),
            });
        }
        if self.status_interval.is_zero() {
            return Err(ConfigError::InvalidLimit {
                name: "status_interval",
                reason: "must be non-zero".into(),
            });
        }
        Ok(())
    }

    /// Build the filtered address space this config describes.
    pub fn address_space(&self) -> AddressSpace {
        AddressSpace::new(
            &self.ranges,
            self.whitelist.as_ref(),
            &self.blacklist,
            self.seed,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ScanConfig {
        ScanConfig::new(80, vec![AddressRange::parse("10.0.0.0/30").unwrap()])
    }

    #[test]
    fn test_defaults_validate() {
        let cfg = config();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.cooldown, Duration::from_secs(8));
        assert_eq!(cfg.source_ports, (32768, 61000));
        assert_eq!(cfg.address_space().size(), 4);
    }

    #[test]
    fn test_port_zero_rejected() {
        let mut cfg = config();
        cfg.port = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidPort(0))));
    }

    #[test]
    fn test_no_ranges_rejected() {
        let mut cfg = config();
        cfg.ranges.clear();
        assert!(matches!(cfg.validate(), Err(ConfigError::NoTargets)));
    }

    #[test]
    fn test_source_ports_rejected() {
        let mut cfg = config();
        cfg.source_ports = (40000, 30000);
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidSourcePorts(40000, 30000))
        ));
        cfg.source_ports = (0, 10);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_zero_max_results_rejected() {
        let mut cfg = config();
        cfg.max_results = Some(0);
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidLimit { .. })));
    }

    #[test]
    fn test_random_secrets_differ() {
        assert_ne!(config().secret, config().secret);
    }

    #[test]
    fn test_serde_roundtrip_keeps_filters() {
        let mut cfg = config();
        cfg.blacklist.insert(AddressRange::parse("10.0.0.1").unwrap());
        let json = serde_json::to_string(&cfg).unwrap();
        let back: ScanConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.blacklist, cfg.blacklist);
        assert_eq!(back.address_space().size(), 3);
    }
}
