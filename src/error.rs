//! Error types shared by the scan engine.
//!
//! Only `ConfigError` and `ScanError::Resource` are fatal. Per-probe send
//! failures are recovered by the sending flow and per-packet parse failures
//! never leave the receiver.

use std::net::Ipv4Addr;
use std::path::PathBuf;

/// Invalid scan configuration. The scan never starts.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid target port {0} (expected 1-65535)")]
    InvalidPort(u16),

    #[error("invalid address range '{0}'")]
    InvalidRange(String),

    #[error("no target ranges configured")]
    NoTargets,

    #[error("{path}:{line}: invalid filter entry '{entry}'")]
    InvalidFilterEntry {
        path: PathBuf,
        line: usize,
        entry: String,
    },

    #[error("cannot read filter file {path}: {source}")]
    FilterIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid source port range {0}-{1}")]
    InvalidSourcePorts(u16, u16),

    #[error("invalid {name}: {reason}")]
    InvalidLimit { name: &'static str, reason: String },
}

/// Error from scan engine operations.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("capture or transmit session unavailable: {0}")]
    Resource(String),

    #[error("probe to {target} not transmitted: {reason}")]
    TransientSend { target: Ipv4Addr, reason: String },

    #[error("packet send failed: {0}")]
    Send(String),

    #[error("scan controller already started")]
    AlreadyStarted,
}

impl ScanError {
    /// Whether the scan can continue after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientSend { .. } | Self::Send(_))
    }
}

/// Malformed or unrelated inbound packet. Discarded silently by the receiver.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("packet truncated: {0} bytes")]
    Truncated(usize),

    #[error("not an IPv4 packet (version {0})")]
    NotIpv4(u8),

    #[error("bad IPv4 header length {0}")]
    BadHeaderLength(usize),

    #[error("not a TCP segment (protocol {0})")]
    NotTcp(u8),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let transient = ScanError::TransientSend {
            target: Ipv4Addr::new(10, 0, 0, 1),
            reason: "ENOBUFS".into(),
        };
        assert!(transient.is_transient());
        assert!(ScanError::Send("x".into()).is_transient());
        assert!(!ScanError::Resource("no capture".into()).is_transient());
        assert!(!ScanError::Config(ConfigError::InvalidPort(0)).is_transient());
    }

    #[test]
    fn test_filter_error_names_file_and_line() {
        let err = ConfigError::InvalidFilterEntry {
            path: PathBuf::from("/etc/blacklist.conf"),
            line: 7,
            entry: "10.0.0.300".into(),
        };
        assert_eq!(
            err.to_string(),
            "/etc/blacklist.conf:7: invalid filter entry '10.0.0.300'"
        );
    }
}
