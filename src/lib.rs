//! Tidescan: stateless, rate-limited TCP SYN scanner.
//!
//! Sends one probe per target across a filtered IPv4 address space in a
//! seeded pseudo-random order, and validates responses with a keyed cookie
//! instead of per-target state. Usable as a library or via the CLI.

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod scanner;
pub mod sink;
pub mod state;
pub mod targets;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use uuid::Uuid;

// Re-export key types for library users.
pub use config::ScanConfig;
pub use engine::ScanController;
pub use error::{ConfigError, ParseError, ScanError};
pub use scanner::transport::{DryRunTransport, MockNetwork, Transport};
pub use sink::{JsonLinesSink, MemorySink, ResultSink};
pub use state::{ScanPhase, ScanSnapshot};
pub use targets::{AddressRange, AddressSet, AddressSpace};

// ─────────────────────────────────────────────────────────────────────────────
// Response classification
// ─────────────────────────────────────────────────────────────────────────────

/// Kind of validated response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseKind {
    /// SYN-ACK: port is open, target is credited.
    SynAck,
    /// RST: a real host answered, port is closed.
    Rst,
}

impl ResponseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SynAck => "synack",
            Self::Rst => "rst",
        }
    }

    /// Whether this response credits the target.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::SynAck)
    }
}

impl std::fmt::Display for ResponseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Result types
// ─────────────────────────────────────────────────────────────────────────────

/// One credited target, as written to the result sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRecord {
    /// Responding address.
    pub saddr: Ipv4Addr,
    /// Port the response came from (the probed port).
    pub sport: u16,
    /// Our source port the response was addressed to.
    pub dport: u16,
    pub kind: ResponseKind,
    /// IP TTL of the response.
    pub ttl: u8,
    /// TCP window of the response.
    pub window: u16,
    pub received_at: DateTime<Utc>,
}

/// Final report of a scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSummary {
    pub scan_id: Uuid,
    pub port: u16,
    pub phase: ScanPhase,
    pub total: u64,
    pub completed: u64,
    pub successful: u64,
    pub send_failures: u64,
    /// Validated RSTs.
    pub failures: u64,
    pub duplicates: u64,
    pub discarded: u64,
    pub seed: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Time spent Running and Draining, in seconds.
    pub duration_secs: f64,
    /// Set when the capture session died mid-scan; later responses were lost.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_error: Option<String>,
}

impl ScanSummary {
    pub fn from_snapshot(
        scan_id: Uuid,
        config: &ScanConfig,
        snap: &ScanSnapshot,
        started_at: DateTime<Utc>,
        duration: std::time::Duration,
    ) -> Self {
        Self {
            scan_id,
            port: config.port,
            phase: snap.phase,
            total: snap.total,
            completed: snap.completed,
            successful: snap.successful,
            send_failures: snap.send_failures,
            failures: snap.failures,
            duplicates: snap.duplicates,
            discarded: snap.discarded,
            seed: config.seed,
            started_at,
            finished_at: Utc::now(),
            duration_secs: duration.as_secs_f64(),
            capture_error: None,
        }
    }

    /// Percentage of dispatched probes that were credited.
    pub fn hit_rate(&self) -> f64 {
        if self.completed == 0 {
            return 0.0;
        }
        self.successful as f64 * 100.0 / self.completed as f64
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
