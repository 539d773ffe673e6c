//! CLI entrypoint for tidescan.
//!
//! Parses arguments, loads filter files into a validated `ScanConfig`, picks
//! the transport (raw sockets or dry run), wires Ctrl-C to shutdown and runs
//! the scan. Results stream to stdout or `--output-file` as JSON lines.

pub mod output;

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::config::ScanConfig;
use crate::error::{ConfigError, ScanError};
use crate::scanner::raw_socket::RawSocketTransport;
use crate::scanner::transport::{DryRunTransport, Transport};
use crate::sink::{JsonLinesSink, ResultSink};
use crate::targets::{AddressRange, AddressSet};
use crate::{ScanController, ScanSummary};

pub use output::{format_json, format_pretty};

// ─────────────────────────────────────────────────────────────────────────────
// CLI definition
// ─────────────────────────────────────────────────────────────────────────────

/// Tidescan: stateless single-probe TCP SYN scanner.
#[derive(Parser, Debug)]
#[command(name = "tidescan", version, about)]
#[command(
    long_about = "Tidescan sends one TCP SYN per target across an IPv4 address space \
    in a seeded pseudo-random order and validates SYN-ACKs with a keyed cookie, so no \
    per-target state is kept. Requires CAP_NET_RAW (sudo) on Linux unless --dryrun."
)]
pub struct Cli {
    /// Target ranges: CIDR (10.0.0.0/24), dashed (10.0.0.1-10.0.0.9) or single address
    #[arg(required = true)]
    pub ranges: Vec<AddressRange>,

    /// Destination TCP port
    #[arg(short, long)]
    pub port: u16,

    /// Send rate in packets per second (unpaced if omitted)
    #[arg(short, long)]
    pub rate: Option<u64>,

    /// Bandwidth cap in bytes per second; accepts K, M and G suffixes
    #[arg(short = 'B', long, value_parser = parse_bandwidth)]
    pub bandwidth: Option<u64>,

    /// File of ranges never to probe
    #[arg(short = 'b', long)]
    pub blacklist_file: Option<PathBuf>,

    /// File of ranges to restrict the scan to
    #[arg(short = 'w', long)]
    pub whitelist_file: Option<PathBuf>,

    /// Write result records here instead of stdout
    #[arg(short, long)]
    pub output_file: Option<PathBuf>,

    /// Seconds to keep receiving after the last probe
    #[arg(short, long, default_value = "8")]
    pub cooldown_secs: u64,

    /// Permutation seed (random if omitted)
    #[arg(short, long)]
    pub seed: Option<u64>,

    /// Stop sending after this many open targets
    #[arg(short = 'N', long)]
    pub max_results: Option<u64>,

    /// Stop sending after this many seconds
    #[arg(short = 't', long)]
    pub max_runtime: Option<u64>,

    /// Source address for probes (detected from the routing table if omitted)
    #[arg(short = 'S', long)]
    pub source_ip: Option<Ipv4Addr>,

    /// Seconds between progress log lines
    #[arg(long, default_value = "1")]
    pub status_secs: u64,

    /// Summary format
    #[arg(long, default_value = "pretty", value_enum)]
    pub summary: SummaryFmt,

    /// Build and pace probes, log them, send nothing
    #[arg(long)]
    pub dryrun: bool,
}

/// Summary format argument.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryFmt {
    Pretty,
    Json,
}

/// Parse a byte rate such as `500000`, `10M` or `1.5G` (decimal multipliers).
pub fn parse_bandwidth(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let (digits, multiplier) = match s.chars().last() {
        Some('k' | 'K') => (&s[..s.len() - 1], 1e3),
        Some('m' | 'M') => (&s[..s.len() - 1], 1e6),
        Some('g' | 'G') => (&s[..s.len() - 1], 1e9),
        _ => (s, 1.0),
    };
    let value: f64 = digits
        .trim()
        .parse()
        .map_err(|_| format!("invalid bandwidth '{s}'"))?;
    if !value.is_finite() || value <= 0.0 {
        return Err(format!("bandwidth must be positive: '{s}'"));
    }
    Ok((value * multiplier) as u64)
}

// ─────────────────────────────────────────────────────────────────────────────
// Scan
// ─────────────────────────────────────────────────────────────────────────────

/// Turn parsed arguments into a validated config, loading filter files.
pub fn build_config(args: &Cli) -> Result<ScanConfig, ConfigError> {
    let mut config = ScanConfig::new(args.port, args.ranges.clone());
    config.rate = args.rate;
    config.bandwidth = args.bandwidth;
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    if let Some(path) = &args.blacklist_file {
        config.blacklist = AddressSet::load_file(path)?;
    }
    if let Some(path) = &args.whitelist_file {
        config.whitelist = Some(AddressSet::load_file(path)?);
    }
    config.cooldown = Duration::from_secs(args.cooldown_secs);
    config.max_results = args.max_results;
    config.max_runtime = args.max_runtime.map(Duration::from_secs);
    config.status_interval = Duration::from_secs(args.status_secs);
    config.validate()?;
    Ok(config)
}

fn open_sink(args: &Cli) -> Result<Box<dyn ResultSink>, ScanError> {
    match &args.output_file {
        Some(path) => {
            let sink = JsonLinesSink::create(path).map_err(|e| {
                ScanError::Resource(format!("cannot create output file {}: {e}", path.display()))
            })?;
            Ok(Box::new(sink))
        }
        None => Ok(Box::new(JsonLinesSink::stdout())),
    }
}

/// Run a scan from CLI arguments. Ctrl-C cancels it and still returns the
/// partial summary.
pub async fn run_scan(args: &Cli) -> Result<ScanSummary, ScanError> {
    let config = build_config(args)?;
    let route_hint = config
        .ranges
        .first()
        .map(|r| r.start)
        .unwrap_or(Ipv4Addr::new(192, 0, 2, 1));
    let sink = open_sink(args)?;

    let mut transport: Box<dyn Transport> = if args.dryrun {
        let src_ip = args.source_ip.unwrap_or(Ipv4Addr::UNSPECIFIED);
        Box::new(DryRunTransport::new(src_ip))
    } else {
        Box::new(RawSocketTransport::new(args.source_ip, route_hint))
    };

    let controller = Arc::new(ScanController::new(config));
    let interrupt = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, shutting down");
                controller.shutdown();
            }
        })
    };

    let result = controller.run(transport.as_mut(), sink).await;
    interrupt.abort();
    result
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["tidescan"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    fn temp_file(contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("tidescan-{}.conf", uuid::Uuid::new_v4()));
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_parse_bandwidth_suffixes() {
        assert_eq!(parse_bandwidth("98000"), Ok(98_000));
        assert_eq!(parse_bandwidth("10K"), Ok(10_000));
        assert_eq!(parse_bandwidth("10m"), Ok(10_000_000));
        assert_eq!(parse_bandwidth("1.5G"), Ok(1_500_000_000));
    }

    #[test]
    fn test_parse_bandwidth_rejects_garbage() {
        assert!(parse_bandwidth("fast").is_err());
        assert!(parse_bandwidth("0").is_err());
        assert!(parse_bandwidth("-5M").is_err());
        assert!(parse_bandwidth("").is_err());
    }

    #[test]
    fn test_cli_defaults() {
        let cli = parse(&["-p", "80", "10.0.0.0/24"]);
        assert_eq!(cli.port, 80);
        assert_eq!(cli.ranges.len(), 1);
        assert_eq!(cli.cooldown_secs, 8);
        assert_eq!(cli.summary, SummaryFmt::Pretty);
        assert!(!cli.dryrun);
    }

    #[test]
    fn test_cli_requires_ranges_and_port() {
        assert!(Cli::try_parse_from(["tidescan", "-p", "80"]).is_err());
        assert!(Cli::try_parse_from(["tidescan", "10.0.0.1"]).is_err());
        assert!(Cli::try_parse_from(["tidescan", "-p", "80", "10.0.0.300"]).is_err());
    }

    #[test]
    fn test_build_config_maps_flags() {
        let cli = parse(&[
            "--port", "443", "--rate", "5000", "--bandwidth", "1M", "--seed", "9",
            "--cooldown-secs", "2", "--max-results", "10", "--max-runtime", "60",
            "10.0.0.0/30", "192.168.0.1-192.168.0.2",
        ]);
        let cfg = build_config(&cli).unwrap();
        assert_eq!(cfg.port, 443);
        assert_eq!(cfg.rate, Some(5000));
        assert_eq!(cfg.bandwidth, Some(1_000_000));
        assert_eq!(cfg.seed, 9);
        assert_eq!(cfg.cooldown, Duration::from_secs(2));
        assert_eq!(cfg.max_results, Some(10));
        assert_eq!(cfg.max_runtime, Some(Duration::from_secs(60)));
        assert_eq!(cfg.address_space().size(), 6);
    }

    #[test]
    fn test_build_config_loads_filter_files() {
        let blacklist = temp_file("# reserved\n10.0.0.0/31\n\n10.0.0.3 # gateway\n");
        let whitelist = temp_file("10.0.0.0/29\n");
        let cli = parse(&[
            "-p", "80", "-b", blacklist.to_str().unwrap(), "-w", whitelist.to_str().unwrap(),
            "10.0.0.0/24",
        ]);
        let cfg = build_config(&cli).unwrap();
        // 8 whitelisted minus 3 blacklisted.
        assert_eq!(cfg.address_space().size(), 5);
        let _ = std::fs::remove_file(blacklist);
        let _ = std::fs::remove_file(whitelist);
    }

    #[test]
    fn test_build_config_reports_bad_filter_line() {
        let blacklist = temp_file("10.0.0.0/31\nnot-an-address\n");
        let cli = parse(&["-p", "80", "-b", blacklist.to_str().unwrap(), "10.0.0.0/24"]);
        match build_config(&cli) {
            Err(ConfigError::InvalidFilterEntry { line, entry, .. }) => {
                assert_eq!(line, 2);
                assert_eq!(entry, "not-an-address");
            }
            other => panic!("expected InvalidFilterEntry, got {other:?}"),
        }
        let _ = std::fs::remove_file(blacklist);
    }

    #[test]
    fn test_build_config_missing_filter_file() {
        let cli = parse(&["-p", "80", "-b", "/nonexistent/tidescan-blacklist", "10.0.0.0/24"]);
        assert!(matches!(build_config(&cli), Err(ConfigError::FilterIo { .. })));
    }

    #[test]
    fn test_build_config_rejects_port_zero() {
        let cli = parse(&["-p", "0", "10.0.0.0/24"]);
        assert!(matches!(build_config(&cli), Err(ConfigError::InvalidPort(0))));
    }

    #[tokio::test]
    async fn test_dryrun_scan_completes() {
        let out = std::env::temp_dir().join(format!("tidescan-{}.jsonl", uuid::Uuid::new_v4()));
        let cli = parse(&[
            "-p", "22", "--dryrun", "--cooldown-secs", "0", "-S", "192.0.2.10",
            "-o", out.to_str().unwrap(), "10.0.0.0/30",
        ]);
        let summary = run_scan(&cli).await.unwrap();
        assert_eq!(summary.total, 4);
        assert_eq!(summary.completed, 4);
        assert_eq!(summary.successful, 0);
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "");
        let _ = std::fs::remove_file(out);
    }
}
