//! Summary formatters.
//!
//! Supports pretty (human) and JSON summaries. Per-target records are written
//! by the result sink, not here.

use crate::ScanSummary;

/// Format a scan summary as human-readable text.
pub fn format_pretty(summary: &ScanSummary) -> String {
    let mut out = String::new();

    let version = env!("CARGO_PKG_VERSION");
    out.push_str(&format!("tidescan {version} scan {}\n", summary.scan_id));
    out.push_str(&format!(
        "Port {}/tcp, seed {}, {}\n",
        summary.port, summary.seed, summary.phase
    ));
    out.push('\n');

    let rows: [(&str, u64); 7] = [
        ("targets", summary.total),
        ("probed", summary.completed),
        ("open", summary.successful),
        ("closed", summary.failures),
        ("send failures", summary.send_failures),
        ("duplicates", summary.duplicates),
        ("discarded", summary.discarded),
    ];
    for (label, value) in rows {
        out.push_str(&format!("{label:<16}{value}\n"));
    }
    out.push('\n');

    out.push_str(&format!(
        "{} of {} targets probed in {} ({:.2}% hit rate)\n",
        summary.completed,
        summary.total,
        format_duration(summary.duration_secs),
        summary.hit_rate()
    ));
    if let Some(err) = &summary.capture_error {
        out.push_str(&format!("capture lost mid-scan: {err}\n"));
    }
    out
}

/// Format a scan summary as JSON.
pub fn format_json(summary: &ScanSummary) -> String {
    serde_json::to_string_pretty(summary)
        .unwrap_or_else(|e| format!("{{\"error\": \"serialization failed: {e}\"}}"))
}

/// Format seconds as `1.23s`, `4m05s` or `2h03m`.
pub fn format_duration(secs: f64) -> String {
    if secs < 60.0 {
        format!("{secs:.2}s")
    } else if secs < 3600.0 {
        let s = secs as u64;
        format!("{}m{:02}s", s / 60, s % 60)
    } else {
        let s = secs as u64;
        format!("{}h{:02}m", s / 3600, (s % 3600) / 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ScanPhase;
    use chrono::Utc;
    use uuid::Uuid;

    fn make_summary(phase: ScanPhase) -> ScanSummary {
        ScanSummary {
            scan_id: Uuid::new_v4(),
            port: 443,
            phase,
            total: 1000,
            completed: 400,
            successful: 20,
            send_failures: 1,
            failures: 35,
            duplicates: 2,
            discarded: 9,
            seed: 77,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            duration_secs: 3.42,
            capture_error: None,
        }
    }

    #[test]
    fn test_format_duration_seconds() {
        assert_eq!(format_duration(3.421), "3.42s");
    }

    #[test]
    fn test_format_duration_minutes() {
        assert_eq!(format_duration(245.0), "4m05s");
    }

    #[test]
    fn test_format_duration_hours() {
        assert_eq!(format_duration(7380.0), "2h03m");
    }

    #[test]
    fn test_format_pretty_header() {
        let out = format_pretty(&make_summary(ScanPhase::Complete));
        assert!(out.starts_with("tidescan "));
        assert!(out.contains("Port 443/tcp, seed 77, complete"));
    }

    #[test]
    fn test_format_pretty_counters() {
        let out = format_pretty(&make_summary(ScanPhase::Complete));
        assert!(out.contains("open            20\n"));
        assert!(out.contains("closed          35\n"));
        assert!(out.contains("400 of 1000 targets probed in 3.42s (5.00% hit rate)"));
    }

    #[test]
    fn test_format_pretty_cancelled() {
        let out = format_pretty(&make_summary(ScanPhase::Cancelled));
        assert!(out.contains("cancelled"));
    }

    #[test]
    fn test_format_pretty_capture_error() {
        let mut summary = make_summary(ScanPhase::Complete);
        assert!(!format_pretty(&summary).contains("capture lost"));
        summary.capture_error = Some("recv failed".into());
        assert!(format_pretty(&summary).contains("capture lost mid-scan: recv failed\n"));
        let v: serde_json::Value = serde_json::from_str(&format_json(&summary)).unwrap();
        assert_eq!(v["capture_error"], "recv failed");
    }

    #[test]
    fn test_format_json_structure() {
        let json = format_json(&make_summary(ScanPhase::Complete));
        let v: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v["port"], 443);
        assert_eq!(v["phase"], "complete");
        assert_eq!(v["successful"], 20);
        assert!(v["scan_id"].is_string());
    }
}
