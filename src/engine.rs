//! Scan controller: owns the scan lifecycle and drives sender and receiver.
//!
//! `run` opens the capture and transmit handles, starts the receiver on a
//! blocking worker, runs the paced sending loop on the async runtime, then
//! drains late responses for the configured cooldown. `shutdown` may be called
//! from any task at any time and is idempotent.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ScanConfig;
use crate::error::ScanError;
use crate::scanner::cookie::Validator;
use crate::scanner::rate::RateLimiter;
use crate::scanner::receiver::{Receiver, DEFAULT_POLL_INTERVAL, MIN_POLL_INTERVAL};
use crate::scanner::sender::{SendOutcome, Sender};
use crate::scanner::transport::Transport;
use crate::sink::ResultSink;
use crate::state::{ScanPhase, ScanSnapshot, SharedState};
use crate::ScanSummary;

/// Sends between cooperative yields when the rate limiter never suspends.
const YIELD_EVERY: u32 = 256;

/// Owner of one scan. Share it via `Arc` to call `shutdown` from another task.
pub struct ScanController {
    config: ScanConfig,
    scan_id: Uuid,
    state: SharedState,
    cancel: CancellationToken,
    poll_interval: Duration,
}

impl ScanController {
    pub fn new(config: ScanConfig) -> Self {
        Self {
            config,
            scan_id: Uuid::new_v4(),
            state: SharedState::new(),
            cancel: CancellationToken::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Capture poll timeout, which bounds receiver shutdown latency.
    /// Clamped to `MIN_POLL_INTERVAL`.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(MIN_POLL_INTERVAL);
        self
    }

    /// True once the scan is Complete or Cancelled.
    pub fn is_complete(&self) -> bool {
        self.state.is_complete()
    }

    pub fn snapshot(&self) -> ScanSnapshot {
        self.state.snapshot()
    }

    /// Cancel the scan. Counters freeze immediately; `run` returns promptly
    /// with the partial results. Calling it again is a no-op.
    pub fn shutdown(&self) {
        if self.state.cancel() {
            tracing::info!(scan_id = %self.scan_id, "scan cancelled");
        }
        self.cancel.cancel();
    }

    /// Run the scan to completion or cancellation.
    ///
    /// Errors are fatal and happen before any probe is sent: an invalid
    /// config, or a capture/transmit handle that cannot be opened.
    pub async fn run(
        &self,
        transport: &mut dyn Transport,
        sink: Box<dyn ResultSink>,
    ) -> Result<ScanSummary, ScanError> {
        self.config.validate()?;
        let started_at = Utc::now();
        let space = Arc::new(self.config.address_space());
        let total = space.size();

        if total == 0 {
            if let Err(e) = self.state.complete_empty() {
                if self.state.phase() == ScanPhase::Cancelled {
                    return Ok(self.summary(started_at));
                }
                return Err(e);
            }
            tracing::warn!(scan_id = %self.scan_id, "no eligible targets after filtering");
            return Ok(self.summary(started_at));
        }

        let capture = transport.open_capture()?;
        let transmit = transport.open_transmit()?;
        if let Err(e) = self.state.begin(total) {
            if self.state.phase() == ScanPhase::Cancelled {
                return Ok(self.summary(started_at));
            }
            return Err(e);
        }

        let limiter = RateLimiter::new(self.config.rate, self.config.bandwidth);
        tracing::info!(
            scan_id = %self.scan_id,
            port = self.config.port,
            total,
            rate = ?limiter.rate(),
            seed = self.config.seed,
            source = %transmit.source_ip(),
            "scan starting"
        );

        let monitor_stop = CancellationToken::new();
        let monitor = tokio::spawn(report_progress(
            self.state.clone(),
            self.config.status_interval,
            monitor_stop.clone(),
        ));

        // Fired by shutdown, by the result limit, or by a dead capture.
        let stop_sending = self.cancel.child_token();
        let receiver_stop = CancellationToken::new();
        let capture_failed = CancellationToken::new();
        let validator = Validator::new(self.config.secret);

        let receiver = Receiver::new(
            capture,
            validator.clone(),
            Arc::clone(&space),
            self.config.port,
            self.config.source_ports,
            self.state.clone(),
            sink,
        )
        .with_max_results(self.config.max_results, stop_sending.clone())
        .with_poll_interval(self.poll_interval);
        let receiver_handle = {
            let stop = receiver_stop.clone();
            let halt = stop_sending.clone();
            let failed = capture_failed.clone();
            tokio::task::spawn_blocking(move || {
                let result = receiver.run(stop);
                if result.is_err() {
                    // Marked before halting so the sender sees it on wake-up.
                    failed.cancel();
                    halt.cancel();
                }
                result
            })
        };

        let mut sender = Sender::new(
            space,
            limiter,
            transmit,
            validator,
            self.config.port,
            self.config.source_ports,
            self.config.probe.clone(),
            self.state.clone(),
        );
        let outcome = match self.config.max_runtime {
            Some(limit) => {
                match tokio::time::timeout(limit, send_all(&mut sender, &stop_sending)).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        tracing::info!(max_runtime_secs = limit.as_secs_f64(), "runtime limit reached");
                        SendOutcome::Halted
                    }
                }
            }
            None => send_all(&mut sender, &stop_sending).await,
        };
        // Release the transmit handle before the grace period.
        drop(sender);

        // Nothing can be received without a capture, so skip the grace period.
        if !capture_failed.is_cancelled() && self.state.begin_draining() {
            tracing::info!(
                scan_id = %self.scan_id,
                exhausted = outcome == SendOutcome::Exhausted,
                cooldown_secs = self.config.cooldown.as_secs_f64(),
                "scan draining"
            );
            tokio::select! {
                _ = tokio::time::sleep(self.config.cooldown) => {}
                _ = all_answered(&self.state, self.poll_interval) => {
                    tracing::debug!("every dispatched probe answered");
                }
                _ = self.cancel.cancelled() => {}
                _ = capture_failed.cancelled() => {}
            }
        }

        receiver_stop.cancel();
        let capture_error = match receiver_handle.await {
            Ok(Ok(credited)) => {
                tracing::debug!(credited, "receiver stopped");
                None
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "capture failed during scan");
                Some(e.to_string())
            }
            Err(e) => {
                tracing::error!(error = %e, "receiver task failed");
                Some(e.to_string())
            }
        };
        monitor_stop.cancel();
        let _ = monitor.await;

        self.state.finish();
        let mut summary = self.summary(started_at);
        summary.capture_error = capture_error;
        tracing::info!(
            scan_id = %self.scan_id,
            phase = %summary.phase,
            total = summary.total,
            completed = summary.completed,
            successful = summary.successful,
            send_failures = summary.send_failures,
            failures = summary.failures,
            duplicates = summary.duplicates,
            discarded = summary.discarded,
            duration_secs = summary.duration_secs,
            capture_failed = summary.capture_error.is_some(),
            "scan finished"
        );
        Ok(summary)
    }

    fn summary(&self, started_at: DateTime<Utc>) -> ScanSummary {
        ScanSummary::from_snapshot(
            self.scan_id,
            &self.config,
            &self.state.snapshot(),
            started_at,
            self.state.elapsed(),
        )
    }
}

/// Send until the targets run out or `stop` fires.
async fn send_all(sender: &mut Sender, stop: &CancellationToken) -> SendOutcome {
    let mut since_yield = 0u32;
    loop {
        match sender.send_next(stop).await {
            Ok(SendOutcome::Sent(_)) => {}
            Ok(done) => return done,
            // Already counted as completed by the sender.
            Err(_) => {}
        }
        since_yield += 1;
        if since_yield == YIELD_EVERY {
            since_yield = 0;
            tokio::task::yield_now().await;
        }
    }
}

/// Resolves once every dispatched probe has a validated answer or a send failure.
async fn all_answered(state: &SharedState, poll: Duration) {
    let mut tick = tokio::time::interval(poll);
    loop {
        tick.tick().await;
        let s = state.snapshot();
        if s.successful + s.failures + s.send_failures >= s.completed {
            return;
        }
    }
}

/// Send and hit rates between two snapshots taken `elapsed` apart.
pub fn progress_rates(prev: &ScanSnapshot, cur: &ScanSnapshot, elapsed: Duration) -> (f64, f64) {
    let secs = elapsed.as_secs_f64();
    let send_rate = if secs > 0.0 {
        cur.completed.saturating_sub(prev.completed) as f64 / secs
    } else {
        0.0
    };
    let hit_rate = if cur.completed == 0 {
        0.0
    } else {
        cur.successful as f64 * 100.0 / cur.completed as f64
    };
    (send_rate, hit_rate)
}

async fn report_progress(state: SharedState, every: Duration, stop: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    let mut last = state.snapshot();
    let mut last_at = Instant::now();
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let snap = state.snapshot();
        let now = Instant::now();
        let (send_rate, hit_rate) = progress_rates(&last, &snap, now.duration_since(last_at));
        tracing::info!(
            phase = %snap.phase,
            completed = snap.completed,
            total = snap.total,
            successful = snap.successful,
            send_rate = send_rate.round(),
            hit_rate = %format_args!("{hit_rate:.2}%"),
            percent = %format_args!("{:.1}", snap.percent_complete()),
            "scan progress"
        );
        last = snap;
        last_at = now;
    }
}

// =============================================================================
// Tests
// =============================================================================
