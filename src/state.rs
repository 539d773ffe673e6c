//! Scan lifecycle and aggregate counters.
//!
//! `ScanState` is the only mutable state shared between the sending and
//! receiving flows. Every mutation goes through `SharedState`, which holds
//! one mutex, enforces the phase machine and keeps the counter invariants:
//! `successful <= completed <= total`, and nothing changes once terminal.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::ScanError;

/// Lifecycle phase of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanPhase {
    /// Configured, no resources opened yet.
    Initialized,
    /// Sending and receiving.
    Running,
    /// Targets exhausted; receiving late responses during the grace period.
    Draining,
    /// Finished normally.
    Complete,
    /// Stopped by an external signal. Counters hold valid partial results.
    Cancelled,
}

impl ScanPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Complete => "complete",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ScanPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time copy of the counters, for progress reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSnapshot {
    pub phase: ScanPhase,
    /// Size of the address space.
    pub total: u64,
    /// Probes handed to the transport (including failed hand-offs).
    pub completed: u64,
    /// Distinct targets credited with a validated SYN-ACK.
    pub successful: u64,
    /// Probes the transport refused.
    pub send_failures: u64,
    /// Validated responses that were not successes (RST).
    pub failures: u64,
    /// Validated responses for targets already credited.
    pub duplicates: u64,
    /// Inbound packets that failed parsing or validation.
    pub discarded: u64,
}

impl ScanSnapshot {
    /// Completion percentage of the sending phase.
    pub fn percent_complete(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.completed as f64 * 100.0 / self.total as f64
    }
}

#[derive(Debug)]
struct ScanState {
    phase: ScanPhase,
    total: u64,
    completed: u64,
    successful: u64,
    send_failures: u64,
    failures: u64,
    duplicates: u64,
    discarded: u64,
    started: Option<Instant>,
    finished: Option<Instant>,
}

impl ScanState {
    fn new() -> Self {
        Self {
            phase: ScanPhase::Initialized,
            total: 0,
            completed: 0,
            successful: 0,
            send_failures: 0,
            failures: 0,
            duplicates: 0,
            discarded: 0,
            started: None,
            finished: None,
        }
    }

    fn accepts_updates(&self) -> bool {
        matches!(self.phase, ScanPhase::Running | ScanPhase::Draining)
    }

    fn terminate(&mut self, phase: ScanPhase) {
        self.phase = phase;
        self.finished = Some(Instant::now());
    }
}

/// Synchronized handle to the scan state. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SharedState {
    inner: Arc<Mutex<ScanState>>,
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedState {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ScanState::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ScanState> {
        // A panic while holding the lock cannot leave the counters half-updated.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Initialized → Running with the address space size fixed.
    pub fn begin(&self, total: u64) -> Result<(), ScanError> {
        let mut s = self.lock();
        if s.phase != ScanPhase::Initialized {
            return Err(ScanError::AlreadyStarted);
        }
        s.total = total;
        s.phase = ScanPhase::Running;
        s.started = Some(Instant::now());
        Ok(())
    }

    /// Initialized → Complete for an empty address space.
    pub fn complete_empty(&self) -> Result<(), ScanError> {
        let mut s = self.lock();
        if s.phase != ScanPhase::Initialized {
            return Err(ScanError::AlreadyStarted);
        }
        s.total = 0;
        s.started = Some(Instant::now());
        s.terminate(ScanPhase::Complete);
        Ok(())
    }

    /// Count one probe as dispatched. Refused outside Running or past `total`.
    pub fn record_attempt(&self) -> bool {
        let mut s = self.lock();
        if s.phase != ScanPhase::Running || s.completed >= s.total {
            return false;
        }
        s.completed += 1;
        true
    }

    /// A dispatched probe the transport refused. It stays completed.
    pub fn record_send_failure(&self) {
        let mut s = self.lock();
        if s.accepts_updates() {
            s.send_failures += 1;
        }
    }

    /// Credit one target. Refused once terminal or if it would exceed `completed`.
    pub fn record_success(&self) -> bool {
        let mut s = self.lock();
        if !s.accepts_updates() || s.successful >= s.completed {
            return false;
        }
        s.successful += 1;
        true
    }

    pub fn record_failure(&self) {
        let mut s = self.lock();
        if s.accepts_updates() {
            s.failures += 1;
        }
    }

    pub fn record_duplicate(&self) {
        let mut s = self.lock();
        if s.accepts_updates() {
            s.duplicates += 1;
        }
    }

    pub fn record_discard(&self) {
        let mut s = self.lock();
        if s.accepts_updates() {
            s.discarded += 1;
        }
    }

    /// Running → Draining. Returns false from any other phase.
    pub fn begin_draining(&self) -> bool {
        let mut s = self.lock();
        if s.phase != ScanPhase::Running {
            return false;
        }
        s.phase = ScanPhase::Draining;
        true
    }

    /// Running/Draining → Complete. Returns the resulting phase.
    pub fn finish(&self) -> ScanPhase {
        let mut s = self.lock();
        if s.accepts_updates() {
            s.terminate(ScanPhase::Complete);
        }
        s.phase
    }

    /// Any non-terminal phase → Cancelled. Returns false if already terminal.
    pub fn cancel(&self) -> bool {
        let mut s = self.lock();
        if s.phase.is_terminal() {
            return false;
        }
        s.terminate(ScanPhase::Cancelled);
        true
    }

    pub fn phase(&self) -> ScanPhase {
        self.lock().phase
    }

    pub fn is_complete(&self) -> bool {
        self.lock().phase.is_terminal()
    }

    /// Time since the scan entered Running, frozen once terminal.
    pub fn elapsed(&self) -> Duration {
        let s = self.lock();
        match (s.started, s.finished) {
            (Some(start), Some(end)) => end.duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        }
    }

    pub fn snapshot(&self) -> ScanSnapshot {
        let s = self.lock();
        ScanSnapshot {
            phase: s.phase,
            total: s.total,
            completed: s.completed,
            successful: s.successful,
            send_failures: s.send_failures,
            failures: s.failures,
            duplicates: s.duplicates,
            discarded: s.discarded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running(total: u64) -> SharedState {
        let state = SharedState::new();
        state.begin(total).unwrap();
        state
    }

    #[test]
    fn test_phase_terminal() {
        assert!(!ScanPhase::Initialized.is_terminal());
        assert!(!ScanPhase::Running.is_terminal());
        assert!(!ScanPhase::Draining.is_terminal());
        assert!(ScanPhase::Complete.is_terminal());
        assert!(ScanPhase::Cancelled.is_terminal());
        assert_eq!(ScanPhase::Draining.to_string(), "draining");
    }

    #[test]
    fn test_begin_only_once() {
        let state = running(10);
        assert!(matches!(state.begin(10), Err(ScanError::AlreadyStarted)));
    }

    #[test]
    fn test_attempts_capped_at_total() {
        let state = running(2);
        assert!(state.record_attempt());
        assert!(state.record_attempt());
        assert!(!state.record_attempt());
        assert_eq!(state.snapshot().completed, 2);
    }

    #[test]
    fn test_success_never_exceeds_completed() {
        let state = running(5);
        assert!(!state.record_success(), "no probe dispatched yet");
        state.record_attempt();
        assert!(state.record_success());
        assert!(!state.record_success());
        let snap = state.snapshot();
        assert_eq!((snap.completed, snap.successful), (1, 1));
    }

    #[test]
    fn test_success_accepted_while_draining() {
        let state = running(1);
        state.record_attempt();
        assert!(state.begin_draining());
        assert!(state.record_success());
        assert_eq!(state.finish(), ScanPhase::Complete);
    }

    #[test]
    fn test_attempt_refused_while_draining() {
        let state = running(3);
        state.begin_draining();
        assert!(!state.record_attempt());
    }

    #[test]
    fn test_no_mutation_after_complete() {
        let state = running(3);
        state.record_attempt();
        state.finish();
        assert!(!state.record_attempt());
        assert!(!state.record_success());
        state.record_send_failure();
        state.record_discard();
        let snap = state.snapshot();
        assert_eq!(snap.completed, 1);
        assert_eq!(snap.successful, 0);
        assert_eq!(snap.send_failures, 0);
        assert_eq!(snap.discarded, 0);
    }

    #[test]
    fn test_cancel_is_idempotent_and_terminal() {
        let state = running(1000);
        for _ in 0..10 {
            state.record_attempt();
        }
        assert!(state.cancel());
        assert!(state.is_complete());
        assert!(!state.cancel());
        assert_eq!(state.finish(), ScanPhase::Cancelled);
        assert!(!state.record_attempt());
        assert_eq!(state.snapshot().completed, 10);
    }

    #[test]
    fn test_complete_empty() {
        let state = SharedState::new();
        state.complete_empty().unwrap();
        assert!(state.is_complete());
        assert_eq!(state.phase(), ScanPhase::Complete);
        assert_eq!(state.snapshot().percent_complete(), 100.0);
    }

    #[test]
    fn test_concurrent_increments_not_lost() {
        let state = running(40_000);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let s = state.clone();
                std::thread::spawn(move || {
                    for _ in 0..10_000 {
                        s.record_attempt();
                        s.record_discard();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let snap = state.snapshot();
        assert_eq!(snap.completed, 40_000);
        assert_eq!(snap.discarded, 40_000);
    }

    #[test]
    fn test_elapsed_frozen_after_finish() {
        let state = running(1);
        state.finish();
        let a = state.elapsed();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(a, state.elapsed());
    }
}
