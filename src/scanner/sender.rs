//! Stateless sending flow.
//!
//! Each call to [`Sender::send_next`] waits for a rate permit, takes the next
//! target from the permutation, embeds the target's cookie in a SYN probe and
//! hands it to the transport. Nothing about the probe is kept afterwards.

use std::net::Ipv4Addr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::ScanError;
use crate::state::SharedState;
use crate::targets::{AddressSpace, TargetCursor};

use super::cookie::Validator;
use super::probe::{ProbeBuilder, ProbeProfile};
use super::rate::RateLimiter;
use super::transport::ProbeTransmit;

/// Result of one `send_next` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// A probe for this target was handed to the transport.
    Sent(Ipv4Addr),
    /// Every eligible target has been dispatched.
    Exhausted,
    /// The scan left Running (cancelled or early stop); nothing was sent.
    Halted,
}

/// Owns the enumeration cursor, the rate limiter and the transmit handle.
pub struct Sender {
    cursor: TargetCursor,
    limiter: RateLimiter,
    transmit: Box<dyn ProbeTransmit>,
    builder: ProbeBuilder,
    validator: Validator,
    port: u16,
    state: SharedState,
}

impl std::fmt::Debug for Sender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sender")
            .field("port", &self.port)
            .field("dispatched", &self.cursor.yielded())
            .field("rate", &self.limiter.rate())
            .finish_non_exhaustive()
    }
}

impl Sender {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        space: Arc<AddressSpace>,
        limiter: RateLimiter,
        transmit: Box<dyn ProbeTransmit>,
        validator: Validator,
        port: u16,
        src_ports: (u16, u16),
        profile: ProbeProfile,
        state: SharedState,
    ) -> Self {
        let builder = ProbeBuilder::new(profile, transmit.source_ip(), src_ports);
        Self {
            cursor: TargetCursor::new(space),
            limiter,
            transmit,
            builder,
            validator,
            port,
            state,
        }
    }

    /// Source address written into every probe.
    pub fn source_ip(&self) -> Ipv4Addr {
        self.builder.src_ip()
    }

    /// Probes built so far, including ones the transport refused.
    pub fn probes_built(&self) -> u32 {
        self.builder.built()
    }

    /// Send the next probe.
    ///
    /// A transport refusal is returned as `ScanError::TransientSend`; the
    /// target has already been counted as completed and the caller should
    /// simply continue.
    pub async fn send_next(&mut self, cancel: &CancellationToken) -> Result<SendOutcome, ScanError> {
        if self.limiter.acquire(cancel).await.is_none() {
            return Ok(SendOutcome::Halted);
        }
        let Some(target) = self.cursor.next() else {
            return Ok(SendOutcome::Exhausted);
        };
        if !self.state.record_attempt() {
            return Ok(SendOutcome::Halted);
        }

        let cookie = self.validator.cookie(target, self.port);
        let packet = self.builder.build(target, self.port, &cookie);
        match self.transmit.send_raw(&packet) {
            Ok(()) => Ok(SendOutcome::Sent(target)),
            Err(e) => {
                self.state.record_send_failure();
                tracing::debug!(target_addr = %target, error = %e, "probe not transmitted");
                Err(ScanError::TransientSend {
                    target,
                    reason: e.to_string(),
                })
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
