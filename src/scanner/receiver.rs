//! Asynchronous response capture and validation.
//!
//! The receiver runs on its own blocking worker, polling the capture handle
//! with a short timeout so it can observe its stop token between reads. Every
//! inbound packet is parsed, classified and checked against the cookie
//! recomputed from its source address. Anything that fails is discarded.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::error::{ParseError, ScanError};
use crate::sink::ResultSink;
use crate::state::SharedState;
use crate::targets::AddressSpace;
use crate::{ResponseKind, ScanRecord};

use super::cookie::Validator;
use super::transport::{tcp_flags, PacketCapture};

/// Default capture poll timeout; bounds how long a stop request can go unseen.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Shortest accepted poll timeout. A zero read timeout on a raw socket blocks
/// forever, which would leave the stop token unobserved.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

const IPPROTO_TCP: u8 = 6;

/// Header fields the receiver needs from an inbound TCP/IPv4 packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedResponse {
    pub saddr: Ipv4Addr,
    pub daddr: Ipv4Addr,
    pub sport: u16,
    pub dport: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub ttl: u8,
    pub window: u16,
}

impl ParsedResponse {
    /// RST takes precedence; a bare ACK or SYN is not a probe response.
    pub fn kind(&self) -> Option<ResponseKind> {
        if self.flags & tcp_flags::RST != 0 {
            Some(ResponseKind::Rst)
        } else if self.flags & (tcp_flags::SYN | tcp_flags::ACK) == tcp_flags::SYN | tcp_flags::ACK {
            Some(ResponseKind::SynAck)
        } else {
            None
        }
    }
}

/// Parse the IPv4 and TCP headers of a captured packet (no link-layer framing).
pub fn parse_response(packet: &[u8]) -> Result<ParsedResponse, ParseError> {
    if packet.len() < 20 {
        return Err(ParseError::Truncated(packet.len()));
    }
    let version = packet[0] >> 4;
    if version != 4 {
        return Err(ParseError::NotIpv4(version));
    }
    let ihl = usize::from(packet[0] & 0x0f) * 4;
    if ihl < 20 || ihl > packet.len() {
        return Err(ParseError::BadHeaderLength(ihl));
    }
    if packet[9] != IPPROTO_TCP {
        return Err(ParseError::NotTcp(packet[9]));
    }
    let tcp = &packet[ihl..];
    if tcp.len() < 20 {
        return Err(ParseError::Truncated(packet.len()));
    }

    Ok(ParsedResponse {
        saddr: Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]),
        daddr: Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]),
        sport: u16::from_be_bytes([tcp[0], tcp[1]]),
        dport: u16::from_be_bytes([tcp[2], tcp[3]]),
        seq: u32::from_be_bytes([tcp[4], tcp[5], tcp[6], tcp[7]]),
        ack: u32::from_be_bytes([tcp[8], tcp[9], tcp[10], tcp[11]]),
        flags: tcp[13],
        ttl: packet[8],
        window: u16::from_be_bytes([tcp[14], tcp[15]]),
    })
}

// =============================================================================
// Credit map
// =============================================================================

const PAGE_BITS: usize = 1 << 16;
const PAGE_WORDS: usize = PAGE_BITS / 64;
const PAGE_COUNT: usize = 1 << 16;

/// Set of IPv4 addresses that already produced a validated response.
///
/// The 32-bit space is split into 65536 pages of 65536 bits; a page is
/// allocated on its first insert, so memory follows the responders.
pub struct CreditMap {
    pages: Vec<Option<Box<[u64; PAGE_WORDS]>>>,
    len: u64,
}

impl std::fmt::Debug for CreditMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreditMap")
            .field("len", &self.len)
            .field("pages", &self.allocated_pages())
            .finish()
    }
}

impl Default for CreditMap {
    fn default() -> Self {
        Self::new()
    }
}

impl CreditMap {
    pub fn new() -> Self {
        Self {
            pages: vec![None; PAGE_COUNT],
            len: 0,
        }
    }

    fn locate(addr: Ipv4Addr) -> (usize, usize, u64) {
        let v = u32::from(addr) as usize;
        let page = v >> 16;
        let bit = v & (PAGE_BITS - 1);
        (page, bit / 64, 1u64 << (bit % 64))
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let (page, word, mask) = Self::locate(addr);
        self.pages[page]
            .as_ref()
            .is_some_and(|p| p[word] & mask != 0)
    }

    /// Mark `addr`. Returns false if it was already marked.
    pub fn insert(&mut self, addr: Ipv4Addr) -> bool {
        let (page, word, mask) = Self::locate(addr);
        let bits = self.pages[page].get_or_insert_with(|| Box::new([0u64; PAGE_WORDS]));
        if bits[word] & mask != 0 {
            return false;
        }
        bits[word] |= mask;
        self.len += 1;
        true
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn allocated_pages(&self) -> usize {
        self.pages.iter().filter(|p| p.is_some()).count()
    }
}

// =============================================================================
// Receiver
// =============================================================================

/// What happened to one captured packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Validated SYN-ACK for a new target.
    Credited,
    /// Validated response from a target that already answered.
    Duplicate,
    /// Validated RST.
    Failure,
    /// Malformed, unrelated or forged.
    Discarded,
}

/// Owns the capture handle for the lifetime of the scan.
pub struct Receiver {
    capture: Box<dyn PacketCapture>,
    validator: Validator,
    space: Arc<AddressSpace>,
    port: u16,
    src_ports: (u16, u16),
    answered: CreditMap,
    credited: u64,
    state: SharedState,
    sink: Box<dyn ResultSink>,
    poll_interval: Duration,
    max_results: Option<u64>,
    halt: CancellationToken,
}

impl Receiver {
    pub fn new(
        capture: Box<dyn PacketCapture>,
        validator: Validator,
        space: Arc<AddressSpace>,
        port: u16,
        src_ports: (u16, u16),
        state: SharedState,
        sink: Box<dyn ResultSink>,
    ) -> Self {
        Self {
            capture,
            validator,
            space,
            port,
            src_ports,
            answered: CreditMap::new(),
            credited: 0,
            state,
            sink,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_results: None,
            halt: CancellationToken::new(),
        }
    }

    /// Cancel `halt` once `max` targets have been credited.
    pub fn with_max_results(mut self, max: Option<u64>, halt: CancellationToken) -> Self {
        self.max_results = max;
        self.halt = halt;
        self
    }

    /// Capture poll timeout, clamped to `MIN_POLL_INTERVAL`.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(MIN_POLL_INTERVAL);
        self
    }

    /// Process one captured packet.
    pub fn handle_packet(&mut self, packet: &[u8]) -> Verdict {
        let resp = match parse_response(packet) {
            Ok(r) => r,
            Err(e) => {
                tracing::trace!(error = %e, len = packet.len(), "discarding unparseable packet");
                return self.discard();
            }
        };
        let Some(kind) = resp.kind() else {
            return self.discard();
        };
        if resp.sport != self.port || !self.space.contains(resp.saddr) {
            return self.discard();
        }
        if !self
            .validator
            .check(resp.saddr, resp.sport, resp.dport, resp.ack, self.src_ports)
        {
            tracing::trace!(source = %resp.saddr, "discarding response with bad cookie");
            return self.discard();
        }

        // The first validated response from a target decides its outcome.
        if self.answered.contains(resp.saddr) {
            self.state.record_duplicate();
            return Verdict::Duplicate;
        }
        match kind {
            ResponseKind::Rst => {
                self.answered.insert(resp.saddr);
                self.state.record_failure();
                Verdict::Failure
            }
            ResponseKind::SynAck => self.credit(&resp),
        }
    }

    fn discard(&self) -> Verdict {
        self.state.record_discard();
        Verdict::Discarded
    }

    fn credit(&mut self, resp: &ParsedResponse) -> Verdict {
        if !self.state.record_success() {
            return self.discard();
        }
        self.answered.insert(resp.saddr);
        self.credited += 1;

        let record = ScanRecord {
            saddr: resp.saddr,
            sport: resp.sport,
            dport: resp.dport,
            kind: ResponseKind::SynAck,
            ttl: resp.ttl,
            window: resp.window,
            received_at: Utc::now(),
        };
        if let Err(e) = self.sink.append(&record) {
            tracing::warn!(source = %resp.saddr, error = %e, "result sink append failed");
        }

        if let Some(max) = self.max_results {
            if self.credited >= max && !self.halt.is_cancelled() {
                tracing::info!(max_results = max, "result limit reached");
                self.halt.cancel();
            }
        }
        Verdict::Credited
    }

    /// Capture until `stop` fires and return the number of credited targets.
    /// Consumes the receiver; the capture handle is released when this returns.
    pub fn run(mut self, stop: CancellationToken) -> Result<u64, ScanError> {
        let result = loop {
            if stop.is_cancelled() {
                break Ok(());
            }
            match self.capture.next_packet(self.poll_interval) {
                Ok(Some(packet)) => {
                    self.handle_packet(&packet);
                }
                Ok(None) => {}
                Err(e) => break Err(e),
            }
        };
        if let Err(e) = self.sink.flush() {
            tracing::warn!(error = %e, "result sink flush failed");
        }
        result.map(|()| self.credited)
    }
}

// =============================================================================
// Tests
// =============================================================================
