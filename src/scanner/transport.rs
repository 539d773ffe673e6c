//! Packet transport abstraction for the sending and receiving flows.
//!
//! The sender owns a `ProbeTransmit`, the receiver owns a `PacketCapture`,
//! and a `Transport` opens both. Real raw-socket I/O lives in
//! `raw_socket`; this module carries the in-memory `MockNetwork` used by
//! tests and the `DryRunTransport` used by `--dryrun`.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::ScanError;

use super::probe::{compute_ip_checksum, compute_tcp_checksum};

/// Raw IPv4 packet transmission.
pub trait ProbeTransmit: Send {
    /// Send a complete, checksummed IPv4 packet (no Ethernet framing).
    fn send_raw(&mut self, packet: &[u8]) -> Result<(), ScanError>;

    /// Source address probes are built with.
    fn source_ip(&self) -> Ipv4Addr;
}

/// Blocking capture of inbound IPv4 packets.
pub trait PacketCapture: Send {
    /// Wait up to `timeout` for the next packet. `Ok(None)` means nothing
    /// arrived in time, which lets the caller check its stop signal.
    fn next_packet(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, ScanError>;
}

/// Opens the transmit and capture sides of a scan.
pub trait Transport: Send {
    /// Open the capture session. Failure is fatal to the scan.
    fn open_capture(&mut self) -> Result<Box<dyn PacketCapture>, ScanError>;

    /// Open the transmit handle. Failure is fatal to the scan.
    fn open_transmit(&mut self) -> Result<Box<dyn ProbeTransmit>, ScanError>;
}

// =============================================================================
// Mock implementation for unit testing
// =============================================================================

/// Computes replies to a sent probe; each returned packet is queued for capture.
pub type Responder = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>;

/// In-memory network: records probes, replays replies into the capture side.
pub struct MockNetwork {
    src_ip: Ipv4Addr,
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
    inject_tx: mpsc::Sender<Vec<u8>>,
    inject_rx: Option<mpsc::Receiver<Vec<u8>>>,
    responder: Option<Responder>,
    fail_sends: Arc<AtomicUsize>,
    fail_capture: bool,
    capture_lost: Arc<AtomicBool>,
}

impl MockNetwork {
    /// New mock with a fixed source IP of 192.168.1.100.
    pub fn new() -> Self {
        let (inject_tx, inject_rx) = mpsc::channel();
        Self {
            src_ip: Ipv4Addr::new(192, 168, 1, 100),
            sent: Arc::new(Mutex::new(Vec::new())),
            inject_tx,
            inject_rx: Some(inject_rx),
            responder: None,
            fail_sends: Arc::new(AtomicUsize::new(0)),
            fail_capture: false,
            capture_lost: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Reply to each probe with whatever `responder` returns.
    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static,
    {
        self.responder = Some(Box::new(responder));
        self
    }

    /// Make `open_capture` fail.
    pub fn with_capture_failure(mut self) -> Self {
        self.fail_capture = true;
        self
    }

    /// Switch that, once set, makes every later capture read fail.
    pub fn capture_loss_switch(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.capture_lost)
    }

    /// Make the next `n` sends fail.
    pub fn fail_next_sends(&self, n: usize) {
        self.fail_sends.store(n, Ordering::SeqCst);
    }

    /// Handle for pushing arbitrary frames into the capture side.
    pub fn injector(&self) -> mpsc::Sender<Vec<u8>> {
        self.inject_tx.clone()
    }

    /// Shared log of every probe handed to the transmit side.
    pub fn sent_log(&self) -> Arc<Mutex<Vec<Vec<u8>>>> {
        Arc::clone(&self.sent)
    }
}

impl Default for MockNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockNetwork {
    fn open_capture(&mut self) -> Result<Box<dyn PacketCapture>, ScanError> {
        if self.fail_capture {
            return Err(ScanError::Resource("mock capture unavailable".into()));
        }
        let rx = self
            .inject_rx
            .take()
            .ok_or_else(|| ScanError::Resource("mock capture already opened".into()))?;
        Ok(Box::new(MockCapture {
            rx,
            lost: Arc::clone(&self.capture_lost),
        }))
    }

    fn open_transmit(&mut self) -> Result<Box<dyn ProbeTransmit>, ScanError> {
        Ok(Box::new(MockTransmit {
            src_ip: self.src_ip,
            sent: Arc::clone(&self.sent),
            inject_tx: self.inject_tx.clone(),
            responder: self.responder.take(),
            fail_sends: Arc::clone(&self.fail_sends),
        }))
    }
}

struct MockTransmit {
    src_ip: Ipv4Addr,
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
    inject_tx: mpsc::Sender<Vec<u8>>,
    responder: Option<Responder>,
    fail_sends: Arc<AtomicUsize>,
}

impl ProbeTransmit for MockTransmit {
    fn send_raw(&mut self, packet: &[u8]) -> Result<(), ScanError> {
        let failing = self
            .fail_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ScanError::Send("mock send failure".into()));
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(packet.to_vec());
        }
        if let Some(responder) = self.responder.as_mut() {
            for reply in responder(packet) {
                // Receiver gone means the scan is winding down.
                let _ = self.inject_tx.send(reply);
            }
        }
        Ok(())
    }

    fn source_ip(&self) -> Ipv4Addr {
        self.src_ip
    }
}

struct MockCapture {
    rx: mpsc::Receiver<Vec<u8>>,
    lost: Arc<AtomicBool>,
}

impl PacketCapture for MockCapture {
    fn next_packet(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, ScanError> {
        if self.lost.load(Ordering::SeqCst) {
            return Err(ScanError::Resource("mock capture lost".into()));
        }
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(mpsc::RecvTimeoutError::Timeout) => Ok(None),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                std::thread::sleep(timeout);
                Ok(None)
            }
        }
    }
}

/// TCP flag bits used when crafting replies.
pub mod tcp_flags {
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const ACK: u8 = 0x10;
}

/// Craft the reply a host would send to `probe`, acknowledging
/// `probe.seq + ack_offset` with the given TCP `flags`.
///
/// `ack_offset == 1` gives a genuine reply; anything else forges a bad cookie.
/// Returns an empty vec if `probe` is not a 60-byte SYN probe.
pub fn craft_reply(probe: &[u8], flags: u8, ack_offset: u32) -> Vec<u8> {
    if probe.len() < 40 {
        return Vec::new();
    }
    let src = Ipv4Addr::new(probe[16], probe[17], probe[18], probe[19]);
    let dst = Ipv4Addr::new(probe[12], probe[13], probe[14], probe[15]);
    let seq = u32::from_be_bytes([probe[24], probe[25], probe[26], probe[27]]);

    let mut reply = vec![0u8; 40];
    reply[0] = 0x45;
    reply[2..4].copy_from_slice(&40u16.to_be_bytes());
    reply[8] = 57;
    reply[9] = 0x06;
    reply[12..16].copy_from_slice(&src.octets());
    reply[16..20].copy_from_slice(&dst.octets());
    // Ports swapped relative to the probe.
    reply[20..22].copy_from_slice(&probe[22..24]);
    reply[22..24].copy_from_slice(&probe[20..22]);
    reply[24..28].copy_from_slice(&0x1234_5678u32.to_be_bytes());
    reply[28..32].copy_from_slice(&seq.wrapping_add(ack_offset).to_be_bytes());
    reply[32] = 5 << 4;
    reply[33] = flags;
    reply[34..36].copy_from_slice(&29200u16.to_be_bytes());

    let tcp_checksum = compute_tcp_checksum(&reply[20..], &src, &dst);
    reply[36..38].copy_from_slice(&tcp_checksum.to_be_bytes());
    let ip_checksum = compute_ip_checksum(&reply[0..20]);
    reply[10..12].copy_from_slice(&ip_checksum.to_be_bytes());
    reply
}

// =============================================================================
// Dry run
// =============================================================================

/// Transport that paces and builds probes but never touches the network.
#[derive(Debug, Clone)]
pub struct DryRunTransport {
    src_ip: Ipv4Addr,
}

impl DryRunTransport {
    pub fn new(src_ip: Ipv4Addr) -> Self {
        Self { src_ip }
    }
}

impl Transport for DryRunTransport {
    fn open_capture(&mut self) -> Result<Box<dyn PacketCapture>, ScanError> {
        Ok(Box::new(SilentCapture))
    }

    fn open_transmit(&mut self) -> Result<Box<dyn ProbeTransmit>, ScanError> {
        Ok(Box::new(LoggingTransmit {
            src_ip: self.src_ip,
        }))
    }
}

struct LoggingTransmit {
    src_ip: Ipv4Addr,
}

impl ProbeTransmit for LoggingTransmit {
    fn send_raw(&mut self, packet: &[u8]) -> Result<(), ScanError> {
        if packet.len() >= 24 {
            let dst = Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]);
            let dport = u16::from_be_bytes([packet[22], packet[23]]);
            tracing::info!(target_addr = %dst, port = dport, len = packet.len(), "dryrun probe");
        }
        Ok(())
    }

    fn source_ip(&self) -> Ipv4Addr {
        self.src_ip
    }
}

struct SilentCapture;

impl PacketCapture for SilentCapture {
    fn next_packet(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, ScanError> {
        std::thread::sleep(timeout);
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::cookie::Cookie;
    use crate::scanner::probe::{ProbeBuilder, ProbeProfile};

    fn probe() -> Vec<u8> {
        let cookie = Cookie {
            seq: 100,
            port_selector: 5,
        };
        ProbeBuilder::new(ProbeProfile::default(), Ipv4Addr::new(192, 168, 1, 100), (40000, 40010))
            .build(Ipv4Addr::new(10, 0, 0, 7), 80, &cookie)
            .to_vec()
    }

    #[test]
    fn test_mock_records_sent_packets() {
        let mut net = MockNetwork::new();
        let log = net.sent_log();
        let mut tx = net.open_transmit().unwrap();
        tx.send_raw(&[1, 2, 3]).unwrap();
        tx.send_raw(&[4, 5]).unwrap();
        assert_eq!(log.lock().unwrap().len(), 2);
        assert_eq!(tx.source_ip(), Ipv4Addr::new(192, 168, 1, 100));
    }

    #[test]
    fn test_mock_fail_next_sends() {
        let mut net = MockNetwork::new();
        net.fail_next_sends(2);
        let mut tx = net.open_transmit().unwrap();
        assert!(tx.send_raw(&[0]).is_err());
        assert!(tx.send_raw(&[0]).is_err());
        assert!(tx.send_raw(&[0]).is_ok());
    }

    #[test]
    fn test_mock_capture_opens_once() {
        let mut net = MockNetwork::new();
        assert!(net.open_capture().is_ok());
        assert!(matches!(net.open_capture(), Err(ScanError::Resource(_))));
    }

    #[test]
    fn test_mock_capture_failure() {
        let mut net = MockNetwork::new().with_capture_failure();
        assert!(matches!(net.open_capture(), Err(ScanError::Resource(_))));
    }

    #[test]
    fn test_mock_capture_loss_switch() {
        let mut net = MockNetwork::new();
        let lose = net.capture_loss_switch();
        let mut cap = net.open_capture().unwrap();
        assert_eq!(cap.next_packet(Duration::from_millis(1)).unwrap(), None);
        lose.store(true, Ordering::SeqCst);
        assert!(matches!(
            cap.next_packet(Duration::from_millis(1)),
            Err(ScanError::Resource(_))
        ));
    }

    #[test]
    fn test_mock_capture_times_out_then_delivers() {
        let mut net = MockNetwork::new();
        let mut cap = net.open_capture().unwrap();
        assert_eq!(cap.next_packet(Duration::from_millis(5)).unwrap(), None);
        net.injector().send(vec![9, 9]).unwrap();
        assert_eq!(
            cap.next_packet(Duration::from_millis(5)).unwrap(),
            Some(vec![9, 9])
        );
    }

    #[test]
    fn test_responder_feeds_capture() {
        let mut net = MockNetwork::new()
            .with_responder(|p| vec![craft_reply(p, tcp_flags::SYN | tcp_flags::ACK, 1)]);
        let mut cap = net.open_capture().unwrap();
        let mut tx = net.open_transmit().unwrap();
        tx.send_raw(&probe()).unwrap();
        let reply = cap.next_packet(Duration::from_millis(50)).unwrap().unwrap();
        assert_eq!(reply.len(), 40);
    }

    #[test]
    fn test_craft_reply_mirrors_probe() {
        let p = probe();
        let r = craft_reply(&p, tcp_flags::SYN | tcp_flags::ACK, 1);
        assert_eq!(&r[12..16], &p[16..20], "reply source is probe target");
        assert_eq!(&r[16..20], &p[12..16]);
        assert_eq!(&r[20..22], &p[22..24]);
        assert_eq!(&r[22..24], &p[20..22]);
        assert_eq!(u32::from_be_bytes([r[28], r[29], r[30], r[31]]), 101);
        assert_eq!(r[33], 0x12);
    }

    #[test]
    fn test_craft_reply_rejects_short_input() {
        assert!(craft_reply(&[0u8; 10], tcp_flags::RST, 1).is_empty());
    }

    #[test]
    fn test_dryrun_capture_is_silent() {
        let mut t = DryRunTransport::new(Ipv4Addr::LOCALHOST);
        let mut cap = t.open_capture().unwrap();
        assert_eq!(cap.next_packet(Duration::from_millis(1)).unwrap(), None);
        let mut tx = t.open_transmit().unwrap();
        assert!(tx.send_raw(&probe()).is_ok());
    }
}
