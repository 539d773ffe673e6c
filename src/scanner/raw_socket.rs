//! Raw socket transport (Linux).
//!
//! Transmit uses `SOCK_RAW / IPPROTO_RAW`, which implies `IP_HDRINCL`: the
//! kernel sends the IPv4 header produced by `ProbeBuilder` verbatim.
//! Capture uses `SOCK_RAW / IPPROTO_TCP`, which delivers a copy of every
//! inbound TCP segment with its IPv4 header. Both require `CAP_NET_RAW`.
//!
//! The kernel TCP stack still sees SYN-ACKs for our probes and answers them
//! with RSTs; that does not affect validation.

use std::net::{Ipv4Addr, UdpSocket};
#[cfg(target_os = "linux")]
use std::time::Duration;

use crate::error::ScanError;

#[cfg(target_os = "linux")]
use super::transport::{PacketCapture, ProbeTransmit, Transport};

/// Detect the source IP address that would be used to reach `target`.
///
/// Uses the UDP connect trick: connecting a UDP socket sends nothing, but the
/// OS routing table fills in the local address.
pub fn detect_source_ip(target: Ipv4Addr) -> Result<Ipv4Addr, ScanError> {
    let sock = UdpSocket::bind("0.0.0.0:0")
        .map_err(|e| ScanError::Resource(format!("source IP detection: {}", e)))?;
    sock.connect((target, 80))
        .map_err(|e| ScanError::Resource(format!("source IP detection: {}", e)))?;
    match sock
        .local_addr()
        .map_err(|e| ScanError::Resource(format!("source IP detection: {}", e)))?
        .ip()
    {
        std::net::IpAddr::V4(ip) => Ok(ip),
        _ => Err(ScanError::Resource("expected IPv4 source address".to_string())),
    }
}

/// Opens raw sockets for a scan.
#[derive(Debug, Clone)]
pub struct RawSocketTransport {
    src_ip: Option<Ipv4Addr>,
    route_hint: Ipv4Addr,
}

impl RawSocketTransport {
    /// `src_ip = None` detects the source address from the route to `route_hint`.
    pub fn new(src_ip: Option<Ipv4Addr>, route_hint: Ipv4Addr) -> Self {
        Self { src_ip, route_hint }
    }

    fn resolve_src_ip(&self) -> Result<Ipv4Addr, ScanError> {
        match self.src_ip {
            Some(ip) => Ok(ip),
            None => detect_source_ip(self.route_hint),
        }
    }
}

#[cfg(target_os = "linux")]
impl Transport for RawSocketTransport {
    fn open_capture(&mut self) -> Result<Box<dyn PacketCapture>, ScanError> {
        Ok(Box::new(RawSocketCapture::new()?))
    }

    fn open_transmit(&mut self) -> Result<Box<dyn ProbeTransmit>, ScanError> {
        let src_ip = self.resolve_src_ip()?;
        Ok(Box::new(RawSocketSender::new(src_ip)?))
    }
}

#[cfg(not(target_os = "linux"))]
impl super::transport::Transport for RawSocketTransport {
    fn open_capture(&mut self) -> Result<Box<dyn super::transport::PacketCapture>, ScanError> {
        Err(ScanError::Resource("raw socket capture requires Linux".into()))
    }

    fn open_transmit(&mut self) -> Result<Box<dyn super::transport::ProbeTransmit>, ScanError> {
        let _ = self.resolve_src_ip()?;
        Err(ScanError::Resource("raw socket transmit requires Linux".into()))
    }
}

/// Raw IPv4 transmit handle. Closes its socket on drop.
#[cfg(target_os = "linux")]
pub struct RawSocketSender {
    fd: i32,
    src_ip: Ipv4Addr,
}

#[cfg(target_os = "linux")]
impl RawSocketSender {
    /// Open `SOCK_RAW / IPPROTO_RAW`. Requires `CAP_NET_RAW`.
    pub fn new(src_ip: Ipv4Addr) -> Result<Self, ScanError> {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_RAW, libc::IPPROTO_RAW) };
        if fd < 0 {
            return Err(ScanError::Resource(format!(
                "SOCK_RAW/IPPROTO_RAW socket creation failed (requires CAP_NET_RAW): {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(Self { fd, src_ip })
    }
}

#[cfg(target_os = "linux")]
impl Drop for RawSocketSender {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe { libc::close(self.fd) };
        }
    }
}

#[cfg(target_os = "linux")]
impl ProbeTransmit for RawSocketSender {
    fn send_raw(&mut self, packet: &[u8]) -> Result<(), ScanError> {
        if packet.len() < 20 {
            return Err(ScanError::Send(format!(
                "packet too short for IPv4 header: {} bytes",
                packet.len()
            )));
        }

        // sin_addr is stored in network byte order, which is the packet's byte order.
        let dst_addr = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: 0,
            sin_addr: libc::in_addr {
                s_addr: u32::from_ne_bytes([packet[16], packet[17], packet[18], packet[19]]),
            },
            sin_zero: [0; 8],
        };

        let ret = unsafe {
            libc::sendto(
                self.fd,
                packet.as_ptr() as *const libc::c_void,
                packet.len(),
                0,
                &dst_addr as *const libc::sockaddr_in as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };

        if ret < 0 {
            return Err(ScanError::Send(format!(
                "raw socket sendto failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    fn source_ip(&self) -> Ipv4Addr {
        self.src_ip
    }
}

/// Raw TCP capture handle. Closes its socket on drop.
#[cfg(target_os = "linux")]
pub struct RawSocketCapture {
    fd: i32,
    timeout: Option<Duration>,
    buf: Vec<u8>,
}

#[cfg(target_os = "linux")]
impl RawSocketCapture {
    /// Open `SOCK_RAW / IPPROTO_TCP`. Requires `CAP_NET_RAW`.
    pub fn new() -> Result<Self, ScanError> {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_RAW, libc::IPPROTO_TCP) };
        if fd < 0 {
            return Err(ScanError::Resource(format!(
                "SOCK_RAW/IPPROTO_TCP capture socket failed (requires CAP_NET_RAW): {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(Self {
            fd,
            timeout: None,
            buf: vec![0u8; 65536],
        })
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), ScanError> {
        if self.timeout == Some(timeout) {
            return Ok(());
        }
        let tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };
        let ret = unsafe {
            libc::setsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const libc::timeval as *const libc::c_void,
                std::mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(ScanError::Resource(format!(
                "SO_RCVTIMEO failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        self.timeout = Some(timeout);
        Ok(())
    }
}

#[cfg(target_os = "linux")]
impl Drop for RawSocketCapture {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe { libc::close(self.fd) };
        }
    }
}

#[cfg(target_os = "linux")]
impl PacketCapture for RawSocketCapture {
    fn next_packet(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, ScanError> {
        self.set_timeout(timeout)?;
        let ret = unsafe {
            libc::recv(
                self.fd,
                self.buf.as_mut_ptr() as *mut libc::c_void,
                self.buf.len(),
                0,
            )
        };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            return match err.kind() {
                std::io::ErrorKind::WouldBlock
                | std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::Interrupted => Ok(None),
                _ => Err(ScanError::Resource(format!("raw capture recv failed: {}", err))),
            };
        }
        Ok(Some(self.buf[..ret as usize].to_vec()))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
#[cfg(target_os = "linux")]
mod tests {
    use super::*;

    /// A sender without a real socket (fd=-1); drop skips close().
    fn make_test_sender(src_ip: Ipv4Addr) -> RawSocketSender {
        RawSocketSender { fd: -1, src_ip }
    }

    #[test]
    fn test_raw_socket_sender_source_ip() {
        let ip = Ipv4Addr::new(192, 168, 100, 50);
        assert_eq!(make_test_sender(ip).source_ip(), ip);
    }

    #[test]
    fn test_raw_socket_sender_rejects_short_packet() {
        let mut sender = make_test_sender(Ipv4Addr::new(10, 0, 0, 1));
        let err = sender.send_raw(&[0u8; 12]).unwrap_err();
        assert!(matches!(err, ScanError::Send(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn test_raw_socket_sender_as_trait_object() {
        let sender: Box<dyn ProbeTransmit> = Box::new(make_test_sender(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(sender.source_ip(), Ipv4Addr::new(10, 0, 0, 1));
    }

    #[test]
    fn test_transport_uses_explicit_source_ip() {
        let t = RawSocketTransport::new(Some(Ipv4Addr::new(10, 1, 1, 1)), Ipv4Addr::new(8, 8, 8, 8));
        assert_eq!(t.resolve_src_ip().unwrap(), Ipv4Addr::new(10, 1, 1, 1));
    }

    #[test]
    #[ignore] // Requires CAP_NET_RAW; run with: sudo cargo test --lib -- --ignored
    fn test_raw_sockets_open() {
        let mut t = RawSocketTransport::new(Some(Ipv4Addr::LOCALHOST), Ipv4Addr::LOCALHOST);
        assert!(t.open_transmit().is_ok());
        let mut cap = t.open_capture().unwrap();
        assert!(cap.next_packet(Duration::from_millis(10)).is_ok());
    }
}
