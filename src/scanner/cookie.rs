//! Keyed probe cookies.
//!
//! A cookie is a deterministic function of `(target, port, secret)`. The
//! sender embeds it in the SYN (sequence number + source port) and the
//! receiver recomputes it from the response's source address, so no
//! per-target state is kept between the two.

use std::net::Ipv4Addr;

use sha2::{Digest, Sha256};

/// Cookie material for one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cookie {
    /// Carried in the TCP sequence number; echoed back as `ack - 1`.
    pub seq: u32,
    /// Selects the source port within the configured ephemeral range.
    pub port_selector: u32,
}

impl Cookie {
    /// Source port this cookie maps to within `range` (inclusive).
    pub fn src_port(&self, range: (u16, u16)) -> u16 {
        let span = u32::from(range.1) - u32::from(range.0) + 1;
        range.0 + (self.port_selector % span) as u16
    }
}

/// Computes and checks cookies under one scan secret.
#[derive(Clone)]
pub struct Validator {
    secret: [u8; 16],
}

impl std::fmt::Debug for Validator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Validator").finish_non_exhaustive()
    }
}

impl Validator {
    pub fn new(secret: [u8; 16]) -> Self {
        Self { secret }
    }

    /// Cookie for a probe to `target:port`.
    pub fn cookie(&self, target: Ipv4Addr, port: u16) -> Cookie {
        let mut hasher = Sha256::new();
        hasher.update(self.secret);
        hasher.update(target.octets());
        hasher.update(port.to_be_bytes());
        let digest = hasher.finalize();
        Cookie {
            seq: u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]),
            port_selector: u32::from_be_bytes([digest[4], digest[5], digest[6], digest[7]]),
        }
    }

    /// Whether a response from `source:port` that acknowledges `ack` and is
    /// addressed to `dst_port` answers a probe sent under this secret.
    pub fn check(
        &self,
        source: Ipv4Addr,
        port: u16,
        dst_port: u16,
        ack: u32,
        src_ports: (u16, u16),
    ) -> bool {
        let expected = self.cookie(source, port);
        ack == expected.seq.wrapping_add(1) && dst_port == expected.src_port(src_ports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PORTS: (u16, u16) = (32768, 61000);

    #[test]
    fn test_cookie_deterministic() {
        let v = Validator::new([7u8; 16]);
        let t = Ipv4Addr::new(10, 0, 0, 1);
        assert_eq!(v.cookie(t, 80), v.cookie(t, 80));
    }

    #[test]
    fn test_cookie_depends_on_all_inputs() {
        let v = Validator::new([7u8; 16]);
        let other = Validator::new([8u8; 16]);
        let t = Ipv4Addr::new(10, 0, 0, 1);
        assert_ne!(v.cookie(t, 80), v.cookie(Ipv4Addr::new(10, 0, 0, 2), 80));
        assert_ne!(v.cookie(t, 80), v.cookie(t, 443));
        assert_ne!(v.cookie(t, 80), other.cookie(t, 80));
    }

    #[test]
    fn test_src_port_within_range() {
        let v = Validator::new([1u8; 16]);
        for i in 0..500u32 {
            let c = v.cookie(Ipv4Addr::from(0x0A00_0000 + i), 80);
            let p = c.src_port(PORTS);
            assert!((PORTS.0..=PORTS.1).contains(&p), "port {p} out of range");
        }
    }

    #[test]
    fn test_single_port_range() {
        let c = Cookie {
            seq: 0,
            port_selector: 123_456,
        };
        assert_eq!(c.src_port((40000, 40000)), 40000);
    }

    #[test]
    fn test_check_accepts_genuine_response() {
        let v = Validator::new([3u8; 16]);
        let t = Ipv4Addr::new(192, 0, 2, 10);
        let c = v.cookie(t, 443);
        assert!(v.check(t, 443, c.src_port(PORTS), c.seq.wrapping_add(1), PORTS));
    }

    #[test]
    fn test_check_rejects_forgeries() {
        let v = Validator::new([3u8; 16]);
        let t = Ipv4Addr::new(192, 0, 2, 10);
        let c = v.cookie(t, 443);
        let dport = c.src_port(PORTS);
        // Wrong ack.
        assert!(!v.check(t, 443, dport, c.seq, PORTS));
        assert!(!v.check(t, 443, dport, c.seq.wrapping_add(2), PORTS));
        // Right ack, wrong destination port.
        let wrong_port = if dport == PORTS.0 { PORTS.1 } else { PORTS.0 };
        assert!(!v.check(t, 443, wrong_port, c.seq.wrapping_add(1), PORTS));
        // Cookie replayed from a different source address.
        assert!(!v.check(Ipv4Addr::new(192, 0, 2, 11), 443, dport, c.seq.wrapping_add(1), PORTS));
    }

    #[test]
    fn test_random_cookies_rejected() {
        use rand::Rng;
        let v = Validator::new([9u8; 16]);
        let mut rng = rand::thread_rng();
        let t = Ipv4Addr::new(198, 51, 100, 1);
        let accepted = (0..10_000)
            .filter(|_| v.check(t, 80, rng.gen_range(PORTS.0..=PORTS.1), rng.gen(), PORTS))
            .count();
        assert_eq!(accepted, 0);
    }

    #[test]
    fn test_seq_wraps() {
        let v = Validator::new([0u8; 16]);
        let t = Ipv4Addr::new(203, 0, 113, 5);
        let c = v.cookie(t, 22);
        let ack = c.seq.wrapping_add(1);
        assert_eq!(ack.wrapping_sub(1), c.seq);
    }
}
