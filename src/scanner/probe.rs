//! SYN probe construction.
//!
//! Probes are complete IPv4 + TCP SYN packets (no Ethernet header) with
//! options laid out like a Linux stack: MSS, SACK-permitted, timestamps,
//! NOP, window scale. The cookie rides in the sequence number and the
//! source port; nothing about the probe is remembered after it is sent.

use std::net::Ipv4Addr;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::cookie::Cookie;

/// Size of every probe: 20-byte IPv4 header + 40-byte TCP header with options.
pub const PROBE_LEN: usize = 60;

/// Ethernet header (14) + FCS (4) + preamble (8) + inter-frame gap (12).
pub const ETHERNET_OVERHEAD: usize = 38;

/// Bytes a probe occupies on the wire, used to convert bandwidth to a rate.
pub const PROBE_WIRE_LEN: usize = PROBE_LEN + ETHERNET_OVERHEAD;

const TCP_OPTIONS_LEN: usize = 20;

/// Observable IP/TCP header fields of outgoing probes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeProfile {
    /// IP TTL.
    pub ttl: u8,
    /// TCP window advertised in the SYN.
    pub window: u16,
    /// TCP MSS option value.
    pub mss: u16,
    /// TCP window scale shift.
    pub window_scale: u8,
    /// Base TSval for the timestamps option.
    pub tsval_base: u32,
    /// Set the IP Don't Fragment flag.
    pub ip_df: bool,
}

impl Default for ProbeProfile {
    fn default() -> Self {
        Self {
            ttl: 64,
            window: 64240,
            mss: 1460,
            window_scale: 7,
            tsval_base: 0x0010_0000,
            ip_df: true,
        }
    }
}

/// Builds probes from a fixed source address and profile.
#[derive(Debug, Clone)]
pub struct ProbeBuilder {
    profile: ProbeProfile,
    src_ip: Ipv4Addr,
    src_ports: (u16, u16),
    built: u32,
}

impl ProbeBuilder {
    pub fn new(profile: ProbeProfile, src_ip: Ipv4Addr, src_ports: (u16, u16)) -> Self {
        Self {
            profile,
            src_ip,
            src_ports,
            built: 0,
        }
    }

    pub fn src_ip(&self) -> Ipv4Addr {
        self.src_ip
    }

    /// Number of probes built so far.
    pub fn built(&self) -> u32 {
        self.built
    }

    /// Build the SYN probe for `target:dst_port` carrying `cookie`.
    pub fn build(&mut self, target: Ipv4Addr, dst_port: u16, cookie: &Cookie) -> [u8; PROBE_LEN] {
        let src_port = cookie.src_port(self.src_ports);
        let mut packet = [0u8; PROBE_LEN];

        // IPv4 header
        packet[0] = 0x45;
        packet[2..4].copy_from_slice(&(PROBE_LEN as u16).to_be_bytes());
        let ip_id: u16 = rand::thread_rng().gen();
        packet[4..6].copy_from_slice(&ip_id.to_be_bytes());
        if self.profile.ip_df {
            packet[6] = 0x40;
        }
        packet[8] = self.profile.ttl;
        packet[9] = 0x06;
        packet[12..16].copy_from_slice(&self.src_ip.octets());
        packet[16..20].copy_from_slice(&target.octets());

        // TCP header
        packet[20..22].copy_from_slice(&src_port.to_be_bytes());
        packet[22..24].copy_from_slice(&dst_port.to_be_bytes());
        packet[24..28].copy_from_slice(&cookie.seq.to_be_bytes());
        // ack = 0
        packet[32] = (((20 + TCP_OPTIONS_LEN) / 4) as u8) << 4;
        packet[33] = 0x02; // SYN
        packet[34..36].copy_from_slice(&self.profile.window.to_be_bytes());
        packet[40..60].copy_from_slice(&self.tcp_options());

        let tcp_checksum = compute_tcp_checksum(&packet[20..], &self.src_ip, &target);
        packet[36..38].copy_from_slice(&tcp_checksum.to_be_bytes());
        let ip_checksum = compute_ip_checksum(&packet[0..20]);
        packet[10..12].copy_from_slice(&ip_checksum.to_be_bytes());

        self.built = self.built.wrapping_add(1);
        packet
    }

    /// MSS(4) + SACK_PERM(2) + Timestamps(10) + NOP(1) + Window Scale(3).
    fn tcp_options(&self) -> [u8; TCP_OPTIONS_LEN] {
        let mut opts = [0u8; TCP_OPTIONS_LEN];
        opts[0] = 2;
        opts[1] = 4;
        opts[2..4].copy_from_slice(&self.profile.mss.to_be_bytes());
        opts[4] = 4;
        opts[5] = 2;
        opts[6] = 8;
        opts[7] = 10;
        let tsval = self.profile.tsval_base.wrapping_add(self.built / 10);
        opts[8..12].copy_from_slice(&tsval.to_be_bytes());
        // TSecr stays zero on a SYN.
        opts[16] = 1;
        opts[17] = 3;
        opts[18] = 3;
        opts[19] = self.profile.window_scale;
        opts
    }
}

// =============================================================================
// Checksum utilities
// =============================================================================

/// Accumulate big-endian 16-bit words. An odd trailing byte is zero-padded,
/// so only the last slice fed into one checksum may have odd length.
fn add_words(mut sum: u64, data: &[u8]) -> u64 {
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u64::from(u16::from_be_bytes([pair[0], pair[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u64::from(*last) << 8;
    }
    sum
}

/// Sum `data` as if the 16-bit field at even offset `field` were zero.
fn add_words_skipping(sum: u64, data: &[u8], field: usize) -> u64 {
    if data.len() < field + 2 {
        return add_words(sum, data);
    }
    add_words(add_words(sum, &data[..field]), &data[field + 2..])
}

/// Fold carries and invert.
fn finish(mut sum: u64) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// IPv4 header checksum. The checksum field is treated as zero.
pub fn compute_ip_checksum(header: &[u8]) -> u16 {
    finish(add_words_skipping(0, header, 10))
}

/// TCP checksum over the IPv4 pseudo-header. The checksum field is treated as zero.
pub fn compute_tcp_checksum(tcp_segment: &[u8], src_ip: &Ipv4Addr, dst_ip: &Ipv4Addr) -> u16 {
    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(&src_ip.octets());
    pseudo[4..8].copy_from_slice(&dst_ip.octets());
    pseudo[9] = 0x06;
    pseudo[10..12].copy_from_slice(&(tcp_segment.len() as u16).to_be_bytes());
    finish(add_words_skipping(add_words(0, &pseudo), tcp_segment, 16))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRC: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 100);
    const DST: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const PORTS: (u16, u16) = (32768, 61000);

    fn cookie() -> Cookie {
        Cookie {
            seq: 0xDEAD_BEEF,
            port_selector: 1000,
        }
    }

    fn build() -> [u8; PROBE_LEN] {
        ProbeBuilder::new(ProbeProfile::default(), SRC, PORTS).build(DST, 80, &cookie())
    }

    #[test]
    fn test_probe_ip_header() {
        let p = build();
        assert_eq!(p[0], 0x45);
        assert_eq!(u16::from_be_bytes([p[2], p[3]]) as usize, PROBE_LEN);
        assert_eq!(p[6], 0x40, "DF set");
        assert_eq!(p[8], 64);
        assert_eq!(p[9], 6);
        assert_eq!(&p[12..16], &SRC.octets());
        assert_eq!(&p[16..20], &DST.octets());
    }

    #[test]
    fn test_probe_carries_cookie() {
        let p = build();
        let c = cookie();
        assert_eq!(u16::from_be_bytes([p[20], p[21]]), c.src_port(PORTS));
        assert_eq!(u16::from_be_bytes([p[22], p[23]]), 80);
        assert_eq!(u32::from_be_bytes([p[24], p[25], p[26], p[27]]), 0xDEAD_BEEF);
        assert_eq!(u32::from_be_bytes([p[28], p[29], p[30], p[31]]), 0);
    }

    #[test]
    fn test_probe_syn_only() {
        let p = build();
        assert_eq!(p[33], 0x02);
        assert_eq!(p[32] >> 4, 10, "data offset = 40 bytes");
    }

    #[test]
    fn test_probe_options_linux_order() {
        let p = build();
        let opts = &p[40..60];
        assert_eq!(opts[0], 2); // MSS
        assert_eq!(u16::from_be_bytes([opts[2], opts[3]]), 1460);
        assert_eq!(opts[4], 4); // SACK permitted
        assert_eq!(opts[6], 8); // timestamps
        assert_eq!(&opts[12..16], &[0, 0, 0, 0], "TSecr zero");
        assert_eq!(opts[16], 1); // NOP
        assert_eq!(opts[17], 3); // window scale
        assert_eq!(opts[19], 7);
    }

    #[test]
    fn test_probe_checksums_verify() {
        let p = build();
        // Re-summing a header that includes its checksum yields zero.
        assert_eq!(finish(add_words(0, &p[0..20])), 0);
        let stored = u16::from_be_bytes([p[36], p[37]]);
        assert_eq!(compute_tcp_checksum(&p[20..], &SRC, &DST), stored);
    }

    #[test]
    fn test_builder_counts() {
        let mut b = ProbeBuilder::new(ProbeProfile::default(), SRC, PORTS);
        for _ in 0..3 {
            b.build(DST, 443, &cookie());
        }
        assert_eq!(b.built(), 3);
    }

    #[test]
    fn test_ones_complement_odd_length() {
        // 0x0102 + 0x0300 = 0x0402 -> !0x0402
        assert_eq!(finish(add_words(0, &[1, 2, 3])), !0x0402);
    }

    #[test]
    fn test_tcp_checksum_covers_long_segments() {
        // Longer than any probe: a 200-byte segment with a payload.
        let mut seg: Vec<u8> = (0..200u8).collect();
        let sum = compute_tcp_checksum(&seg, &SRC, &DST);
        seg[16..18].copy_from_slice(&sum.to_be_bytes());
        let mut pseudo = [0u8; 12];
        pseudo[0..4].copy_from_slice(&SRC.octets());
        pseudo[4..8].copy_from_slice(&DST.octets());
        pseudo[9] = 0x06;
        pseudo[10..12].copy_from_slice(&200u16.to_be_bytes());
        assert_eq!(finish(add_words(add_words(0, &pseudo), &seg)), 0);
    }

    #[test]
    fn test_ip_checksum_ignores_stored_field() {
        let mut p = build();
        let expected = compute_ip_checksum(&p[0..20]);
        p[10] = 0xAB;
        p[11] = 0xCD;
        assert_eq!(compute_ip_checksum(&p[0..20]), expected);
    }

    #[test]
    fn test_wire_len() {
        assert_eq!(PROBE_WIRE_LEN, 98);
    }
}
