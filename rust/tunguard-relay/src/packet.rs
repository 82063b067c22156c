//! IPv4 / TCP / UDP packet parsing and building.
//!
//! All parsing works on explicit byte offsets in network byte order and
//! checks lengths before any field is trusted. Every checksum in the crate
//! (IP header, TCP, UDP, verification and synthesis) goes through
//! [`checksum`].
//!
//! IPv4 header layout used here:
//!
//! ```text
//!  0      version(4) | ihl(4)
//!  1      tos
//!  2..4   total length
//!  4..6   identification
//!  6..8   flags(3) | fragment offset(13)
//!  8      ttl
//!  9      protocol
//! 10..12  header checksum
//! 12..16  source address
//! 16..20  destination address
//! ```

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU16, Ordering};

use crate::error::{RelayError, Result};

pub const IPV4_HEADER_LEN: usize = 20;
pub const TCP_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;

pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

/// Don't-fragment bit in the flags/fragment-offset word.
const IP_DF: u16 = 0x4000;
const IP_MF: u16 = 0x2000;
const IP_FRAG_OFFSET: u16 = 0x1FFF;
const TCP_OPT_END: u8 = 0;
const TCP_OPT_NOP: u8 = 1;
const TCP_OPT_MSS: u8 = 2;

static IP_ID: AtomicU16 = AtomicU16::new(1);

/// Transport protocols the relay understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn number(self) -> u8 {
        match self {
            Protocol::Tcp => PROTO_TCP,
            Protocol::Udp => PROTO_UDP,
        }
    }

    pub fn from_number(n: u8) -> Option<Self> {
        match n {
            PROTO_TCP => Some(Protocol::Tcp),
            PROTO_UDP => Some(Protocol::Udp),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
}

impl TcpFlags {
    pub fn syn_ack() -> Self {
        Self {
            syn: true,
            ack: true,
            ..Default::default()
        }
    }
    pub fn ack_only() -> Self {
        Self {
            ack: true,
            ..Default::default()
        }
    }
    pub fn fin_ack() -> Self {
        Self {
            fin: true,
            ack: true,
            ..Default::default()
        }
    }
    pub fn rst_ack() -> Self {
        Self {
            rst: true,
            ack: true,
            ..Default::default()
        }
    }
    pub fn rst_only() -> Self {
        Self {
            rst: true,
            ..Default::default()
        }
    }
    pub fn psh_ack() -> Self {
        Self {
            psh: true,
            ack: true,
            ..Default::default()
        }
    }

    pub fn to_byte(&self) -> u8 {
        let mut flags = 0u8;
        if self.fin {
            flags |= 0x01;
        }
        if self.syn {
            flags |= 0x02;
        }
        if self.rst {
            flags |= 0x04;
        }
        if self.psh {
            flags |= 0x08;
        }
        if self.ack {
            flags |= 0x10;
        }
        flags
    }

    pub fn from_byte(b: u8) -> Self {
        Self {
            fin: b & 0x01 != 0,
            syn: b & 0x02 != 0,
            rst: b & 0x04 != 0,
            psh: b & 0x08 != 0,
            ack: b & 0x10 != 0,
        }
    }
}

impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let named = [
            (self.syn, 'S'),
            (self.ack, 'A'),
            (self.psh, 'P'),
            (self.fin, 'F'),
            (self.rst, 'R'),
        ];
        for (set, c) in named {
            if set {
                write!(f, "{}", c)?;
            }
        }
        Ok(())
    }
}

/// Validated IPv4 header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    pub header_len: usize,
    pub total_len: usize,
    pub id: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

impl Ipv4Header {
    /// Transport bytes of `buf`, bounded by the header's total length.
    pub fn payload<'a>(&self, buf: &'a [u8]) -> Result<&'a [u8]> {
        buf.get(self.header_len..self.total_len)
            .ok_or_else(|| RelayError::too_short(self.total_len, buf.len()))
    }

    /// Ones'-complement sum of the TCP/UDP pseudo-header.
    pub fn pseudo_header_sum(&self, transport_len: usize) -> u32 {
        pseudo_header_sum(self.src, self.dst, self.protocol, transport_len)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub header_len: usize,
    pub flags: TcpFlags,
    pub window: u16,
    pub mss: Option<u16>,
    /// Whether the transport checksum over the pseudo-header verified.
    pub checksum_ok: bool,
}

impl TcpHeader {
    /// Sequence space consumed by a segment with `payload_len` data bytes.
    pub fn seq_len(&self, payload_len: usize) -> u32 {
        payload_len as u32 + u32::from(self.flags.syn) + u32::from(self.flags.fin)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub length: usize,
    pub checksum_ok: bool,
}

/// A decoded tunnel packet.
#[derive(Debug, Clone, Copy)]
pub enum Packet<'a> {
    Tcp {
        ip: Ipv4Header,
        tcp: TcpHeader,
        payload: &'a [u8],
    },
    Udp {
        ip: Ipv4Header,
        udp: UdpHeader,
        payload: &'a [u8],
    },
    /// Any other transport; the relay does not forward these.
    Other { ip: Ipv4Header },
}

impl<'a> Packet<'a> {
    pub fn ip(&self) -> &Ipv4Header {
        match self {
            Packet::Tcp { ip, .. } | Packet::Udp { ip, .. } | Packet::Other { ip } => ip,
        }
    }
}

/// Parse a whole tunnel packet down to the transport payload.
pub fn parse(buf: &[u8]) -> Result<Packet<'_>> {
    let ip = parse_ip(buf)?;
    match ip.protocol {
        PROTO_TCP => {
            let (tcp, payload) = parse_tcp(&ip, buf)?;
            Ok(Packet::Tcp { ip, tcp, payload })
        }
        PROTO_UDP => {
            let (udp, payload) = parse_udp(&ip, buf)?;
            Ok(Packet::Udp { ip, udp, payload })
        }
        _ => Ok(Packet::Other { ip }),
    }
}

/// Parse and validate an IPv4 header.
pub fn parse_ip(buf: &[u8]) -> Result<Ipv4Header> {
    let first = *buf.first().ok_or_else(|| RelayError::too_short(1, 0))?;
    let version = first >> 4;
    if version != 4 {
        return Err(RelayError::UnsupportedVersion(version));
    }
    if buf.len() < IPV4_HEADER_LEN {
        return Err(RelayError::too_short(IPV4_HEADER_LEN, buf.len()));
    }

    let header_len = usize::from(first & 0x0F) * 4;
    if header_len < IPV4_HEADER_LEN {
        return Err(RelayError::invalid(format!("IPv4 header length {}", header_len)));
    }
    if buf.len() < header_len {
        return Err(RelayError::too_short(header_len, buf.len()));
    }

    let total_len = usize::from(u16::from_be_bytes([buf[2], buf[3]]));
    if total_len < header_len {
        return Err(RelayError::invalid(format!(
            "IPv4 total length {} below header length {}",
            total_len, header_len
        )));
    }
    if total_len > buf.len() {
        return Err(RelayError::too_short(total_len, buf.len()));
    }

    if checksum(0, &buf[..header_len]) != 0 {
        return Err(RelayError::ChecksumMismatch("IPv4"));
    }

    // fragments are not reassembled; only whole datagrams carry a transport header
    let frag = u16::from_be_bytes([buf[6], buf[7]]);
    if frag & IP_MF != 0 || frag & IP_FRAG_OFFSET != 0 {
        return Err(RelayError::invalid(format!(
            "IPv4 fragment (more: {}, offset: {})",
            frag & IP_MF != 0,
            (frag & IP_FRAG_OFFSET) * 8
        )));
    }

    Ok(Ipv4Header {
        header_len,
        total_len,
        id: u16::from_be_bytes([buf[4], buf[5]]),
        ttl: buf[8],
        protocol: buf[9],
        src: Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15]),
        dst: Ipv4Addr::new(buf[16], buf[17], buf[18], buf[19]),
    })
}

/// Parse the TCP header following `ip` in `buf` and return it with its payload.
pub fn parse_tcp<'a>(ip: &Ipv4Header, buf: &'a [u8]) -> Result<(TcpHeader, &'a [u8])> {
    let seg = ip.payload(buf)?;
    if seg.len() < TCP_HEADER_LEN {
        return Err(RelayError::too_short(TCP_HEADER_LEN, seg.len()));
    }

    let header_len = usize::from(seg[12] >> 4) * 4;
    if header_len < TCP_HEADER_LEN {
        return Err(RelayError::invalid(format!("TCP data offset {}", header_len)));
    }
    if header_len > seg.len() {
        return Err(RelayError::too_short(header_len, seg.len()));
    }

    let checksum_ok = checksum(ip.pseudo_header_sum(seg.len()), seg) == 0;
    let header = TcpHeader {
        src_port: u16::from_be_bytes([seg[0], seg[1]]),
        dst_port: u16::from_be_bytes([seg[2], seg[3]]),
        seq: u32::from_be_bytes([seg[4], seg[5], seg[6], seg[7]]),
        ack: u32::from_be_bytes([seg[8], seg[9], seg[10], seg[11]]),
        header_len,
        flags: TcpFlags::from_byte(seg[13]),
        window: u16::from_be_bytes([seg[14], seg[15]]),
        mss: parse_mss(&seg[TCP_HEADER_LEN..header_len]),
        checksum_ok,
    };
    Ok((header, &seg[header_len..]))
}

fn parse_mss(opts: &[u8]) -> Option<u16> {
    let mut i = 0;
    while i < opts.len() {
        match opts[i] {
            TCP_OPT_END => break,
            TCP_OPT_NOP => i += 1,
            kind => {
                let len = usize::from(*opts.get(i + 1)?);
                if len < 2 || i + len > opts.len() {
                    return None;
                }
                if kind == TCP_OPT_MSS && len == 4 {
                    return Some(u16::from_be_bytes([opts[i + 2], opts[i + 3]]));
                }
                i += len;
            }
        }
    }
    None
}

/// Parse the UDP header following `ip` in `buf` and return it with its payload.
pub fn parse_udp<'a>(ip: &Ipv4Header, buf: &'a [u8]) -> Result<(UdpHeader, &'a [u8])> {
    let dgram = ip.payload(buf)?;
    if dgram.len() < UDP_HEADER_LEN {
        return Err(RelayError::too_short(UDP_HEADER_LEN, dgram.len()));
    }

    let length = usize::from(u16::from_be_bytes([dgram[4], dgram[5]]));
    if length < UDP_HEADER_LEN || length > dgram.len() {
        return Err(RelayError::invalid(format!(
            "UDP length {} inconsistent with IP payload {}",
            length,
            dgram.len()
        )));
    }
    let dgram = &dgram[..length];

    // zero means the sender did not compute one
    let wire_checksum = u16::from_be_bytes([dgram[6], dgram[7]]);
    let checksum_ok = wire_checksum == 0 || checksum(ip.pseudo_header_sum(length), dgram) == 0;

    let header = UdpHeader {
        src_port: u16::from_be_bytes([dgram[0], dgram[1]]),
        dst_port: u16::from_be_bytes([dgram[2], dgram[3]]),
        length,
        checksum_ok,
    };
    Ok((header, &dgram[UDP_HEADER_LEN..]))
}

/// Internet checksum (RFC 1071) over `data`, starting from the partial sum `seed`.
///
/// Returns the folded, complemented 16-bit result. Computing over data that
/// already contains a correct checksum yields zero.
pub fn checksum(seed: u32, data: &[u8]) -> u16 {
    let mut sum = u64::from(seed);
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum += u64::from(u16::from_be_bytes([word[0], word[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u64::from(*last) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Unfolded sum of the IPv4 pseudo-header, used as the [`checksum`] seed.
pub fn pseudo_header_sum(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, len: usize) -> u32 {
    let s = src.octets();
    let d = dst.octets();
    u32::from(u16::from_be_bytes([s[0], s[1]]))
        + u32::from(u16::from_be_bytes([s[2], s[3]]))
        + u32::from(u16::from_be_bytes([d[0], d[1]]))
        + u32::from(u16::from_be_bytes([d[2], d[3]]))
        + u32::from(protocol)
        + len as u32
}

/// Fields of a TCP segment to synthesize towards the tunnel.
#[derive(Debug, Clone, Copy)]
pub struct TcpSegment<'a> {
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub mss: Option<u16>,
    pub ttl: u8,
    pub payload: &'a [u8],
}

fn v4(addr: SocketAddr) -> Result<SocketAddrV4> {
    match addr {
        SocketAddr::V4(a) => Ok(a),
        SocketAddr::V6(_) => Err(RelayError::UnsupportedVersion(6)),
    }
}

fn write_ipv4_header(
    pkt: &mut [u8],
    total_len: usize,
    ttl: u8,
    protocol: u8,
    src: Ipv4Addr,
    dst: Ipv4Addr,
) {
    pkt[0] = 0x45;
    pkt[1] = 0x00;
    pkt[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    let ip_id = IP_ID.fetch_add(1, Ordering::Relaxed);
    pkt[4..6].copy_from_slice(&ip_id.to_be_bytes());
    pkt[6..8].copy_from_slice(&IP_DF.to_be_bytes());
    pkt[8] = ttl;
    pkt[9] = protocol;
    pkt[10..12].copy_from_slice(&[0, 0]);
    pkt[12..16].copy_from_slice(&src.octets());
    pkt[16..20].copy_from_slice(&dst.octets());

    let ip_cksum = checksum(0, &pkt[..IPV4_HEADER_LEN]);
    pkt[10..12].copy_from_slice(&ip_cksum.to_be_bytes());
}

/// Build a complete IPv4 TCP packet.
pub fn build_tcp(seg: &TcpSegment<'_>) -> Result<Vec<u8>> {
    let src = v4(seg.src)?;
    let dst = v4(seg.dst)?;

    let opts_len = if seg.flags.syn && seg.mss.is_some() {
        4
    } else {
        0
    };
    let tcp_hdr_len = TCP_HEADER_LEN + opts_len;
    let total_len = IPV4_HEADER_LEN + tcp_hdr_len + seg.payload.len();
    if total_len > usize::from(u16::MAX) {
        return Err(RelayError::invalid(format!("TCP segment of {} bytes", total_len)));
    }

    let mut pkt = vec![0u8; total_len];
    write_ipv4_header(&mut pkt, total_len, seg.ttl, PROTO_TCP, *src.ip(), *dst.ip());

    let t = IPV4_HEADER_LEN;
    pkt[t..t + 2].copy_from_slice(&src.port().to_be_bytes());
    pkt[t + 2..t + 4].copy_from_slice(&dst.port().to_be_bytes());
    pkt[t + 4..t + 8].copy_from_slice(&seg.seq.to_be_bytes());
    pkt[t + 8..t + 12].copy_from_slice(&seg.ack.to_be_bytes());
    pkt[t + 12] = ((tcp_hdr_len / 4) as u8) << 4;
    pkt[t + 13] = seg.flags.to_byte();
    pkt[t + 14..t + 16].copy_from_slice(&seg.window.to_be_bytes());

    if let (true, Some(mss)) = (seg.flags.syn, seg.mss) {
        pkt[t + 20] = TCP_OPT_MSS;
        pkt[t + 21] = 4;
        pkt[t + 22..t + 24].copy_from_slice(&mss.to_be_bytes());
    }

    pkt[t + tcp_hdr_len..].copy_from_slice(seg.payload);

    let seed = pseudo_header_sum(*src.ip(), *dst.ip(), PROTO_TCP, total_len - t);
    let tcp_cksum = checksum(seed, &pkt[t..]);
    pkt[t + 16..t + 18].copy_from_slice(&tcp_cksum.to_be_bytes());

    Ok(pkt)
}

/// Build a complete IPv4 UDP packet.
pub fn build_udp(src: SocketAddr, dst: SocketAddr, ttl: u8, payload: &[u8]) -> Result<Vec<u8>> {
    let src = v4(src)?;
    let dst = v4(dst)?;

    let udp_len = UDP_HEADER_LEN + payload.len();
    let total_len = IPV4_HEADER_LEN + udp_len;
    if total_len > usize::from(u16::MAX) {
        return Err(RelayError::invalid(format!("UDP datagram of {} bytes", total_len)));
    }

    let mut pkt = vec![0u8; total_len];
    write_ipv4_header(&mut pkt, total_len, ttl, PROTO_UDP, *src.ip(), *dst.ip());

    let u = IPV4_HEADER_LEN;
    pkt[u..u + 2].copy_from_slice(&src.port().to_be_bytes());
    pkt[u + 2..u + 4].copy_from_slice(&dst.port().to_be_bytes());
    pkt[u + 4..u + 6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    pkt[u + UDP_HEADER_LEN..].copy_from_slice(payload);

    let seed = pseudo_header_sum(*src.ip(), *dst.ip(), PROTO_UDP, udp_len);
    let mut udp_cksum = checksum(seed, &pkt[u..]);
    if udp_cksum == 0 {
        udp_cksum = 0xFFFF;
    }
    pkt[u + 6..u + 8].copy_from_slice(&udp_cksum.to_be_bytes());

    Ok(pkt)
}

/// Build the reset answering a segment that matches no connection (RFC 793).
///
/// Returns `None` for segments that are themselves resets.
pub fn build_rst_for(
    ip: &Ipv4Header,
    tcp: &TcpHeader,
    payload_len: usize,
    ttl: u8,
) -> Result<Option<Vec<u8>>> {
    if tcp.flags.rst {
        return Ok(None);
    }
    let (seq, ack, flags) = if tcp.flags.ack {
        (tcp.ack, 0, TcpFlags::rst_only())
    } else {
        (0, tcp.seq.wrapping_add(tcp.seq_len(payload_len)), TcpFlags::rst_ack())
    };
    let seg = TcpSegment {
        src: SocketAddr::V4(SocketAddrV4::new(ip.dst, tcp.dst_port)),
        dst: SocketAddr::V4(SocketAddrV4::new(ip.src, tcp.src_port)),
        seq,
        ack,
        flags,
        window: 0,
        mss: None,
        ttl,
        payload: &[],
    };
    build_tcp(&seg).map(Some)
}
