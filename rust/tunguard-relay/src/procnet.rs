//! Uid lookup through the Linux `/proc/net` socket tables.

use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;

use crate::packet::Protocol;
use crate::policy::UidResolver;
use crate::session::FlowKey;

/// One row of `/proc/net/{tcp,udp}[6]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketEntry {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub uid: u32,
}

/// Resolves the owning uid of a flow from the kernel's socket tables.
#[derive(Debug, Clone)]
pub struct ProcNetResolver {
    root: PathBuf,
}

impl Default for ProcNetResolver {
    fn default() -> Self {
        Self { root: PathBuf::from("/proc/net") }
    }
}

impl ProcNetResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read tables from another directory, such as a test fixture.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn tables(protocol: Protocol) -> [(&'static str, bool); 2] {
        match protocol {
            Protocol::Tcp => [("tcp", false), ("tcp6", true)],
            Protocol::Udp => [("udp", false), ("udp6", true)],
        }
    }
}

impl UidResolver for ProcNetResolver {
    fn resolve(&self, flow: &FlowKey) -> Option<u32> {
        for (name, is_ipv6) in Self::tables(flow.protocol) {
            let Ok(content) = fs::read_to_string(self.root.join(name)) else {
                continue;
            };
            if let Some(uid) = find_uid(&content, is_ipv6, flow) {
                return Some(uid);
            }
        }
        None
    }
}

/// Uid of the row owning `flow`'s source address.
///
/// An exact local address match wins. For UDP a socket bound to the
/// wildcard address on the source port is accepted as a fallback.
pub fn find_uid(content: &str, is_ipv6: bool, flow: &FlowKey) -> Option<u32> {
    let mut wildcard = None;
    for entry in content.lines().skip(1).filter_map(|l| parse_line(l, is_ipv6)) {
        if entry.local.port() != flow.source.port() {
            continue;
        }
        let local_ip = unmap(entry.local.ip());
        if local_ip == flow.source.ip() {
            let remote_ip = unmap(entry.remote.ip());
            if flow.protocol == Protocol::Udp
                || (remote_ip == flow.dest.ip() && entry.remote.port() == flow.dest.port())
            {
                return Some(entry.uid);
            }
        } else if flow.protocol == Protocol::Udp && local_ip.is_unspecified() {
            wildcard.get_or_insert(entry.uid);
        }
    }
    wildcard
}

fn unmap(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None if v6.is_unspecified() => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

/// Parse `sl local_address rem_address st tx:rx tr:when retrnsmt uid ...`.
pub fn parse_line(line: &str, is_ipv6: bool) -> Option<SocketEntry> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 8 {
        return None;
    }
    Some(SocketEntry {
        local: parse_addr(parts[1], is_ipv6)?,
        remote: parse_addr(parts[2], is_ipv6)?,
        uid: parts[7].parse().ok()?,
    })
}

fn parse_addr(field: &str, is_ipv6: bool) -> Option<SocketAddr> {
    let (addr, port) = field.split_once(':')?;
    let port = u16::from_str_radix(port, 16).ok()?;
    let ip = if is_ipv6 {
        IpAddr::V6(hex_to_ipv6(addr)?)
    } else {
        IpAddr::V4(hex_to_ipv4(addr)?)
    };
    Some(SocketAddr::new(ip, port))
}

/// The kernel prints each 32-bit word in host (little-endian) order.
fn hex_word(hex: &str) -> Option<[u8; 4]> {
    let word = u32::from_str_radix(hex, 16).ok()?;
    Some(word.swap_bytes().to_be_bytes())
}

fn hex_to_ipv4(hex: &str) -> Option<Ipv4Addr> {
    if hex.len() != 8 {
        return None;
    }
    hex_word(hex).map(Ipv4Addr::from)
}

fn hex_to_ipv6(hex: &str) -> Option<Ipv6Addr> {
    if hex.len() != 32 || !hex.is_ascii() {
        return None;
    }
    let mut bytes = [0u8; 16];
    for i in 0..4 {
        bytes[i * 4..i * 4 + 4].copy_from_slice(&hex_word(&hex[i * 8..i * 8 + 8])?);
    }
    Some(Ipv6Addr::from(bytes))
}
