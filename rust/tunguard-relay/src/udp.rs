//! UDP relay
//!
//! Each flow gets its own connected socket. Datagrams from the app are sent
//! as-is; datagrams from the remote are wrapped back into IPv4/UDP packets
//! addressed to the app. Responses from port 53 pass through DNS inspection.

use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::time::{Duration, Instant};

use mio::net::UdpSocket;
use mio::{Interest, Token};
use tracing::{debug, trace, warn};

use crate::config::{DnsConfig, UdpConfig};
use crate::dns::{inspect_response, DnsVerdict};
use crate::engine::{Env, Verdict};
use crate::packet::{build_udp, Ipv4Header, UdpHeader};
use crate::protect::connect_udp;
use crate::session::FlowKey;

/// A relayed UDP flow.
pub struct UdpSession {
    pub key: FlowKey,
    pub uid: Option<u32>,
    pub created: Instant,
    pub last_activity: Instant,
    /// Pending teardown; removed at the next sweep.
    pub stop: bool,
    pub socket: UdpSocket,
    pub token: Token,
    pub interest: Option<Interest>,
    pub packets_sent: u64,
    pub packets_recv: u64,
}

impl UdpSession {
    pub fn new(key: FlowKey, uid: Option<u32>, socket: UdpSocket, now: Instant) -> Self {
        Self {
            key,
            uid,
            created: now,
            last_activity: now,
            stop: false,
            socket,
            token: Token(usize::MAX),
            interest: None,
            packets_sent: 0,
            packets_recv: 0,
        }
    }

    pub fn desired_interest(&self) -> Option<Interest> {
        if self.stop {
            None
        } else {
            Some(Interest::READABLE)
        }
    }

    /// DNS flows are short-lived; everything else idles longer.
    pub fn timeout(&self, config: &UdpConfig) -> Duration {
        if self.key.dest.port() == 53 {
            Duration::from_secs(config.dns_timeout)
        } else {
            Duration::from_secs(config.idle_timeout)
        }
    }

    pub fn is_expired(&self, now: Instant, config: &UdpConfig) -> bool {
        now.saturating_duration_since(self.last_activity) > self.timeout(config)
    }
}

/// Drives every UDP session.
pub struct UdpRelay {
    config: UdpConfig,
    dns: DnsConfig,
    buf: Vec<u8>,
}

impl UdpRelay {
    pub fn new(config: UdpConfig, dns: DnsConfig) -> Self {
        let buf = vec![0u8; config.max_datagram];
        Self { config, dns, buf }
    }

    pub fn config(&self) -> &UdpConfig {
        &self.config
    }

    /// Handle one datagram read from the tunnel.
    pub(crate) fn on_datagram(
        &mut self,
        env: &mut Env<'_>,
        ip: &Ipv4Header,
        udp: &UdpHeader,
        payload: &[u8],
        now: Instant,
    ) -> Verdict {
        let key = FlowKey::udp(
            SocketAddr::V4(SocketAddrV4::new(ip.src, udp.src_port)),
            SocketAddr::V4(SocketAddrV4::new(ip.dst, udp.dst_port)),
        );
        let stats = &*env.svc.stats;

        if !udp.checksum_ok {
            debug!("udp {}: bad checksum", key);
            stats.record_checksum_error();
            return Verdict::deny(None);
        }

        let uid = match env.table.find_udp(&key) {
            Some(s) if !s.stop => s.uid,
            Some(_) => return Verdict::deny(None),
            None => {
                let (uid, allowed) = env.svc.authorize(&key);
                if !allowed {
                    debug!("udp {} denied for uid {:?}", key, uid);
                    stats.record_denied();
                    return Verdict::deny(uid);
                }
                let socket = match connect_udp(key.dest, &*env.svc.protector) {
                    Ok(socket) => socket,
                    Err(e) => {
                        warn!("udp {}: socket failed: {}", key, e);
                        stats.record_socket_error();
                        return Verdict::allow(uid);
                    }
                };
                if let Err(e) = env.table.insert_udp(UdpSession::new(key, uid, socket, now)) {
                    warn!("udp {}: {}", key, e);
                    return Verdict::allow(uid);
                }
                stats.record_udp_session();
                uid
            }
        };

        if let Some(s) = env.table.find_udp_mut(&key) {
            match s.socket.send(payload) {
                Ok(n) => {
                    trace!("udp {}: {} bytes sent", key, n);
                    s.packets_sent += 1;
                    s.last_activity = now;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    stats.record_dropped();
                }
                Err(e) => {
                    warn!("udp {}: send failed: {}", key, e);
                    stats.record_socket_error();
                    s.stop = true;
                }
            }
        }
        Verdict::allow(uid)
    }

    /// Drain the session socket and relay every datagram to the tunnel.
    pub(crate) fn on_socket_ready(&mut self, env: &mut Env<'_>, key: &FlowKey, now: Instant) {
        let stats = &*env.svc.stats;
        let blocklist = &env.svc.blocklist;
        let Some(s) = env.table.find_udp_mut(key) else {
            return;
        };

        while !s.stop {
            let n = match s.socket.recv(&mut self.buf) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("udp {}: receive failed: {}", key, e);
                    stats.record_socket_error();
                    s.stop = true;
                    break;
                }
            };
            s.packets_recv += 1;
            s.last_activity = now;

            let data = &self.buf[..n];
            let rewritten;
            let reply = if key.is_dns() {
                stats.record_dns_inspected();
                match inspect_response(data, blocklist, &self.dns) {
                    DnsVerdict::Forward => data,
                    DnsVerdict::Rewrite(msg) => {
                        stats.record_dns_blocked();
                        rewritten = msg;
                        &rewritten[..]
                    }
                    DnsVerdict::Drop => {
                        stats.record_dns_blocked();
                        continue;
                    }
                }
            } else {
                data
            };

            match build_udp(key.reply_source(), key.reply_dest(), self.config.ttl, reply) {
                Ok(pkt) => env.out.push(pkt),
                Err(e) => warn!("udp {}: datagram not built: {}", key, e),
            }
        }
    }
}
