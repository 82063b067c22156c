//! Flow identity and the session table.
//!
//! The table is owned by the event loop and is the only place sessions are
//! created or destroyed. Dropping a session drops its socket, which closes it.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

use mio::{Interest, Registry, Token};
use tracing::{debug, warn};

use crate::config::{TcpConfig, UdpConfig};
use crate::engine::Outbox;
use crate::error::{RelayError, Result};
use crate::packet::Protocol;
use crate::tcp::{TcpSession, TcpState};
use crate::udp::UdpSession;

/// Reactor token of the tunnel device.
pub const TUN_TOKEN: Token = Token(0);
/// Reactor token of the control waker.
pub const WAKER_TOKEN: Token = Token(1);
const FIRST_SESSION_TOKEN: usize = 2;

/// Identity of a relayed flow, as seen from the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub protocol: Protocol,
    pub source: SocketAddr,
    pub dest: SocketAddr,
}

impl FlowKey {
    pub fn new(protocol: Protocol, source: SocketAddr, dest: SocketAddr) -> Self {
        Self {
            protocol,
            source,
            dest,
        }
    }

    pub fn tcp(source: SocketAddr, dest: SocketAddr) -> Self {
        Self::new(Protocol::Tcp, source, dest)
    }

    pub fn udp(source: SocketAddr, dest: SocketAddr) -> Self {
        Self::new(Protocol::Udp, source, dest)
    }

    /// IP version derived from the address family.
    pub fn version(&self) -> u8 {
        match self.source {
            SocketAddr::V4(_) => 4,
            SocketAddr::V6(_) => 6,
        }
    }

    /// Source address of packets sent back to the app.
    pub fn reply_source(&self) -> SocketAddr {
        self.dest
    }

    pub fn reply_dest(&self) -> SocketAddr {
        self.source
    }

    pub fn is_dns(&self) -> bool {
        self.protocol == Protocol::Udp && self.dest.port() == 53
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.protocol, self.source, self.dest)
    }
}

/// Owner of every live TCP and UDP session.
pub struct SessionTable {
    tcp: HashMap<FlowKey, TcpSession>,
    udp: HashMap<FlowKey, UdpSession>,
    tokens: HashMap<Token, FlowKey>,
    next_token: usize,
}

impl SessionTable {
    pub fn new() -> Self {
        Self {
            tcp: HashMap::new(),
            udp: HashMap::new(),
            tokens: HashMap::new(),
            next_token: FIRST_SESSION_TOKEN,
        }
    }

    fn alloc_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    pub fn find_tcp(&self, key: &FlowKey) -> Option<&TcpSession> {
        self.tcp.get(key)
    }

    pub fn find_tcp_mut(&mut self, key: &FlowKey) -> Option<&mut TcpSession> {
        self.tcp.get_mut(key)
    }

    pub fn find_udp(&self, key: &FlowKey) -> Option<&UdpSession> {
        self.udp.get(key)
    }

    pub fn find_udp_mut(&mut self, key: &FlowKey) -> Option<&mut UdpSession> {
        self.udp.get_mut(key)
    }

    /// Flow bound to a reactor token.
    pub fn flow_for(&self, token: Token) -> Option<FlowKey> {
        self.tokens.get(&token).copied()
    }

    pub fn insert_tcp(&mut self, mut session: TcpSession) -> Result<Token> {
        let key = session.key;
        if self.tcp.contains_key(&key) {
            return Err(RelayError::DuplicateFlow(key));
        }
        let token = self.alloc_token();
        session.token = token;
        self.tokens.insert(token, key);
        self.tcp.insert(key, session);
        debug!("tcp session created: {} ({:?})", key, token);
        Ok(token)
    }

    pub fn insert_udp(&mut self, mut session: UdpSession) -> Result<Token> {
        let key = session.key;
        if self.udp.contains_key(&key) {
            return Err(RelayError::DuplicateFlow(key));
        }
        let token = self.alloc_token();
        session.token = token;
        self.tokens.insert(token, key);
        self.udp.insert(key, session);
        debug!("udp session created: {} ({:?})", key, token);
        Ok(token)
    }

    /// Remove a session, deregistering and closing its socket.
    pub fn remove(&mut self, key: &FlowKey, registry: &Registry) -> bool {
        match key.protocol {
            Protocol::Tcp => match self.tcp.remove(key) {
                Some(mut s) => {
                    if s.interest.take().is_some() {
                        let _ = registry.deregister(&mut s.socket);
                    }
                    self.tokens.remove(&s.token);
                    debug!("tcp session removed: {} in {}", key, s.state);
                    true
                }
                None => false,
            },
            Protocol::Udp => match self.udp.remove(key) {
                Some(mut s) => {
                    if s.interest.take().is_some() {
                        let _ = registry.deregister(&mut s.socket);
                    }
                    self.tokens.remove(&s.token);
                    debug!("udp session removed: {}", key);
                    true
                }
                None => false,
            },
        }
    }

    /// Bring every socket's registration in line with what its session wants.
    ///
    /// A session whose registration fails is marked for removal; a TCP session
    /// also gets a reset queued towards the tunnel. Returns the resets queued.
    pub fn sync_interest(&mut self, registry: &Registry, ttl: u8, out: &mut Outbox) -> usize {
        let mut resets = 0;
        for s in self.tcp.values_mut() {
            if s.state == TcpState::Closed {
                continue;
            }
            let desired = s.desired_interest();
            let applied =
                apply_interest(registry, &mut s.socket, s.token, &mut s.interest, desired);
            if let Err(e) = applied {
                warn!("tcp {}: register failed: {}", s.key, e);
                match s.rst_packet(ttl) {
                    Ok(pkt) => {
                        out.push(pkt);
                        resets += 1;
                    }
                    Err(e) => warn!("tcp {}: reset not built: {}", s.key, e),
                }
                s.state = TcpState::Closed;
            }
        }
        for s in self.udp.values_mut() {
            let desired = s.desired_interest();
            let applied =
                apply_interest(registry, &mut s.socket, s.token, &mut s.interest, desired);
            if let Err(e) = applied {
                warn!("udp {}: register failed: {}", s.key, e);
                s.stop = true;
            }
        }
        resets
    }

    /// Remove every session whose idle time exceeds its state's timeout.
    ///
    /// Each TCP session removed here that is not already closed gets exactly
    /// one reset queued towards the tunnel. Returns the number removed.
    pub fn sweep(
        &mut self,
        now: Instant,
        tcp_cfg: &TcpConfig,
        udp_cfg: &UdpConfig,
        registry: &Registry,
        out: &mut Outbox,
    ) -> usize {
        let tcp_expired: Vec<FlowKey> = self
            .tcp
            .values()
            .filter(|s| s.state == TcpState::Closed || s.is_expired(now, tcp_cfg))
            .map(|s| s.key)
            .collect();
        let udp_expired: Vec<FlowKey> = self
            .udp
            .values()
            .filter(|s| s.stop || s.is_expired(now, udp_cfg))
            .map(|s| s.key)
            .collect();

        for key in &tcp_expired {
            if let Some(s) = self.tcp.get(key) {
                if s.state != TcpState::Closed {
                    debug!("tcp {} timed out in {}", key, s.state);
                    match s.rst_packet(tcp_cfg.ttl) {
                        Ok(pkt) => out.push(pkt),
                        Err(e) => warn!("tcp {}: reset not built: {}", key, e),
                    }
                }
            }
            self.remove(key, registry);
        }
        for key in &udp_expired {
            self.remove(key, registry);
        }
        tcp_expired.len() + udp_expired.len()
    }

    /// Tear down every session. Safe to call more than once.
    pub fn clear(&mut self, registry: &Registry) {
        let keys: Vec<FlowKey> = self.tcp.keys().chain(self.udp.keys()).copied().collect();
        for key in &keys {
            self.remove(key, registry);
        }
        self.tokens.clear();
    }

    pub fn tcp_count(&self) -> usize {
        self.tcp.len()
    }

    pub fn udp_count(&self) -> usize {
        self.udp.len()
    }

    pub fn total_count(&self) -> usize {
        self.tcp_count() + self.udp_count()
    }

    pub fn tcp_sessions(&self) -> impl Iterator<Item = &TcpSession> {
        self.tcp.values()
    }

    pub fn udp_sessions(&self) -> impl Iterator<Item = &UdpSession> {
        self.udp.values()
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_interest<S: mio::event::Source>(
    registry: &Registry,
    socket: &mut S,
    token: Token,
    current: &mut Option<Interest>,
    desired: Option<Interest>,
) -> std::io::Result<()> {
    if *current == desired {
        return Ok(());
    }
    match (*current, desired) {
        (None, Some(i)) => registry.register(socket, token, i)?,
        (Some(_), Some(i)) => registry.reregister(socket, token, i)?,
        (Some(_), None) => registry.deregister(socket)?,
        (None, None) => {}
    }
    *current = desired;
    Ok(())
}
