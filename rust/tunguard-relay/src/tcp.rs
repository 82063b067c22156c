//! TCP relay: a reduced state machine that keeps the app's TCP stack and
//! the kernel's real connection in step.
//!
//! ```text
//!   SYN from app ──> SynReceived ──(connect done, SYN+ACK sent, app ACK)──> Established
//!
//!   Established ──(app FIN)──> CloseWait ──(socket EOF, FIN sent)──> LastAck ──(app ACK)──> TimeWait
//!   Established ──(socket EOF, FIN sent)──> FinWait ──(app FIN)──> TimeWait
//!
//!   any state ──(RST, violation, socket error)──> removed
//! ```
//!
//! Nothing sent towards the tunnel is ever retransmitted; the app's stack
//! retransmits its own segments and the relay re-acknowledges them.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, SocketAddrV4};
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use mio::{Interest, Token};
use tracing::{debug, trace, warn};

use crate::config::TcpConfig;
use crate::engine::{Env, Outbox, Verdict};
use crate::error::Result;
use crate::packet::{build_rst_for, build_tcp, Ipv4Header, TcpFlags, TcpHeader, TcpSegment};
use crate::protect::connect_tcp;
use crate::session::FlowKey;
use crate::stats::StackStats;

/// MSS assumed when the app's SYN carries no option (RFC 879).
const DEFAULT_PEER_MSS: u16 = 536;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TcpState {
    /// SYN seen; connecting, or SYN+ACK sent and awaiting the app's ACK.
    SynReceived,
    Established,
    /// Remote closed first; our FIN was sent to the app.
    FinWait,
    /// App closed first; the remote may still send.
    CloseWait,
    /// Both sides closed; waiting for the app to ACK our FIN.
    LastAck,
    TimeWait,
    Closed,
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

pub(crate) fn seq_before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

pub(crate) fn seq_before_or_eq(a: u32, b: u32) -> bool {
    a == b || seq_before(a, b)
}

pub(crate) fn seq_after(a: u32, b: u32) -> bool {
    seq_before(b, a)
}

/// Where an incoming data segment falls relative to what was received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentClass {
    /// Starts at or before the next expected byte; `skip` bytes are old.
    InOrder { skip: u32 },
    /// Entirely received before.
    Duplicate,
    /// Starts past the next expected byte but inside the window.
    Gap,
    OutOfWindow,
}

/// Sequence bookkeeping of one relayed connection.
///
/// `local_*` numbers the bytes the relay sends to the app, `remote_*` the
/// bytes the app sends to the relay. Both `*_seq` only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqSpace {
    pub local_start: u32,
    /// Next sequence number to send.
    pub local_seq: u32,
    /// Highest cumulative ACK received from the app.
    pub local_acked: u32,
    pub remote_start: u32,
    /// Next sequence number expected from the app.
    pub remote_seq: u32,
    pub send_window: u32,
    pub recv_window: u32,
}

impl SeqSpace {
    /// Start tracking after the app's SYN carrying `syn_seq`.
    pub fn new(syn_seq: u32, send_window: u32, recv_window: u32) -> Self {
        Self {
            local_start: 0,
            local_seq: 0,
            local_acked: 0,
            remote_start: syn_seq,
            remote_seq: syn_seq.wrapping_add(1),
            send_window,
            recv_window,
        }
    }

    /// Pick the relay's initial sequence number; the SYN+ACK consumes one.
    pub fn start_local(&mut self, iss: u32) {
        self.local_start = iss;
        self.local_acked = iss;
        self.local_seq = iss.wrapping_add(1);
    }

    pub fn in_flight(&self) -> u32 {
        self.local_seq.wrapping_sub(self.local_acked)
    }

    /// Bytes that may still be sent before the window is full.
    pub fn send_room(&self) -> u32 {
        self.send_window.saturating_sub(self.in_flight())
    }

    /// Apply an acknowledgment. Returns false when it covers bytes never sent.
    pub fn on_ack(&mut self, ack: u32) -> bool {
        if seq_after(ack, self.local_seq) {
            return false;
        }
        if seq_after(ack, self.local_acked) {
            self.local_acked = ack;
        }
        true
    }

    pub fn classify(&self, seq: u32, len: u32) -> SegmentClass {
        let window_end = self.remote_seq.wrapping_add(self.recv_window);
        if seq_after(seq, window_end) || (len > 0 && seq == window_end) {
            return SegmentClass::OutOfWindow;
        }
        if seq_before(seq, self.remote_seq) {
            let end = seq.wrapping_add(len);
            if seq_before_or_eq(end, self.remote_seq) {
                return SegmentClass::Duplicate;
            }
            return SegmentClass::InOrder { skip: self.remote_seq.wrapping_sub(seq) };
        }
        if seq == self.remote_seq {
            return SegmentClass::InOrder { skip: 0 };
        }
        SegmentClass::Gap
    }

    pub fn advance_remote(&mut self, n: u32) {
        self.remote_seq = self.remote_seq.wrapping_add(n);
    }

    pub fn advance_local(&mut self, n: u32) {
        self.local_seq = self.local_seq.wrapping_add(n);
    }
}

/// A relayed TCP connection.
pub struct TcpSession {
    pub key: FlowKey,
    pub uid: Option<u32>,
    pub created: Instant,
    pub last_activity: Instant,
    pub state: TcpState,
    pub seq: SeqSpace,
    /// Largest data segment sent to the app.
    pub mss: u16,
    /// Non-blocking connect still in progress.
    pub connect_pending: bool,
    /// The real socket returned end-of-stream.
    pub socket_eof: bool,
    pub socket: TcpStream,
    pub token: Token,
    pub interest: Option<Interest>,
}

impl TcpSession {
    pub fn new(
        key: FlowKey,
        uid: Option<u32>,
        syn_seq: u32,
        mss: u16,
        config: &TcpConfig,
        socket: TcpStream,
        now: Instant,
    ) -> Self {
        Self {
            key,
            uid,
            created: now,
            last_activity: now,
            state: TcpState::SynReceived,
            seq: SeqSpace::new(
                syn_seq,
                u32::from(config.send_window),
                u32::from(config.recv_window),
            ),
            mss,
            connect_pending: true,
            socket_eof: false,
            socket,
            token: Token(usize::MAX),
            interest: None,
        }
    }

    /// Readiness this session currently needs from the reactor.
    pub fn desired_interest(&self) -> Option<Interest> {
        if self.connect_pending {
            return Some(Interest::WRITABLE);
        }
        let reading = matches!(self.state, TcpState::Established | TcpState::CloseWait);
        if reading && !self.socket_eof && self.seq.send_room() > 0 {
            Some(Interest::READABLE)
        } else {
            None
        }
    }

    pub fn timeout(&self, config: &TcpConfig) -> Duration {
        let secs = match self.state {
            TcpState::SynReceived => config.init_timeout,
            TcpState::Established => config.idle_timeout,
            TcpState::FinWait | TcpState::LastAck | TcpState::TimeWait => config.close_timeout,
            TcpState::CloseWait => config.keep_timeout,
            TcpState::Closed => 0,
        };
        Duration::from_secs(secs)
    }

    pub fn is_expired(&self, now: Instant, config: &TcpConfig) -> bool {
        now.saturating_duration_since(self.last_activity) > self.timeout(config)
    }

    fn segment<'a>(&self, flags: TcpFlags, payload: &'a [u8], ttl: u8) -> TcpSegment<'a> {
        TcpSegment {
            src: self.key.reply_source(),
            dst: self.key.reply_dest(),
            seq: self.seq.local_seq,
            ack: self.seq.remote_seq,
            flags,
            window: self.seq.recv_window.min(u32::from(u16::MAX)) as u16,
            mss: None,
            ttl,
            payload,
        }
    }

    /// Reset towards the app for this connection.
    pub fn rst_packet(&self, ttl: u8) -> Result<Vec<u8>> {
        build_tcp(&self.segment(TcpFlags::rst_ack(), &[], ttl))
    }
}

/// What the caller must do with a session after handling an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Next {
    Keep,
    Remove,
}

/// Drives every TCP session.
pub struct TcpEngine {
    config: TcpConfig,
    buf: Vec<u8>,
}

impl TcpEngine {
    pub fn new(config: TcpConfig) -> Self {
        let buf = vec![0u8; usize::from(config.effective_mss())];
        Self { config, buf }
    }

    pub fn config(&self) -> &TcpConfig {
        &self.config
    }

    /// Handle one segment read from the tunnel.
    pub(crate) fn on_segment(
        &mut self,
        env: &mut Env<'_>,
        ip: &Ipv4Header,
        tcp: &TcpHeader,
        payload: &[u8],
        now: Instant,
    ) -> Verdict {
        let key = FlowKey::tcp(
            SocketAddr::V4(SocketAddrV4::new(ip.src, tcp.src_port)),
            SocketAddr::V4(SocketAddrV4::new(ip.dst, tcp.dst_port)),
        );

        let fresh_syn = tcp.flags.syn && !tcp.flags.ack;
        let stale = env
            .table
            .find_tcp(&key)
            .is_some_and(|s| matches!(s.state, TcpState::TimeWait | TcpState::Closed));
        if stale && fresh_syn {
            debug!("tcp {} reopened", key);
            env.table.remove(&key, env.registry);
        }

        let ttl = self.config.ttl;
        let stats = &*env.svc.stats;
        let Some(s) = env.table.find_tcp_mut(&key) else {
            return self.on_new_flow(env, key, ip, tcp, payload, now);
        };
        let uid = s.uid;
        if process(s, tcp, payload, now, ttl, env.out, stats) == Next::Remove {
            env.table.remove(&key, env.registry);
        }
        Verdict::allow(uid)
    }

    fn on_new_flow(
        &mut self,
        env: &mut Env<'_>,
        key: FlowKey,
        ip: &Ipv4Header,
        tcp: &TcpHeader,
        payload: &[u8],
        now: Instant,
    ) -> Verdict {
        let stats = &*env.svc.stats;
        let f = tcp.flags;
        if !f.syn || f.ack || f.rst || f.fin {
            // Not an opening segment; tell the app there is no such connection.
            match build_rst_for(ip, tcp, payload.len(), self.config.ttl) {
                Ok(Some(pkt)) => {
                    trace!("tcp {} unknown flow [{}], reset", key, f);
                    env.out.push(pkt);
                    stats.record_reset();
                }
                Ok(None) => {}
                Err(e) => warn!("tcp {}: reset not built: {}", key, e),
            }
            return Verdict::deny(None);
        }
        if !tcp.checksum_ok {
            stats.record_checksum_error();
            return Verdict::deny(None);
        }

        let (uid, allowed) = env.svc.authorize(&key);
        if !allowed {
            debug!("tcp {} denied for uid {:?}", key, uid);
            stats.record_denied();
            return Verdict::deny(uid);
        }

        let socket = match connect_tcp(key.dest, &*env.svc.protector) {
            Ok(socket) => socket,
            Err(e) => {
                warn!("tcp {}: connect failed: {}", key, e);
                stats.record_socket_error();
                if let Ok(Some(pkt)) = build_rst_for(ip, tcp, payload.len(), self.config.ttl) {
                    env.out.push(pkt);
                    stats.record_reset();
                }
                return Verdict::allow(uid);
            }
        };

        let mss = self
            .config
            .effective_mss()
            .min(tcp.mss.unwrap_or(DEFAULT_PEER_MSS));
        let session = TcpSession::new(key, uid, tcp.seq, mss, &self.config, socket, now);
        match env.table.insert_tcp(session) {
            Ok(_) => stats.record_tcp_session(),
            Err(e) => warn!("tcp {}: {}", key, e),
        }
        Verdict::allow(uid)
    }

    /// Handle readiness of a session's real socket.
    pub(crate) fn on_socket_ready(
        &mut self,
        env: &mut Env<'_>,
        key: &FlowKey,
        readable: bool,
        writable: bool,
        now: Instant,
    ) {
        let ttl = self.config.ttl;
        let stats = &*env.svc.stats;
        let Some(s) = env.table.find_tcp_mut(key) else {
            return;
        };

        let next = if s.connect_pending {
            if writable || readable {
                finish_connect(s, now, ttl, env.out, stats)
            } else {
                Next::Keep
            }
        } else if readable && matches!(s.state, TcpState::Established | TcpState::CloseWait) {
            relay_from_socket(s, &mut self.buf, now, ttl, env.out, stats)
        } else {
            Next::Keep
        };

        if next == Next::Remove {
            env.table.remove(key, env.registry);
        }
    }
}

fn send(s: &TcpSession, flags: TcpFlags, payload: &[u8], ttl: u8, out: &mut Outbox) {
    match build_tcp(&s.segment(flags, payload, ttl)) {
        Ok(pkt) => out.push(pkt),
        Err(e) => warn!("tcp {}: segment not built: {}", s.key, e),
    }
}

/// Reset the app's side and mark the session for removal.
fn abort(s: &mut TcpSession, ttl: u8, out: &mut Outbox, stats: &StackStats) -> Next {
    match s.rst_packet(ttl) {
        Ok(pkt) => {
            out.push(pkt);
            stats.record_reset();
        }
        Err(e) => warn!("tcp {}: reset not built: {}", s.key, e),
    }
    s.state = TcpState::Closed;
    Next::Remove
}

fn process(
    s: &mut TcpSession,
    tcp: &TcpHeader,
    payload: &[u8],
    now: Instant,
    ttl: u8,
    out: &mut Outbox,
    stats: &StackStats,
) -> Next {
    if !tcp.checksum_ok {
        warn!("tcp {}: bad checksum", s.key);
        stats.record_checksum_error();
        return abort(s, ttl, out, stats);
    }
    if tcp.flags.rst {
        debug!("tcp {} reset by app in {}", s.key, s.state);
        s.state = TcpState::Closed;
        return Next::Remove;
    }
    s.last_activity = now;

    if tcp.flags.syn {
        let same_syn = !tcp.flags.ack && !tcp.flags.fin && tcp.seq == s.seq.remote_start;
        if same_syn && s.state == TcpState::SynReceived {
            if !s.connect_pending {
                send_syn_ack(s, ttl, out);
            }
            return Next::Keep;
        }
        debug!("tcp {}: unexpected SYN in {}", s.key, s.state);
        return abort(s, ttl, out, stats);
    }

    if s.state == TcpState::SynReceived {
        if s.connect_pending || !tcp.flags.ack {
            trace!("tcp {}: segment before handshake ignored", s.key);
            return Next::Keep;
        }
        if tcp.ack != s.seq.local_seq {
            debug!("tcp {}: bad handshake ack {} (want {})", s.key, tcp.ack, s.seq.local_seq);
            return abort(s, ttl, out, stats);
        }
        s.state = TcpState::Established;
        debug!("tcp {} established", s.key);
    }

    if tcp.flags.ack && !s.seq.on_ack(tcp.ack) {
        debug!("tcp {}: ack {} beyond sent {}", s.key, tcp.ack, s.seq.local_seq);
        return abort(s, ttl, out, stats);
    }
    if s.state == TcpState::LastAck && s.seq.local_acked == s.seq.local_seq {
        s.state = TcpState::TimeWait;
        debug!("tcp {} closed, lingering", s.key);
    }

    let receiving = matches!(s.state, TcpState::Established | TcpState::FinWait);
    if !payload.is_empty() {
        match s.seq.classify(tcp.seq, payload.len() as u32) {
            SegmentClass::OutOfWindow => {
                debug!("tcp {}: seq {} outside window at {}", s.key, tcp.seq, s.seq.remote_seq);
                return abort(s, ttl, out, stats);
            }
            SegmentClass::Duplicate => {
                trace!("tcp {}: duplicate seq {}", s.key, tcp.seq);
                send(s, TcpFlags::ack_only(), &[], ttl, out);
                return Next::Keep;
            }
            SegmentClass::Gap => {
                trace!("tcp {}: gap at seq {}, expected {}", s.key, tcp.seq, s.seq.remote_seq);
                send(s, TcpFlags::ack_only(), &[], ttl, out);
                return Next::Keep;
            }
            SegmentClass::InOrder { skip } => {
                if !receiving {
                    debug!("tcp {}: data after FIN in {}", s.key, s.state);
                    return abort(s, ttl, out, stats);
                }
                let data = &payload[skip as usize..];
                match write_socket(&mut s.socket, data) {
                    Ok(n) => {
                        s.seq.advance_remote(n as u32);
                        trace!("tcp {}: {} of {} bytes to socket", s.key, n, data.len());
                        if n < data.len() {
                            send(s, TcpFlags::ack_only(), &[], ttl, out);
                            return Next::Keep;
                        }
                    }
                    Err(e) => {
                        warn!("tcp {}: socket write failed: {}", s.key, e);
                        stats.record_socket_error();
                        return abort(s, ttl, out, stats);
                    }
                }
            }
        }
    }

    if tcp.flags.fin {
        let fin_seq = tcp.seq.wrapping_add(payload.len() as u32);
        if receiving && fin_seq == s.seq.remote_seq {
            s.seq.advance_remote(1);
            if let Err(e) = s.socket.shutdown(Shutdown::Write) {
                trace!("tcp {}: shutdown: {}", s.key, e);
            }
            s.state = match s.state {
                TcpState::Established => TcpState::CloseWait,
                _ => TcpState::TimeWait,
            };
            debug!("tcp {}: app FIN, now {}", s.key, s.state);
        }
        send(s, TcpFlags::ack_only(), &[], ttl, out);
        return Next::Keep;
    }

    if !payload.is_empty() {
        send(s, TcpFlags::ack_only(), &[], ttl, out);
    }
    Next::Keep
}

fn send_syn_ack(s: &TcpSession, ttl: u8, out: &mut Outbox) {
    let mut seg = s.segment(TcpFlags::syn_ack(), &[], ttl);
    seg.seq = s.seq.local_start;
    seg.mss = Some(s.mss);
    match build_tcp(&seg) {
        Ok(pkt) => out.push(pkt),
        Err(e) => warn!("tcp {}: SYN+ACK not built: {}", s.key, e),
    }
}

fn finish_connect(
    s: &mut TcpSession,
    now: Instant,
    ttl: u8,
    out: &mut Outbox,
    stats: &StackStats,
) -> Next {
    let failure = match s.socket.take_error() {
        Ok(Some(e)) | Err(e) => Some(e),
        Ok(None) => None,
    };
    if let Some(e) = failure {
        warn!("tcp {}: connect failed: {}", s.key, e);
        stats.record_socket_error();
        return abort(s, ttl, out, stats);
    }
    match s.socket.peer_addr() {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotConnected => return Next::Keep,
        Err(e) => {
            warn!("tcp {}: connect failed: {}", s.key, e);
            stats.record_socket_error();
            return abort(s, ttl, out, stats);
        }
    }

    s.connect_pending = false;
    s.last_activity = now;
    s.seq.start_local(rand::random());
    send_syn_ack(s, ttl, out);
    debug!("tcp {} connected, SYN+ACK sent", s.key);
    Next::Keep
}

fn relay_from_socket(
    s: &mut TcpSession,
    buf: &mut [u8],
    now: Instant,
    ttl: u8,
    out: &mut Outbox,
    stats: &StackStats,
) -> Next {
    while !s.socket_eof {
        let room = s.seq.send_room() as usize;
        if room == 0 {
            trace!("tcp {}: send window full", s.key);
            break;
        }
        let want = room.min(usize::from(s.mss)).min(buf.len());
        match s.socket.read(&mut buf[..want]) {
            Ok(0) => {
                s.socket_eof = true;
                send(s, TcpFlags::fin_ack(), &[], ttl, out);
                s.seq.advance_local(1);
                s.state = match s.state {
                    TcpState::CloseWait => TcpState::LastAck,
                    _ => TcpState::FinWait,
                };
                s.last_activity = now;
                debug!("tcp {}: socket EOF, now {}", s.key, s.state);
            }
            Ok(n) => {
                send(s, TcpFlags::psh_ack(), &buf[..n], ttl, out);
                s.seq.advance_local(n as u32);
                s.last_activity = now;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("tcp {}: socket read failed: {}", s.key, e);
                stats.record_socket_error();
                return abort(s, ttl, out, stats);
            }
        }
    }
    Next::Keep
}

/// Write as much of `data` as the socket accepts without blocking.
fn write_socket(socket: &mut TcpStream, data: &[u8]) -> io::Result<usize> {
    let mut written = 0;
    while written < data.len() {
        match socket.write(&data[written..]) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(written)
}
