//! The relay event loop.
//!
//! One thread owns the [`Engine`]: it polls the tunnel, the control waker and
//! every session socket, dispatches packets and readiness to the TCP and UDP
//! relays, writes synthesized packets back to the tunnel and sweeps idle
//! sessions. Other threads talk to it only through an [`EngineHandle`].

use std::io;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use mio::{Events, Interest, Poll, Registry, Token, Waker};
use tracing::{debug, error, info, trace, warn};

use crate::capture::{CaptureSink, PcapFile};
use crate::config::EngineConfig;
use crate::device::Tunnel;
use crate::error::{RelayError, Result};
use crate::flowlog::{PacketLog, PacketLogger, TracingPacketLogger};
use crate::hosts::Blocklist;
use crate::packet::{self, Packet};
use crate::policy::{AllowList, PolicyGate, UidLookup, UidResolver};
use crate::protect::{NoopProtector, SocketProtector};
use crate::session::{FlowKey, SessionTable, TUN_TOKEN, WAKER_TOKEN};
use crate::stats::{StackStats, StatsSnapshot};
use crate::tcp::TcpEngine;
use crate::udp::UdpRelay;

const EVENTS_CAPACITY: usize = 1024;

/// Packets queued for the tunnel during one loop iteration.
#[derive(Debug, Default)]
pub struct Outbox {
    packets: Vec<Vec<u8>>,
}

impl Outbox {
    pub fn push(&mut self, packet: Vec<u8>) {
        self.packets.push(packet);
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn drain(&mut self) -> std::vec::Drain<'_, Vec<u8>> {
        self.packets.drain(..)
    }

    pub fn clear(&mut self) {
        self.packets.clear();
    }
}

/// Admission outcome of a tunnel packet, reported to the packet log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub uid: Option<u32>,
    pub allowed: bool,
}

impl Verdict {
    pub fn allow(uid: Option<u32>) -> Self {
        Self { uid, allowed: true }
    }

    pub fn deny(uid: Option<u32>) -> Self {
        Self {
            uid,
            allowed: false,
        }
    }
}

/// Collaborators shared by the relays for the lifetime of the engine.
pub(crate) struct Services {
    pub config: EngineConfig,
    pub policy: Box<dyn PolicyGate>,
    pub uids: UidLookup,
    pub protector: Arc<dyn SocketProtector>,
    pub blocklist: Blocklist,
    pub stats: Arc<StackStats>,
}

impl Services {
    /// Resolve the owner of a new flow and ask the policy about it.
    pub fn authorize(&self, key: &FlowKey) -> (Option<u32>, bool) {
        let uid = self.uids.resolve(key);
        (uid, self.policy.is_allowed(uid, key))
    }
}

/// Mutable loop state lent to a relay while it handles one event.
pub(crate) struct Env<'a> {
    pub table: &'a mut SessionTable,
    pub registry: &'a Registry,
    pub out: &'a mut Outbox,
    pub svc: &'a Services,
}

/// Requests applied by the loop thread between iterations.
pub enum Control {
    Shutdown,
    SetPolicy(Box<dyn PolicyGate>),
    SetBlocklist(Blocklist),
}

/// Cloneable, thread-safe handle to a running [`Engine`].
#[derive(Clone)]
pub struct EngineHandle {
    tx: Sender<Control>,
    waker: Arc<Waker>,
    stats: Arc<StackStats>,
}

impl EngineHandle {
    fn send(&self, control: Control) -> Result<()> {
        self.tx.send(control).map_err(|_| RelayError::EngineStopped)?;
        self.waker.wake()?;
        Ok(())
    }

    /// Stop the loop; every session is torn down and the tunnel closed.
    pub fn shutdown(&self) -> Result<()> {
        self.send(Control::Shutdown)
    }

    /// Replace the policy consulted for new flows. Live sessions are kept.
    pub fn set_policy<P: PolicyGate + 'static>(&self, policy: P) -> Result<()> {
        self.send(Control::SetPolicy(Box::new(policy)))
    }

    pub fn set_blocklist(&self, blocklist: Blocklist) -> Result<()> {
        self.send(Control::SetBlocklist(blocklist))
    }

    /// Interrupt a blocking wait without any request.
    pub fn wake(&self) -> Result<()> {
        self.waker.wake()?;
        Ok(())
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

/// Builder for [`Engine`]
pub struct EngineBuilder {
    config: EngineConfig,
    policy: Option<Box<dyn PolicyGate>>,
    resolver: Option<Box<dyn UidResolver>>,
    protector: Option<Arc<dyn SocketProtector>>,
    blocklist: Blocklist,
    capture: Option<Box<dyn CaptureSink>>,
    logger: Option<Box<dyn PacketLogger>>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            policy: None,
            resolver: None,
            protector: None,
            blocklist: Blocklist::new(),
            capture: None,
            logger: None,
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Policy for new flows. Defaults to an [`AllowList`] built from the config.
    pub fn policy<P: PolicyGate + 'static>(mut self, policy: P) -> Self {
        self.policy = Some(Box::new(policy));
        self
    }

    pub fn uid_resolver<R: UidResolver + 'static>(mut self, resolver: R) -> Self {
        self.resolver = Some(Box::new(resolver));
        self
    }

    pub fn protector<P: SocketProtector + 'static>(mut self, protector: P) -> Self {
        self.protector = Some(Arc::new(protector));
        self
    }

    pub fn blocklist(mut self, blocklist: Blocklist) -> Self {
        self.blocklist = blocklist;
        self
    }

    /// Capture sink. Defaults to a pcap file when the config names one.
    pub fn capture<C: CaptureSink + 'static>(mut self, capture: C) -> Self {
        self.capture = Some(Box::new(capture));
        self
    }

    /// Packet logger. Defaults to tracing output when `log_packets` is set.
    pub fn packet_logger<L: PacketLogger + 'static>(mut self, logger: L) -> Self {
        self.logger = Some(Box::new(logger));
        self
    }

    pub fn build<T: Tunnel + 'static>(self, mut tunnel: T) -> Result<Engine> {
        let config = self.config;
        config.validate()?;

        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        poll.registry()
            .register(&mut tunnel, TUN_TOKEN, Interest::READABLE)?;

        let capture = match (self.capture, &config.capture.path) {
            (Some(c), _) => Some(c),
            (None, Some(path)) => Some(Box::new(PcapFile::create(
                path,
                config.capture.snaplen,
                config.capture.max_file_size,
            )?) as Box<dyn CaptureSink>),
            (None, None) => None,
        };
        let logger = match self.logger {
            Some(l) => Some(l),
            None if config.log_packets => {
                Some(Box::new(TracingPacketLogger) as Box<dyn PacketLogger>)
            }
            None => None,
        };

        let stats = Arc::new(StackStats::new());
        let (tx, controls) = mpsc::channel();
        let handle = EngineHandle {
            tx,
            waker,
            stats: stats.clone(),
        };

        let svc = Services {
            policy: self.policy.unwrap_or_else(|| {
                Box::new(AllowList::new(
                    config.filter,
                    config.allowed_uids.iter().copied(),
                ))
            }),
            uids: match self.resolver {
                Some(resolver) => UidLookup::new(resolver, &config.uid),
                None => UidLookup::none(),
            },
            protector: self.protector.unwrap_or_else(|| Arc::new(NoopProtector)),
            blocklist: self.blocklist,
            stats,
            config,
        };

        info!(
            "Relay engine ready (filter: {}, blocked names: {}, capture: {})",
            svc.config.filter,
            svc.blocklist.len(),
            capture.is_some()
        );

        Ok(Engine {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            tunnel: Some(Box::new(tunnel)),
            table: SessionTable::new(),
            tcp: TcpEngine::new(svc.config.tcp.clone()),
            udp: UdpRelay::new(svc.config.udp.clone(), svc.config.dns.clone()),
            buf: vec![0u8; svc.config.tun_max_packet],
            svc,
            outbox: Outbox::default(),
            capture,
            logger,
            controls,
            handle,
            stopped: false,
        })
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Single-threaded relay engine.
pub struct Engine {
    poll: Poll,
    events: Events,
    tunnel: Option<Box<dyn Tunnel>>,
    table: SessionTable,
    svc: Services,
    tcp: TcpEngine,
    udp: UdpRelay,
    outbox: Outbox,
    capture: Option<Box<dyn CaptureSink>>,
    logger: Option<Box<dyn PacketLogger>>,
    controls: Receiver<Control>,
    handle: EngineHandle,
    buf: Vec<u8>,
    stopped: bool,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    pub fn stats(&self) -> Arc<StackStats> {
        self.svc.stats.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.svc.config
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.table
    }

    pub fn is_running(&self) -> bool {
        !self.stopped
    }

    /// Run until shutdown is requested (`Ok`) or the tunnel fails (`Err`).
    pub fn run(&mut self) -> Result<()> {
        info!("Relay engine running");
        let timeout = self.svc.config.poll_timeout();
        loop {
            match self.turn(Some(timeout)) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    error!("Relay engine stopped: {}", e);
                    return Err(e);
                }
            }
        }
        info!("Relay engine stopped");
        Ok(())
    }

    /// One loop iteration, waiting at most `timeout` for readiness.
    ///
    /// Returns whether the engine is still running. A fatal error tears the
    /// engine down before it is returned.
    pub fn turn(&mut self, timeout: Option<Duration>) -> Result<bool> {
        if self.stopped {
            return Ok(false);
        }
        match self.turn_inner(timeout) {
            Ok(()) => {
                if self.stopped {
                    self.teardown();
                }
                Ok(!self.stopped)
            }
            Err(e) => {
                self.teardown();
                Err(e)
            }
        }
    }

    fn turn_inner(&mut self, timeout: Option<Duration>) -> Result<()> {
        let resets = self
            .table
            .sync_interest(self.poll.registry(), self.tcp.config().ttl, &mut self.outbox);
        for _ in 0..resets {
            self.svc.stats.record_reset();
        }

        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(e.into());
        }

        let now = Instant::now();
        let mut tunnel_ready = false;
        let mut ready: Vec<(Token, bool, bool)> = Vec::new();
        for event in self.events.iter() {
            match event.token() {
                TUN_TOKEN => tunnel_ready = true,
                WAKER_TOKEN => {}
                token => ready.push((
                    token,
                    event.is_readable() || event.is_read_closed() || event.is_error(),
                    event.is_writable() || event.is_error(),
                )),
            }
        }

        if tunnel_ready {
            self.drain_tunnel(now)?;
        }
        for (token, readable, writable) in ready {
            self.dispatch_socket(token, readable, writable, now);
        }
        self.flush()?;

        self.apply_controls();
        if !self.stopped {
            self.sweep(Instant::now())?;
        }
        Ok(())
    }

    fn drain_tunnel(&mut self, now: Instant) -> Result<()> {
        loop {
            let tunnel = self.tunnel.as_mut().ok_or(RelayError::TunnelClosed)?;
            let n = match tunnel.read_packet(&mut self.buf) {
                Ok(0) => {
                    trace!("Dropped empty tunnel packet");
                    self.svc.stats.record_invalid();
                    continue;
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Err(RelayError::TunnelClosed)
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            self.handle_packet(n, now);
        }
    }

    fn handle_packet(&mut self, len: usize, now: Instant) {
        let packet = &self.buf[..len];
        let stats = &*self.svc.stats;
        stats.record_received(len);

        if let Some(capture) = self.capture.as_mut() {
            if let Err(e) = capture.capture(packet, SystemTime::now()) {
                warn!("Packet capture failed: {}", e);
            }
        }

        let parsed = match packet::parse(packet) {
            Ok(p) => p,
            Err(e) => {
                trace!("Dropped tunnel packet: {}", e);
                stats.record_invalid();
                return;
            }
        };

        let mut env = Env {
            table: &mut self.table,
            registry: self.poll.registry(),
            out: &mut self.outbox,
            svc: &self.svc,
        };
        let (verdict, flags, sport, dport) = match parsed {
            Packet::Tcp { ip, tcp, payload } => {
                stats.record_tcp();
                let v = self.tcp.on_segment(&mut env, &ip, &tcp, payload, now);
                (v, Some(tcp.flags), tcp.src_port, tcp.dst_port)
            }
            Packet::Udp { ip, udp, payload } => {
                stats.record_udp();
                let v = self.udp.on_datagram(&mut env, &ip, &udp, payload, now);
                (v, None, udp.src_port, udp.dst_port)
            }
            Packet::Other { ip } => {
                stats.record_other();
                trace!("Ignored protocol {} from {}", ip.protocol, ip.src);
                (Verdict::deny(None), None, 0, 0)
            }
        };

        if let Some(logger) = self.logger.as_ref() {
            let ip = parsed.ip();
            logger.log(&PacketLog {
                time: SystemTime::now(),
                version: 4,
                protocol: ip.protocol,
                flags: PacketLog::flags_from(flags.as_ref()),
                source: ip.src.into(),
                sport,
                dest: ip.dst.into(),
                dport,
                uid: verdict.uid,
                allowed: verdict.allowed,
            });
        }
    }

    fn dispatch_socket(&mut self, token: Token, readable: bool, writable: bool, now: Instant) {
        let Some(key) = self.table.flow_for(token) else {
            return;
        };
        let mut env = Env {
            table: &mut self.table,
            registry: self.poll.registry(),
            out: &mut self.outbox,
            svc: &self.svc,
        };
        match key.protocol {
            packet::Protocol::Tcp => {
                self.tcp.on_socket_ready(&mut env, &key, readable, writable, now)
            }
            packet::Protocol::Udp => {
                if readable {
                    self.udp.on_socket_ready(&mut env, &key, now);
                }
            }
        }
    }

    /// Write every queued packet to the tunnel.
    fn flush(&mut self) -> Result<()> {
        let stats = &*self.svc.stats;
        for pkt in self.outbox.drain() {
            if let Some(capture) = self.capture.as_mut() {
                if let Err(e) = capture.capture(&pkt, SystemTime::now()) {
                    warn!("Packet capture failed: {}", e);
                }
            }
            let tunnel = self.tunnel.as_mut().ok_or(RelayError::TunnelClosed)?;
            match tunnel.write_packet(&pkt) {
                Ok(_) => stats.record_sent(pkt.len()),
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.raw_os_error() == Some(libc::ENOBUFS) =>
                {
                    trace!("Tunnel full, dropped {} bytes", pkt.len());
                    stats.record_dropped();
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn apply_controls(&mut self) {
        loop {
            match self.controls.try_recv() {
                Ok(Control::Shutdown) => {
                    info!("Shutdown requested");
                    self.stopped = true;
                }
                Ok(Control::SetPolicy(policy)) => {
                    debug!("Policy replaced");
                    self.svc.policy = policy;
                }
                Ok(Control::SetBlocklist(blocklist)) => {
                    debug!("Blocklist replaced ({} names)", blocklist.len());
                    self.svc.blocklist = blocklist;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    /// Remove idle sessions as of `now` and send the resulting resets.
    pub fn sweep(&mut self, now: Instant) -> Result<usize> {
        let before = self.outbox.len();
        let removed = self.table.sweep(
            now,
            self.tcp.config(),
            self.udp.config(),
            self.poll.registry(),
            &mut self.outbox,
        );
        let stats = &*self.svc.stats;
        for _ in before..self.outbox.len() {
            stats.record_reset();
        }
        if removed > 0 {
            debug!("Swept {} idle sessions", removed);
            stats.record_expired(removed);
        }
        stats.set_active(self.table.tcp_count(), self.table.udp_count());
        self.flush()?;
        Ok(removed)
    }

    /// Tear down every session and close the tunnel. Idempotent.
    pub fn shutdown(&mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        self.stopped = true;
        let Some(mut tunnel) = self.tunnel.take() else {
            return;
        };
        self.table.clear(self.poll.registry());
        self.outbox.clear();
        let _ = self.poll.registry().deregister(&mut *tunnel);
        self.svc.stats.set_active(0, 0);
        info!("Relay engine torn down");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.teardown();
    }
}
