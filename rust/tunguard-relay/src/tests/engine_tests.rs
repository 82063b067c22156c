//! End-to-end tests of the event loop over a socket-pair tunnel and real
//! loopback peers.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::os::unix::net::UnixDatagram as StdUnixDatagram;
use std::time::{Duration, Instant};

use mio::event::Source;
use mio::net::UnixDatagram;
use mio::{Interest, Registry, Token};

use crate::config::{BlockAction, DnsConfig, EngineConfig, UidConfig};
use crate::device::Tunnel;
use crate::dns::tests::response;
use crate::dns::{inspect_response, DnsVerdict, QTYPE_A, QTYPE_AAAA};
use crate::engine::Engine;
use crate::hosts::Blocklist;
use crate::packet::{self, build_tcp, build_udp, Packet, TcpFlags, TcpHeader, TcpSegment};
use crate::policy::AllowList;
use crate::session::FlowKey;
use crate::tcp::TcpState;
use crate::RelayError;

const TURN: Duration = Duration::from_millis(50);
const APP: &str = "10.1.10.1:40000";

fn config() -> EngineConfig {
    EngineConfig {
        uid: UidConfig {
            first_delay_ms: 0,
            retry_delay_ms: 0,
            max_tries: 1,
        },
        ..Default::default()
    }
}

/// Engine wired to one end of a datagram pair; the test plays the app on the other.
fn engine_with(config: EngineConfig, policy: AllowList) -> (Engine, StdUnixDatagram) {
    let (engine_side, app_side) = StdUnixDatagram::pair().unwrap();
    engine_side.set_nonblocking(true).unwrap();
    app_side.set_nonblocking(true).unwrap();
    let engine = Engine::builder()
        .config(config)
        .policy(policy)
        .build(UnixDatagram::from_std(engine_side))
        .unwrap();
    (engine, app_side)
}

fn engine() -> (Engine, StdUnixDatagram) {
    engine_with(config(), AllowList::allow_all())
}

fn app() -> SocketAddr {
    APP.parse().unwrap()
}

fn segment(dst: SocketAddr, seq: u32, ack: u32, flags: TcpFlags, payload: &[u8]) -> Vec<u8> {
    build_tcp(&TcpSegment {
        src: app(),
        dst,
        seq,
        ack,
        flags,
        window: 65535,
        mss: flags.syn.then_some(1400),
        ttl: 64,
        payload,
    })
    .unwrap()
}

fn syn(dst: SocketAddr, seq: u32) -> Vec<u8> {
    let flags = TcpFlags {
        syn: true,
        ..Default::default()
    };
    segment(dst, seq, 0, flags, &[])
}

/// Every packet the engine has written so far.
fn drain(app: &StdUnixDatagram) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    let mut buf = [0u8; 65536];
    loop {
        match app.recv(&mut buf) {
            Ok(n) => out.push(buf[..n].to_vec()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return out,
            Err(e) => panic!("recv: {}", e),
        }
    }
}

/// Turn the loop until `pred` matches a written packet.
fn turn_until(
    engine: &mut Engine,
    app: &StdUnixDatagram,
    pred: impl Fn(&Packet<'_>) -> bool,
) -> Vec<u8> {
    for _ in 0..100 {
        engine.turn(Some(TURN)).unwrap();
        for pkt in drain(app) {
            if packet::parse(&pkt).map(|p| pred(&p)).unwrap_or(false) {
                return pkt;
            }
        }
    }
    panic!("expected packet never arrived");
}

fn tcp_header(pkt: &[u8]) -> TcpHeader {
    match packet::parse(pkt) {
        Ok(Packet::Tcp { tcp, .. }) => tcp,
        other => panic!("not tcp: {:?}", other),
    }
}

fn is_rst(p: &Packet<'_>) -> bool {
    matches!(p, Packet::Tcp { tcp, .. } if tcp.flags.rst)
}

fn is_fin(p: &Packet<'_>) -> bool {
    matches!(p, Packet::Tcp { tcp, .. } if tcp.flags.fin)
}

fn carries_data(p: &Packet<'_>) -> bool {
    matches!(p, Packet::Tcp { payload, .. } if !payload.is_empty())
}

fn acks(p: &Packet<'_>, ack: u32) -> bool {
    matches!(p, Packet::Tcp { tcp, .. } if tcp.flags.ack && !tcp.flags.syn && tcp.ack == ack)
}

/// Complete a handshake with `listener`; returns the flow, the relay's ISS
/// and the accepted server side.
fn establish(
    engine: &mut Engine,
    app_side: &StdUnixDatagram,
    listener: &TcpListener,
) -> (FlowKey, u32, TcpStream) {
    let dst = listener.local_addr().unwrap();
    let key = FlowKey::tcp(app(), dst);
    app_side.send(&syn(dst, 1000)).unwrap();
    engine.turn(Some(TURN)).unwrap();
    assert_eq!(engine.sessions().tcp_count(), 1);

    let pkt = turn_until(engine, app_side, |p| {
        matches!(p, Packet::Tcp { tcp, .. } if tcp.flags.syn && tcp.flags.ack)
    });
    let tcp = tcp_header(&pkt);
    assert_eq!(tcp.ack, 1001);
    assert_eq!(tcp.mss, Some(1400));
    let iss = tcp.seq;

    app_side
        .send(&segment(dst, 1001, iss.wrapping_add(1), TcpFlags::ack_only(), &[]))
        .unwrap();
    engine.turn(Some(TURN)).unwrap();
    assert_eq!(engine.sessions().find_tcp(&key).unwrap().state, TcpState::Established);

    let (server, _) = listener.accept().unwrap();
    server
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    (key, iss, server)
}

#[test]
fn test_tcp_handshake_and_relay() {
    let (mut engine, app_side) = engine();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let dst = listener.local_addr().unwrap();
    let (key, iss, mut server) = establish(&mut engine, &app_side, &listener);

    app_side
        .send(&segment(dst, 1001, iss.wrapping_add(1), TcpFlags::psh_ack(), b"hello"))
        .unwrap();
    turn_until(&mut engine, &app_side, |p| acks(p, 1006));
    let mut buf = [0u8; 5];
    server.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"hello");

    server.write_all(b"world").unwrap();
    let pkt = turn_until(&mut engine, &app_side, carries_data);
    let Ok(Packet::Tcp { ip, tcp, payload }) = packet::parse(&pkt) else {
        unreachable!()
    };
    assert_eq!(payload, b"world");
    assert_eq!(tcp.seq, iss.wrapping_add(1));
    assert!(tcp.checksum_ok);
    assert_eq!(SocketAddr::from((ip.src, tcp.src_port)), dst);
    assert_eq!(SocketAddr::from((ip.dst, tcp.dst_port)), app());

    let s = engine.sessions().find_tcp(&key).unwrap();
    assert_eq!(s.seq.in_flight(), 5);
}

#[test]
fn test_retransmitted_syn_keeps_one_session() {
    let (mut engine, app_side) = engine();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let dst = listener.local_addr().unwrap();

    app_side.send(&syn(dst, 1000)).unwrap();
    app_side.send(&syn(dst, 1000)).unwrap();
    engine.turn(Some(TURN)).unwrap();
    app_side.send(&syn(dst, 1000)).unwrap();
    engine.turn(Some(TURN)).unwrap();

    assert_eq!(engine.sessions().tcp_count(), 1);
    assert_eq!(engine.stats().snapshot().tcp_sessions_total, 1);
}

#[test]
fn test_unknown_flow_is_reset() {
    let (mut engine, app_side) = engine();
    let dst: SocketAddr = "127.0.0.1:9".parse().unwrap();
    app_side
        .send(&segment(dst, 500, 77, TcpFlags::ack_only(), b"x"))
        .unwrap();
    let rst = turn_until(&mut engine, &app_side, is_rst);
    assert_eq!(tcp_header(&rst).seq, 77);
    assert_eq!(engine.sessions().total_count(), 0);
}

#[test]
fn test_denied_flow_opens_nothing() {
    let (mut engine, app_side) = engine_with(config(), AllowList::new(true, [10_001]));
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let dst = listener.local_addr().unwrap();
    app_side.send(&syn(dst, 1000)).unwrap();
    engine.turn(Some(TURN)).unwrap();

    assert_eq!(engine.sessions().total_count(), 0);
    assert_eq!(engine.stats().snapshot().policy_denied, 1);
}

#[test]
fn test_udp_timeouts_follow_port() {
    let (mut engine, app_side) = engine();
    let dns: SocketAddr = "127.0.0.1:53".parse().unwrap();
    let other: SocketAddr = "127.0.0.1:443".parse().unwrap();
    for dst in [dns, other] {
        let pkt = build_udp(app(), dst, 64, b"q").unwrap();
        app_side.send(&pkt).unwrap();
    }
    engine.turn(Some(TURN)).unwrap();

    let udp = engine.config().udp.clone();
    let sessions = engine.sessions();
    let dns_session = sessions.find_udp(&FlowKey::udp(app(), dns)).unwrap();
    let other_session = sessions.find_udp(&FlowKey::udp(app(), other)).unwrap();
    assert_eq!(dns_session.timeout(&udp), Duration::from_secs(15));
    assert_eq!(other_session.timeout(&udp), Duration::from_secs(300));
}

#[test]
fn test_udp_round_trip() {
    let (mut engine, app_side) = engine();
    let remote = UdpSocket::bind("127.0.0.1:0").unwrap();
    remote
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let dst = remote.local_addr().unwrap();

    let ping = build_udp(app(), dst, 64, b"ping").unwrap();
    app_side.send(&ping).unwrap();
    engine.turn(Some(TURN)).unwrap();

    let mut buf = [0u8; 16];
    let (n, from) = remote.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"ping");
    remote.send_to(b"pong", from).unwrap();

    let pkt = turn_until(&mut engine, &app_side, |p| matches!(p, Packet::Udp { .. }));
    let Ok(Packet::Udp { ip, udp, payload }) = packet::parse(&pkt) else {
        unreachable!()
    };
    assert_eq!(payload, b"pong");
    assert!(udp.checksum_ok);
    assert_eq!(SocketAddr::from((ip.src, udp.src_port)), dst);
    assert_eq!(SocketAddr::from((ip.dst, udp.dst_port)), app());
    let key = FlowKey::udp(app(), dst);
    let session = engine.sessions().find_udp(&key).unwrap();
    assert_eq!(session.packets_recv, 1);
}

#[test]
fn test_idle_established_session_swept_with_reset() {
    let (mut engine, app_side) = engine();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let (key, iss, _server) = establish(&mut engine, &app_side, &listener);
    drain(&app_side);

    assert_eq!(engine.sweep(Instant::now() + Duration::from_secs(299)).unwrap(), 0);
    assert_eq!(engine.sweep(Instant::now() + Duration::from_secs(301)).unwrap(), 1);
    assert!(engine.sessions().find_tcp(&key).is_none());

    let packets = drain(&app_side);
    assert_eq!(packets.len(), 1);
    let tcp = tcp_header(&packets[0]);
    assert!(tcp.flags.rst);
    assert_eq!(tcp.seq, iss.wrapping_add(1));

    let stats = engine.stats().snapshot();
    assert_eq!(stats.sessions_expired, 1);
    assert_eq!(stats.tcp_sessions_active, 0);
}

#[test]
fn test_blocked_dns_answer_rewritten_or_dropped() {
    let blocklist: Blocklist = ["ads.example.com".to_string()].into_iter().collect();
    let rewrite = DnsConfig::default();
    let drop = DnsConfig {
        block_action: BlockAction::Drop,
        ..Default::default()
    };

    for upstream_ttl in [5, 86_400] {
        let a = response("ads.example.com", QTYPE_A, &[93, 184, 216, 34], upstream_ttl);
        let DnsVerdict::Rewrite(out) = inspect_response(&a, &blocklist, &rewrite) else {
            panic!("not rewritten")
        };
        assert_eq!(&out[out.len() - 10..out.len() - 6], &3600u32.to_be_bytes());
        assert_eq!(&out[out.len() - 4..], &[127, 0, 0, 1]);
        assert_eq!(inspect_response(&a, &blocklist, &drop), DnsVerdict::Drop);
    }

    let aaaa = response("ads.example.com", QTYPE_AAAA, &[0x20; 16], 60);
    let DnsVerdict::Rewrite(out) = inspect_response(&aaaa, &blocklist, &rewrite) else {
        panic!("not rewritten")
    };
    let mut loopback = [0u8; 16];
    loopback[15] = 1;
    assert_eq!(&out[out.len() - 16..], &loopback);

    let allowed = response("example.com", QTYPE_A, &[93, 184, 216, 34], 5);
    assert_eq!(inspect_response(&allowed, &blocklist, &rewrite), DnsVerdict::Forward);
}

#[test]
fn test_malformed_packets_counted_and_ignored() {
    let (mut engine, app_side) = engine();
    app_side.send(&[0x45, 0, 0]).unwrap();
    app_side.send(&[0x60; 40]).unwrap();
    engine.turn(Some(TURN)).unwrap();

    assert_eq!(engine.stats().snapshot().packets_invalid, 2);
    assert_eq!(engine.sessions().total_count(), 0);
    assert!(drain(&app_side).is_empty());
}

#[test]
fn test_shutdown_from_handle() {
    let (mut engine, app_side) = engine();
    let dst: SocketAddr = "127.0.0.1:443".parse().unwrap();
    let query = build_udp(app(), dst, 64, b"q").unwrap();
    app_side.send(&query).unwrap();
    engine.turn(Some(TURN)).unwrap();
    assert_eq!(engine.sessions().udp_count(), 1);

    let handle = engine.handle();
    std::thread::spawn(move || handle.shutdown().unwrap())
        .join()
        .unwrap();
    assert!(!engine.turn(Some(Duration::from_secs(5))).unwrap());
    assert!(!engine.is_running());
    assert_eq!(engine.sessions().total_count(), 0);

    engine.shutdown();
    assert!(!engine.turn(Some(TURN)).unwrap());

    let handle = engine.handle();
    drop(engine);
    assert!(matches!(handle.shutdown(), Err(RelayError::EngineStopped)));
}

#[test]
fn test_policy_replaced_at_runtime() {
    let (mut engine, app_side) = engine();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let dst = listener.local_addr().unwrap();

    engine
        .handle()
        .set_policy(|_uid: Option<u32>, f: &FlowKey| f.dest.port() != 443)
        .unwrap();
    engine.turn(Some(TURN)).unwrap();

    app_side.send(&syn(dst, 1000)).unwrap();
    engine.turn(Some(TURN)).unwrap();
    assert_eq!(engine.sessions().tcp_count(), 1);

    app_side
        .send(&build_udp(app(), "127.0.0.1:443".parse().unwrap(), 64, b"q").unwrap())
        .unwrap();
    engine.turn(Some(TURN)).unwrap();
    assert_eq!(engine.sessions().udp_count(), 0);
    assert_eq!(engine.stats().snapshot().policy_denied, 1);
}

/// Tunnel whose reads report the device gone.
struct ClosedTunnel(UnixDatagram);

impl Source for ClosedTunnel {
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.0.register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.0.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.0.deregister(registry)
    }
}

impl Tunnel for ClosedTunnel {
    fn read_packet(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::ErrorKind::UnexpectedEof.into())
    }

    fn write_packet(&mut self, packet: &[u8]) -> io::Result<usize> {
        Ok(packet.len())
    }
}

#[test]
fn test_closed_tunnel_is_fatal() {
    let (engine_side, app_side) = StdUnixDatagram::pair().unwrap();
    engine_side.set_nonblocking(true).unwrap();
    let mut engine = Engine::builder()
        .config(config())
        .build(ClosedTunnel(UnixDatagram::from_std(engine_side)))
        .unwrap();

    app_side.send(b"wake").unwrap();
    let result = engine.turn(Some(Duration::from_secs(5)));
    assert!(matches!(result, Err(RelayError::TunnelClosed)));
    assert!(!engine.is_running());
}

#[test]
fn test_empty_datagram_is_dropped() {
    let (mut engine, app_side) = engine();
    app_side.send(&[]).unwrap();
    assert!(engine.turn(Some(TURN)).unwrap());
    assert!(engine.is_running());
    assert_eq!(engine.stats().snapshot().packets_invalid, 1);

    let dst: SocketAddr = "127.0.0.1:443".parse().unwrap();
    let query = build_udp(app(), dst, 64, b"q").unwrap();
    app_side.send(&query).unwrap();
    engine.turn(Some(TURN)).unwrap();
    assert_eq!(engine.sessions().udp_count(), 1);
}

#[test]
fn test_duplicate_data_acked_not_rewritten() {
    let (mut engine, app_side) = engine();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let dst = listener.local_addr().unwrap();
    let (_key, iss, mut server) = establish(&mut engine, &app_side, &listener);
    let ack = iss.wrapping_add(1);

    let hello = segment(dst, 1001, ack, TcpFlags::psh_ack(), b"hello");
    app_side.send(&hello).unwrap();
    turn_until(&mut engine, &app_side, |p| acks(p, 1006));

    app_side.send(&hello).unwrap();
    let dup_ack = turn_until(&mut engine, &app_side, |p| acks(p, 1006));
    assert!(!tcp_header(&dup_ack).flags.rst);

    app_side
        .send(&segment(dst, 1006, ack, TcpFlags::psh_ack(), b"world"))
        .unwrap();
    turn_until(&mut engine, &app_side, |p| acks(p, 1011));

    let mut buf = [0u8; 10];
    server.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"helloworld");
}

#[test]
fn test_send_window_limits_relay() {
    let (mut engine, app_side) = engine();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let dst = listener.local_addr().unwrap();
    let (key, iss, mut server) = establish(&mut engine, &app_side, &listener);
    drain(&app_side);

    let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    server.write_all(&data).unwrap();

    let mut received = Vec::new();
    let mut window_filled = false;
    for _ in 0..200 {
        if received.len() == data.len() {
            break;
        }
        engine.turn(Some(TURN)).unwrap();
        let unacked_before = received.len();
        for pkt in drain(&app_side) {
            let Ok(Packet::Tcp { tcp, payload, .. }) = packet::parse(&pkt) else {
                continue;
            };
            if payload.is_empty() {
                continue;
            }
            assert!(payload.len() <= 1400);
            assert_eq!(tcp.seq, iss.wrapping_add(1 + received.len() as u32));
            received.extend_from_slice(payload);
        }
        assert!(received.len() - unacked_before <= 2048);

        let in_flight = engine.sessions().find_tcp(&key).unwrap().seq.in_flight();
        assert!(in_flight <= 2048);
        window_filled |= in_flight == 2048;

        let ack = iss.wrapping_add(1 + received.len() as u32);
        app_side
            .send(&segment(dst, 1001, ack, TcpFlags::ack_only(), &[]))
            .unwrap();
    }

    assert!(window_filled);
    assert_eq!(received, data);
}

#[test]
fn test_app_close_then_remote_close() {
    let (mut engine, app_side) = engine();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let dst = listener.local_addr().unwrap();
    let (key, iss, mut server) = establish(&mut engine, &app_side, &listener);
    let state = |engine: &Engine| engine.sessions().find_tcp(&key).unwrap().state;

    let fin = segment(dst, 1001, iss.wrapping_add(1), TcpFlags::fin_ack(), &[]);
    app_side.send(&fin).unwrap();
    turn_until(&mut engine, &app_side, |p| acks(p, 1002));
    assert_eq!(state(&engine), TcpState::CloseWait);

    let mut buf = [0u8; 1];
    assert_eq!(server.read(&mut buf).unwrap(), 0);
    drop(server);

    let relay_fin = turn_until(&mut engine, &app_side, is_fin);
    assert_eq!(tcp_header(&relay_fin).seq, iss.wrapping_add(1));
    assert_eq!(state(&engine), TcpState::LastAck);

    app_side
        .send(&segment(dst, 1002, iss.wrapping_add(2), TcpFlags::ack_only(), &[]))
        .unwrap();
    engine.turn(Some(TURN)).unwrap();
    assert_eq!(state(&engine), TcpState::TimeWait);

    drain(&app_side);
    let again = segment(dst, 1001, iss.wrapping_add(2), TcpFlags::fin_ack(), &[]);
    app_side.send(&again).unwrap();
    turn_until(&mut engine, &app_side, |p| acks(p, 1002));
    assert_eq!(state(&engine), TcpState::TimeWait);
}

#[test]
fn test_remote_close_then_app_close() {
    let (mut engine, app_side) = engine();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let dst = listener.local_addr().unwrap();
    let (key, iss, server) = establish(&mut engine, &app_side, &listener);
    let state = |engine: &Engine| engine.sessions().find_tcp(&key).unwrap().state;

    drop(server);
    turn_until(&mut engine, &app_side, is_fin);
    assert_eq!(state(&engine), TcpState::FinWait);

    let fin = segment(dst, 1001, iss.wrapping_add(2), TcpFlags::fin_ack(), &[]);
    app_side.send(&fin).unwrap();
    turn_until(&mut engine, &app_side, |p| acks(p, 1002));
    assert_eq!(state(&engine), TcpState::TimeWait);
}

#[test]
fn test_out_of_window_segment_resets_flow() {
    let (mut engine, app_side) = engine();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let dst = listener.local_addr().unwrap();
    let (key, iss, _server) = establish(&mut engine, &app_side, &listener);

    let stray = segment(dst, 1001 + 5000, iss.wrapping_add(1), TcpFlags::psh_ack(), b"x");
    app_side.send(&stray).unwrap();
    let rst = turn_until(&mut engine, &app_side, is_rst);
    assert_eq!(tcp_header(&rst).seq, iss.wrapping_add(1));
    assert!(engine.sessions().find_tcp(&key).is_none());
    assert_eq!(engine.stats().snapshot().resets_sent, 1);
}

#[test]
fn test_bad_checksum_resets_flow() {
    let (mut engine, app_side) = engine();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let dst = listener.local_addr().unwrap();
    let (key, iss, _server) = establish(&mut engine, &app_side, &listener);

    let mut corrupt = segment(dst, 1001, iss.wrapping_add(1), TcpFlags::psh_ack(), b"hello");
    let last = corrupt.len() - 1;
    corrupt[last] ^= 0xff;
    app_side.send(&corrupt).unwrap();

    let rst = turn_until(&mut engine, &app_side, is_rst);
    assert_eq!(tcp_header(&rst).seq, iss.wrapping_add(1));
    assert!(engine.sessions().find_tcp(&key).is_none());
    assert_eq!(engine.stats().snapshot().checksum_errors, 1);
}
