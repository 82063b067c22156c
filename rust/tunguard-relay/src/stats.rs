//! Relay statistics
//!
//! Counters are shared between the loop thread and any observer holding an
//! [`EngineHandle`](crate::engine::EngineHandle).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
pub struct StackStats {
    start_time: Option<Instant>,

    // Tunnel traffic
    pub packets_received: AtomicU64,
    pub packets_sent: AtomicU64,
    pub packets_dropped: AtomicU64,
    pub packets_invalid: AtomicU64,
    pub bytes_received: AtomicU64,
    pub bytes_sent: AtomicU64,

    // Per protocol
    pub tcp_packets: AtomicU64,
    pub udp_packets: AtomicU64,
    pub other_packets: AtomicU64,

    // Sessions
    pub tcp_sessions_total: AtomicU64,
    pub tcp_sessions_active: AtomicU64,
    pub udp_sessions_total: AtomicU64,
    pub udp_sessions_active: AtomicU64,
    pub sessions_expired: AtomicU64,

    // Policy and protocol outcomes
    pub policy_denied: AtomicU64,
    pub resets_sent: AtomicU64,
    pub dns_inspected: AtomicU64,
    pub dns_blocked: AtomicU64,
    pub checksum_errors: AtomicU64,
    pub socket_errors: AtomicU64,
}

impl StackStats {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn uptime(&self) -> Duration {
        self.start_time
            .map(|t| t.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    /// Packet read from the tunnel
    pub fn record_received(&self, bytes: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Packet written to the tunnel
    pub fn record_sent(&self, bytes: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.packets_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalid(&self) {
        self.packets_invalid.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tcp(&self) {
        self.tcp_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_udp(&self) {
        self.udp_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_other(&self) {
        self.other_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tcp_session(&self) {
        self.tcp_sessions_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_udp_session(&self) {
        self.udp_sessions_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_expired(&self, count: usize) {
        self.sessions_expired.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Publish the current table size.
    pub fn set_active(&self, tcp: usize, udp: usize) {
        self.tcp_sessions_active.store(tcp as u64, Ordering::Relaxed);
        self.udp_sessions_active.store(udp as u64, Ordering::Relaxed);
    }

    pub fn record_denied(&self) {
        self.policy_denied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reset(&self) {
        self.resets_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dns_inspected(&self) {
        self.dns_inspected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dns_blocked(&self) {
        self.dns_blocked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_checksum_error(&self) {
        self.checksum_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_socket_error(&self) {
        self.socket_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            uptime: self.uptime(),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            packets_invalid: self.packets_invalid.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            tcp_packets: self.tcp_packets.load(Ordering::Relaxed),
            udp_packets: self.udp_packets.load(Ordering::Relaxed),
            other_packets: self.other_packets.load(Ordering::Relaxed),
            tcp_sessions_total: self.tcp_sessions_total.load(Ordering::Relaxed),
            tcp_sessions_active: self.tcp_sessions_active.load(Ordering::Relaxed),
            udp_sessions_total: self.udp_sessions_total.load(Ordering::Relaxed),
            udp_sessions_active: self.udp_sessions_active.load(Ordering::Relaxed),
            sessions_expired: self.sessions_expired.load(Ordering::Relaxed),
            policy_denied: self.policy_denied.load(Ordering::Relaxed),
            resets_sent: self.resets_sent.load(Ordering::Relaxed),
            dns_inspected: self.dns_inspected.load(Ordering::Relaxed),
            dns_blocked: self.dns_blocked.load(Ordering::Relaxed),
            checksum_errors: self.checksum_errors.load(Ordering::Relaxed),
            socket_errors: self.socket_errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of statistics at a point in time
#[derive(Debug, Clone, Default)]
pub struct StatsSnapshot {
    pub uptime: Duration,
    pub packets_received: u64,
    pub packets_sent: u64,
    pub packets_dropped: u64,
    pub packets_invalid: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub tcp_packets: u64,
    pub udp_packets: u64,
    pub other_packets: u64,
    pub tcp_sessions_total: u64,
    pub tcp_sessions_active: u64,
    pub udp_sessions_total: u64,
    pub udp_sessions_active: u64,
    pub sessions_expired: u64,
    pub policy_denied: u64,
    pub resets_sent: u64,
    pub dns_inspected: u64,
    pub dns_blocked: u64,
    pub checksum_errors: u64,
    pub socket_errors: u64,
}

impl StatsSnapshot {
    pub fn total_sessions(&self) -> u64 {
        self.tcp_sessions_active + self.udp_sessions_active
    }
}
