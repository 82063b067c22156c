//! Per-packet access log.

use std::net::IpAddr;
use std::time::SystemTime;

use tracing::info;

use crate::packet::TcpFlags;

/// One processed tunnel packet and the decision taken for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketLog {
    pub time: SystemTime,
    pub version: u8,
    /// IP protocol number.
    pub protocol: u8,
    /// TCP flags as letters (`S`, `A`, `P`, `F`, `R`), empty otherwise.
    pub flags: String,
    pub source: IpAddr,
    pub sport: u16,
    pub dest: IpAddr,
    pub dport: u16,
    pub uid: Option<u32>,
    pub allowed: bool,
}

impl PacketLog {
    pub fn flags_from(tcp: Option<&TcpFlags>) -> String {
        tcp.map(|f| f.to_string()).unwrap_or_default()
    }
}

/// Sink for packet records. Logging never affects how a packet is handled.
pub trait PacketLogger: Send {
    fn log(&self, record: &PacketLog);
}

/// Emits one `tracing` event per record.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingPacketLogger;

impl PacketLogger for TracingPacketLogger {
    fn log(&self, r: &PacketLog) {
        info!(
            target: "tunguard::packet",
            version = r.version,
            protocol = r.protocol,
            flags = %r.flags,
            uid = ?r.uid,
            allowed = r.allowed,
            "{}:{} -> {}:{}",
            r.source, r.sport, r.dest, r.dport
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default, Clone)]
    struct Collect(Arc<Mutex<Vec<PacketLog>>>);

    impl PacketLogger for Collect {
        fn log(&self, record: &PacketLog) {
            self.0.lock().unwrap().push(record.clone());
        }
    }

    #[test]
    fn test_flags_rendering() {
        assert_eq!(PacketLog::flags_from(Some(&TcpFlags::syn_ack())), "SA");
        assert_eq!(PacketLog::flags_from(None), "");
    }

    #[test]
    fn test_custom_logger_receives_record() {
        let sink = Collect::default();
        let record = PacketLog {
            time: SystemTime::now(),
            version: 4,
            protocol: 17,
            flags: String::new(),
            source: "10.1.10.1".parse().unwrap(),
            sport: 5353,
            dest: "8.8.8.8".parse().unwrap(),
            dport: 53,
            uid: Some(10_001),
            allowed: true,
        };
        sink.log(&record);
        TracingPacketLogger.log(&record);
        assert_eq!(sink.0.lock().unwrap()[0], record);
    }
}
