//! tunguard relay - root-less per-app firewall over a TUN device
//!
//! This crate terminates the IPv4 TCP and UDP flows that applications send
//! into a VPN-style TUN interface and relays them over ordinary sockets,
//! deciding per flow (by owning uid) whether it may leave the device.
//!
//! # Features
//!
//! - Reduced TCP state machine that answers the app's handshake itself
//! - UDP relay with per-flow connected sockets
//! - DNS response inspection with sinkhole rewrite for blocked names
//! - Per-uid admission through a pluggable policy
//! - Socket protection hook so relay sockets bypass the VPN
//! - Optional pcap capture and per-packet access log
//!
//! # Architecture
//!
//! ```text
//! +-------------------------------------------------------------+
//! |                   TUN file descriptor                       |
//! +-------------------------------------------------------------+
//!                              |
//!                              v
//! +-------------------------------------------------------------+
//! |                   Engine (mio event loop)                   |
//! | +-------------+ +-------------+ +-------------+             |
//! | |  TcpEngine  | |  UdpRelay   | | DNS inspect |             |
//! | +-------------+ +-------------+ +-------------+             |
//! |          |             |              |                     |
//! |          +-------------+--------------+                     |
//! |                        |                                    |
//! | +-----------------------------------------------------+    |
//! | |   SessionTable  |  PolicyGate + UidLookup  | Sweep  |    |
//! | +-----------------------------------------------------+    |
//! +-------------------------------------------------------------+
//!                              |
//!                              v
//! +-------------------------------------------------------------+
//! |           Protected sockets to the real network             |
//! +-------------------------------------------------------------+
//! ```
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use std::os::fd::OwnedFd;
//! use tunguard_relay::prelude::*;
//!
//! fn serve(tun: OwnedFd) -> Result<()> {
//!     let mut engine = Engine::builder()
//!         .config(EngineConfig::load("tunguard.yaml")?)
//!         .policy(AllowList::new(true, [10001]))
//!         .uid_resolver(ProcNetResolver::new())
//!         .build(TunFd::new(tun)?)?;
//!
//!     let handle = engine.handle();
//!     std::thread::spawn(move || {
//!         // later, from any thread
//!         let _ = handle.shutdown();
//!     });
//!
//!     engine.run()
//! }
//! ```

pub mod capture;
pub mod config;
pub mod device;
pub mod dns;
pub mod engine;
pub mod error;
pub mod flowlog;
pub mod hosts;
pub mod logging;
pub mod packet;
pub mod policy;
pub mod procnet;
pub mod protect;
pub mod session;
pub mod stats;
pub mod tcp;
pub mod udp;

#[cfg(test)]
mod tests;

// Re-exports for convenience
pub use capture::{CaptureSink, PcapFile, PcapWriter};
pub use config::{
    BlockAction, CaptureConfig, DnsConfig, EngineConfig, LogLevel, TcpConfig, UdpConfig, UidConfig,
};
pub use device::{TunFd, Tunnel};
pub use dns::{inspect_response, DnsVerdict};
pub use engine::{Control, Engine, EngineBuilder, EngineHandle, Outbox, Verdict};
pub use error::{RelayError, Result};
pub use flowlog::{PacketLog, PacketLogger, TracingPacketLogger};
pub use hosts::Blocklist;
pub use logging::init_logging;
pub use packet::{Protocol, TcpFlags};
pub use policy::{AllowList, NoUidResolver, PolicyGate, UidLookup, UidResolver};
pub use procnet::ProcNetResolver;
pub use protect::{NoopProtector, SocketProtector};
pub use session::{FlowKey, SessionTable};
pub use stats::{StackStats, StatsSnapshot};
pub use tcp::{TcpSession, TcpState};
pub use udp::UdpSession;

/// Prelude module for common imports
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::device::{TunFd, Tunnel};
    pub use crate::engine::{Engine, EngineHandle};
    pub use crate::error::{RelayError, Result};
    pub use crate::hosts::Blocklist;
    pub use crate::policy::{AllowList, PolicyGate};
    pub use crate::procnet::ProcNetResolver;
    pub use crate::protect::SocketProtector;
}
