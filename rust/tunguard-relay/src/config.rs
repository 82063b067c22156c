use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{RelayError, Result};
use crate::packet::{IPV4_HEADER_LEN, TCP_HEADER_LEN};

/// Top-level engine configuration, usually loaded from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub tcp: TcpConfig,
    #[serde(default)]
    pub udp: UdpConfig,
    #[serde(default)]
    pub dns: DnsConfig,
    #[serde(default)]
    pub uid: UidConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    /// Upper bound on a single readiness wait, in seconds.
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,
    #[serde(default = "default_tun_max_packet")]
    pub tun_max_packet: usize,
    #[serde(default)]
    pub log_packets: bool,
    #[serde(default)]
    pub log_level: LogLevel,
    /// When false every flow is allowed.
    #[serde(default = "default_true")]
    pub filter: bool,
    #[serde(default)]
    pub allowed_uids: Vec<u32>,
    pub hosts_file: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tcp: TcpConfig::default(),
            udp: UdpConfig::default(),
            dns: DnsConfig::default(),
            uid: UidConfig::default(),
            capture: CaptureConfig::default(),
            poll_timeout_secs: default_poll_timeout(),
            tun_max_packet: default_tun_max_packet(),
            log_packets: false,
            log_level: LogLevel::default(),
            filter: true,
            allowed_uids: Vec::new(),
            hosts_file: None,
        }
    }
}

impl EngineConfig {
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| RelayError::config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_yaml_str(&content)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tcp.recv_window == 0 || self.tcp.send_window == 0 {
            return Err(RelayError::config("tcp windows must be non-zero"));
        }
        if self.tcp.mss == 0 {
            return Err(RelayError::config("tcp mss must be non-zero"));
        }
        for (name, secs) in [
            ("tcp.init_timeout", self.tcp.init_timeout),
            ("tcp.idle_timeout", self.tcp.idle_timeout),
            ("tcp.close_timeout", self.tcp.close_timeout),
            ("tcp.keep_timeout", self.tcp.keep_timeout),
            ("udp.dns_timeout", self.udp.dns_timeout),
            ("udp.idle_timeout", self.udp.idle_timeout),
            ("poll_timeout_secs", self.poll_timeout_secs),
        ] {
            if secs == 0 {
                return Err(RelayError::config(format!("{} must be non-zero", name)));
            }
        }
        if self.tun_max_packet < IPV4_HEADER_LEN + TCP_HEADER_LEN {
            return Err(RelayError::config(format!(
                "tun_max_packet {} cannot hold an IPv4 TCP header",
                self.tun_max_packet
            )));
        }
        if self.udp.max_datagram == 0 {
            return Err(RelayError::config("udp.max_datagram must be non-zero"));
        }
        if self.uid.max_tries == 0 {
            return Err(RelayError::config("uid.max_tries must be at least 1"));
        }
        Ok(())
    }
}

/// TCP relay parameters. Timeouts are in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    pub recv_window: u16,
    pub send_window: u16,
    pub mss: u16,
    pub ttl: u8,
    /// Connection establishment.
    pub init_timeout: u64,
    /// Established and idle.
    pub idle_timeout: u64,
    /// Closing handshake.
    pub close_timeout: u64,
    /// App half-closed, remote still sending.
    pub keep_timeout: u64,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            recv_window: 2048,
            send_window: 2048,
            mss: 1460,
            ttl: 64,
            init_timeout: 30,
            idle_timeout: 300,
            close_timeout: 30,
            keep_timeout: 300,
        }
    }
}

impl TcpConfig {
    /// Largest data segment sent towards the tunnel.
    pub fn effective_mss(&self) -> u16 {
        self.mss.min(self.send_window)
    }
}

/// UDP relay parameters. Timeouts are in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpConfig {
    pub ttl: u8,
    pub dns_timeout: u64,
    pub idle_timeout: u64,
    pub max_datagram: usize,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            ttl: 64,
            dns_timeout: 15,
            idle_timeout: 300,
            max_datagram: 65507,
        }
    }
}

/// What happens to a DNS response for a blocked name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BlockAction {
    /// Rewrite address answers to the sinkhole.
    #[default]
    Rewrite,
    /// Drop the response entirely.
    Drop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    /// TTL written into every answer of a blocked response.
    pub ttl: u32,
    pub block_action: BlockAction,
    pub sinkhole: Ipv4Addr,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            ttl: 3600,
            block_action: BlockAction::Rewrite,
            sinkhole: Ipv4Addr::LOCALHOST,
        }
    }
}

/// Bounded retry around uid resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UidConfig {
    pub first_delay_ms: u64,
    pub retry_delay_ms: u64,
    pub max_tries: u32,
}

impl Default for UidConfig {
    fn default() -> Self {
        Self {
            first_delay_ms: 1,
            retry_delay_ms: 10,
            max_tries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub path: Option<PathBuf>,
    pub snaplen: u32,
    pub max_file_size: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            path: None,
            snaplen: 128,
            max_file_size: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Silent,
    Error,
    Warning,
    #[default]
    Info,
    Debug,
}

impl FromStr for LogLevel {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "silent" | "off" => Ok(Self::Silent),
            "error" => Ok(Self::Error),
            "warning" | "warn" => Ok(Self::Warning),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            other => Err(RelayError::config(format!("unknown log level '{}'", other))),
        }
    }
}

fn default_poll_timeout() -> u64 {
    10
}

fn default_tun_max_packet() -> usize {
    32768
}

fn default_true() -> bool {
    true
}
