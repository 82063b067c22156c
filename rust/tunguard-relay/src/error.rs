//! Error types for the tunguard relay engine

use std::io;
use thiserror::Error;

use crate::session::FlowKey;

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Main error type for the relay engine
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    #[error("Packet too short: expected {expected}, got {actual}")]
    PacketTooShort { expected: usize, actual: usize },

    #[error("Unsupported IP version: {0}")]
    UnsupportedVersion(u8),

    #[error("Checksum mismatch in {0} header")]
    ChecksumMismatch(&'static str),

    #[error("DNS error: {0}")]
    Dns(String),

    #[error("Session already exists for {0}")]
    DuplicateFlow(FlowKey),

    #[error("Socket protection refused for fd {0}")]
    ProtectFailed(i32),

    #[error("Tunnel closed")]
    TunnelClosed,

    #[error("Engine stopped")]
    EngineStopped,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl RelayError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidPacket(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn too_short(expected: usize, actual: usize) -> Self {
        Self::PacketTooShort { expected, actual }
    }

    /// Malformed input is dropped before any session is touched.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            Self::InvalidPacket(_)
                | Self::PacketTooShort { .. }
                | Self::UnsupportedVersion(_)
                | Self::ChecksumMismatch(_)
        )
    }

    /// Errors that end the engine run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::TunnelClosed)
    }
}
