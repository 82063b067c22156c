//! Domain blocklist loaded from hosts-file syntax

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;

use tracing::debug;

use crate::error::{RelayError, Result};

/// Names that appear in every hosts file and are never treated as blocked.
const LOCAL_NAMES: &[&str] = &[
    "localhost",
    "localhost.localdomain",
    "local",
    "broadcasthost",
    "ip6-localhost",
    "ip6-loopback",
];

/// Set of blocked domain names.
///
/// Lookups are exact, case-insensitive and ignore a trailing dot.
#[derive(Debug, Clone, Default)]
pub struct Blocklist {
    names: HashSet<String>,
}

impl Blocklist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str) {
        let name = normalize(name);
        if !name.is_empty() {
            self.names.insert(name);
        }
    }

    pub fn is_blocked(&self, name: &str) -> bool {
        !self.names.is_empty() && self.names.contains(&normalize(name))
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Parse hosts-file content. Every hostname mapped to any address is blocked.
    pub fn parse(content: &str) -> Self {
        let mut list = Self::new();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut parts = line.split_whitespace();
            let Some(addr) = parts.next() else { continue };
            if addr.parse::<IpAddr>().is_err() {
                continue;
            }
            for hostname in parts {
                if hostname.starts_with('#') {
                    break;
                }
                if LOCAL_NAMES.contains(&hostname.to_ascii_lowercase().as_str()) {
                    continue;
                }
                list.insert(hostname);
            }
        }

        debug!("Parsed {} blocked names", list.len());
        list
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            RelayError::config(format!(
                "failed to read hosts file {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(Self::parse(&content))
    }
}

impl FromIterator<String> for Blocklist {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        let mut list = Self::new();
        for name in iter {
            list.insert(&name);
        }
        list
    }
}

fn normalize(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}
