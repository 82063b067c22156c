//! DNS response inspection for blocked domains.
//!
//! Responses relayed back from port 53 are parsed just far enough to read the
//! question and answer names. When any of those names is on the blocklist the
//! response is either dropped or rewritten so address answers point at the
//! sinkhole, with every answer TTL normalized.

use std::net::{Ipv4Addr, Ipv6Addr};

use tracing::debug;

use crate::config::{BlockAction, DnsConfig};
use crate::error::{RelayError, Result};
use crate::hosts::Blocklist;

pub const QTYPE_A: u16 = 1;
pub const QTYPE_AAAA: u16 = 28;
pub const QCLASS_IN: u16 = 1;

const HEADER_LEN: usize = 12;
const MAX_POINTER_HOPS: usize = 16;
const MAX_NAME_LEN: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion {
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

/// Resource record located inside the message it was parsed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsAnswer {
    pub name: String,
    pub rtype: u16,
    pub class: u16,
    pub ttl: u32,
    pub ttl_offset: usize,
    pub rdata_offset: usize,
    pub rdlength: usize,
}

#[derive(Debug, Clone)]
pub struct DnsResponse {
    pub id: u16,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsAnswer>,
}

/// Outcome of inspecting one response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsVerdict {
    /// Relay the response unchanged.
    Forward,
    /// Relay this rewritten response instead.
    Rewrite(Vec<u8>),
    Drop,
}

fn err(msg: &str) -> RelayError {
    RelayError::Dns(msg.to_string())
}

fn read_u16(data: &[u8], pos: usize) -> Result<u16> {
    data.get(pos..pos + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or_else(|| err("truncated"))
}

/// Parse a response header, its questions and its answer section.
pub fn parse_response(data: &[u8]) -> Result<DnsResponse> {
    if data.len() < HEADER_LEN {
        return Err(err("too short"));
    }
    let id = read_u16(data, 0)?;
    if data[2] & 0x80 == 0 {
        return Err(err("not a response"));
    }
    let qdcount = read_u16(data, 4)?;
    let ancount = read_u16(data, 6)?;

    let mut pos = HEADER_LEN;
    let mut questions = Vec::with_capacity(usize::from(qdcount));
    for _ in 0..qdcount {
        let (name, next) = parse_name(data, pos)?;
        let qtype = read_u16(data, next)?;
        let qclass = read_u16(data, next + 2)?;
        pos = next + 4;
        questions.push(DnsQuestion {
            name,
            qtype,
            qclass,
        });
    }

    let mut answers = Vec::with_capacity(usize::from(ancount));
    for _ in 0..ancount {
        let (name, next) = parse_name(data, pos)?;
        let rtype = read_u16(data, next)?;
        let class = read_u16(data, next + 2)?;
        let ttl_offset = next + 4;
        let ttl = data
            .get(ttl_offset..ttl_offset + 4)
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
            .ok_or_else(|| err("truncated ttl"))?;
        let rdlength = usize::from(read_u16(data, next + 8)?);
        let rdata_offset = next + 10;
        if rdata_offset + rdlength > data.len() {
            return Err(err("truncated rdata"));
        }
        pos = rdata_offset + rdlength;
        answers.push(DnsAnswer {
            name,
            rtype,
            class,
            ttl,
            ttl_offset,
            rdata_offset,
            rdlength,
        });
    }

    Ok(DnsResponse {
        id,
        questions,
        answers,
    })
}

/// Read a possibly compressed name starting at `start`.
///
/// Returns the dotted lowercase name and the offset just past it in the
/// original position (not following pointers).
pub fn parse_name(data: &[u8], start: usize) -> Result<(String, usize)> {
    let mut name = String::new();
    let mut pos = start;
    let mut end = None;
    let mut hops = 0;

    loop {
        let len = usize::from(*data.get(pos).ok_or_else(|| err("name truncated"))?);
        if len == 0 {
            if end.is_none() {
                end = Some(pos + 1);
            }
            break;
        }
        if len & 0xC0 == 0xC0 {
            let low = usize::from(*data.get(pos + 1).ok_or_else(|| err("pointer truncated"))?);
            hops += 1;
            if hops > MAX_POINTER_HOPS {
                return Err(err("pointer loop"));
            }
            if end.is_none() {
                end = Some(pos + 2);
            }
            pos = ((len & 0x3F) << 8) | low;
            continue;
        }
        if len & 0xC0 != 0 {
            return Err(err("bad label type"));
        }
        let label = data
            .get(pos + 1..pos + 1 + len)
            .ok_or_else(|| err("label truncated"))?;
        if !name.is_empty() {
            name.push('.');
        }
        name.extend(label.iter().map(|b| char::from(b.to_ascii_lowercase())));
        if name.len() > MAX_NAME_LEN {
            return Err(err("name too long"));
        }
        pos += 1 + len;
    }

    Ok((name, end.unwrap_or(pos + 1)))
}

/// Decide what to do with a response relayed from a DNS server.
///
/// Payloads that do not parse are forwarded untouched.
pub fn inspect_response(data: &[u8], blocklist: &Blocklist, config: &DnsConfig) -> DnsVerdict {
    if blocklist.is_empty() {
        return DnsVerdict::Forward;
    }
    let response = match parse_response(data) {
        Ok(r) => r,
        Err(e) => {
            debug!("dns response not inspected: {}", e);
            return DnsVerdict::Forward;
        }
    };

    let blocked = response
        .questions
        .iter()
        .map(|q| q.name.as_str())
        .chain(response.answers.iter().map(|a| a.name.as_str()))
        .find(|name| blocklist.is_blocked(name));
    let Some(name) = blocked else {
        return DnsVerdict::Forward;
    };

    match config.block_action {
        BlockAction::Drop => {
            debug!("dns response {:#06x} for {} dropped", response.id, name);
            DnsVerdict::Drop
        }
        BlockAction::Rewrite => {
            debug!(
                "dns response {:#06x} for {} rewritten to {}",
                response.id, name, config.sinkhole
            );
            DnsVerdict::Rewrite(rewrite(data, &response, config))
        }
    }
}

fn rewrite(data: &[u8], response: &DnsResponse, config: &DnsConfig) -> Vec<u8> {
    let mut out = data.to_vec();
    for answer in &response.answers {
        out[answer.ttl_offset..answer.ttl_offset + 4].copy_from_slice(&config.ttl.to_be_bytes());
        if answer.class != QCLASS_IN {
            continue;
        }
        let rdata = answer.rdata_offset..answer.rdata_offset + answer.rdlength;
        match (answer.rtype, answer.rdlength) {
            (QTYPE_A, 4) => out[rdata].copy_from_slice(&config.sinkhole.octets()),
            (QTYPE_AAAA, 16) => out[rdata].copy_from_slice(&Ipv6Addr::LOCALHOST.octets()),
            _ => {}
        }
    }
    out
}

/// First A answer of a response, if any.
pub fn first_a_record(data: &[u8]) -> Option<Ipv4Addr> {
    let response = parse_response(data).ok()?;
    response
        .answers
        .iter()
        .find(|a| a.rtype == QTYPE_A && a.rdlength == 4)
        .map(|a| {
            let r = &data[a.rdata_offset..a.rdata_offset + 4];
            Ipv4Addr::new(r[0], r[1], r[2], r[3])
        })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn encode_name(name: &str, out: &mut Vec<u8>) {
        for label in name.split('.') {
            out.push(label.len() as u8);
            out.extend_from_slice(label.as_bytes());
        }
        out.push(0);
    }

    /// Response with one question and one answer pointing back at it.
    pub(crate) fn response(name: &str, rtype: u16, rdata: &[u8], ttl: u32) -> Vec<u8> {
        let mut msg = vec![0x12, 0x34, 0x81, 0x80, 0, 1, 0, 1, 0, 0, 0, 0];
        encode_name(name, &mut msg);
        msg.extend_from_slice(&rtype.to_be_bytes());
        msg.extend_from_slice(&QCLASS_IN.to_be_bytes());
        msg.extend_from_slice(&[0xC0, 0x0C]);
        msg.extend_from_slice(&rtype.to_be_bytes());
        msg.extend_from_slice(&QCLASS_IN.to_be_bytes());
        msg.extend_from_slice(&ttl.to_be_bytes());
        msg.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
        msg.extend_from_slice(rdata);
        msg
    }

    fn blocklist(names: &[&str]) -> Blocklist {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_compressed_answer() {
        let msg = response("Ads.Example.com", QTYPE_A, &[93, 184, 216, 34], 60);
        let r = parse_response(&msg).unwrap();
        assert_eq!(r.id, 0x1234);
        assert_eq!(r.questions[0].name, "ads.example.com");
        assert_eq!(r.answers[0].name, "ads.example.com");
        assert_eq!(r.answers[0].ttl, 60);
        assert_eq!(first_a_record(&msg), Some(Ipv4Addr::new(93, 184, 216, 34)));
    }

    #[test]
    fn test_blocked_a_rewritten_to_sinkhole() {
        let msg = response("ads.example.com", QTYPE_A, &[93, 184, 216, 34], 5);
        let list = blocklist(&["ads.example.com"]);
        let verdict = inspect_response(&msg, &list, &DnsConfig::default());
        let DnsVerdict::Rewrite(out) = verdict else {
            panic!("expected rewrite")
        };
        assert_eq!(out.len(), msg.len());
        assert_eq!(first_a_record(&out), Some(Ipv4Addr::LOCALHOST));
        assert_eq!(parse_response(&out).unwrap().answers[0].ttl, 3600);
    }

    #[test]
    fn test_blocked_aaaa_rewritten_to_loopback() {
        let addr = "2606:2800:220:1::1".parse::<Ipv6Addr>().unwrap();
        let msg = response("ads.example.com", QTYPE_AAAA, &addr.octets(), 86400);
        let DnsVerdict::Rewrite(out) =
            inspect_response(&msg, &blocklist(&["ads.example.com"]), &DnsConfig::default())
        else {
            panic!("expected rewrite")
        };
        let a = &parse_response(&out).unwrap().answers[0];
        assert_eq!(&out[a.rdata_offset..a.rdata_offset + 16], &Ipv6Addr::LOCALHOST.octets());
        assert_eq!(a.ttl, 3600);
    }

    #[test]
    fn test_drop_action() {
        let msg = response("ads.example.com", QTYPE_A, &[1, 2, 3, 4], 60);
        let config = DnsConfig {
            block_action: BlockAction::Drop,
            ..Default::default()
        };
        let list = blocklist(&["ads.example.com"]);
        assert_eq!(inspect_response(&msg, &list, &config), DnsVerdict::Drop);
    }

    #[test]
    fn test_unblocked_forwarded() {
        let msg = response("example.com", QTYPE_A, &[1, 2, 3, 4], 60);
        assert_eq!(
            inspect_response(&msg, &blocklist(&["ads.example.com"]), &DnsConfig::default()),
            DnsVerdict::Forward
        );
    }

    #[test]
    fn test_pointer_loop_is_forwarded() {
        let mut msg = vec![0x12, 0x34, 0x81, 0x80, 0, 1, 0, 0, 0, 0, 0, 0];
        msg.extend_from_slice(&[0xC0, 0x0C, 0, 1, 0, 1]);
        assert!(parse_name(&msg, 12).is_err());
        assert_eq!(
            inspect_response(&msg, &blocklist(&["x.com"]), &DnsConfig::default()),
            DnsVerdict::Forward
        );
    }

    #[test]
    fn test_query_is_not_a_response() {
        let mut msg = response("ads.example.com", QTYPE_A, &[1, 2, 3, 4], 60);
        msg[2] = 0x01;
        assert!(parse_response(&msg).is_err());
    }
}
