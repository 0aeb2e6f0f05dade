//! HAProxy PROXY protocol header parsing (v1 text, v2 binary).
//!
//! Only the header is consumed; what follows is sniffed again as if it were
//! the start of the connection.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::protocol::recognizer::{PROXY_V1_SIGNATURE, PROXY_V2_SIGNATURE};

/// Longest legal v1 header including CRLF.
const V1_MAX_LEN: usize = 107;
const V2_HEADER_LEN: usize = 16;

/// A fully parsed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyHeader {
    /// Bytes occupied by the header at the start of the buffer.
    pub consumed: usize,
    /// Original client address, absent for LOCAL/UNKNOWN connections.
    pub source: Option<SocketAddr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyParse {
    Incomplete,
    Invalid(&'static str),
    Complete(ProxyHeader),
}

/// Parse a PROXY header at the start of `buf`.
pub fn parse(buf: &[u8]) -> ProxyParse {
    if buf.starts_with(PROXY_V1_SIGNATURE) {
        parse_v1(buf)
    } else if buf.starts_with(PROXY_V2_SIGNATURE) {
        parse_v2(buf)
    } else if PROXY_V1_SIGNATURE.starts_with(buf) || PROXY_V2_SIGNATURE.starts_with(buf) {
        ProxyParse::Incomplete
    } else {
        ProxyParse::Invalid("missing signature")
    }
}

/// Total size a header will occupy, once its fixed part has arrived.
///
/// Known up front only for v2, whose fixed part carries the address length.
pub fn declared_len(buf: &[u8]) -> Option<usize> {
    if !buf.starts_with(PROXY_V2_SIGNATURE) || buf.len() < V2_HEADER_LEN {
        return None;
    }
    Some(V2_HEADER_LEN + u16::from_be_bytes([buf[14], buf[15]]) as usize)
}

fn parse_v1(buf: &[u8]) -> ProxyParse {
    let window = &buf[..buf.len().min(V1_MAX_LEN)];
    let Some(end) = window.windows(2).position(|w| w == b"\r\n") else {
        return if buf.len() < V1_MAX_LEN {
            ProxyParse::Incomplete
        } else {
            ProxyParse::Invalid("v1 header too long")
        };
    };

    let Ok(line) = std::str::from_utf8(&buf[..end]) else {
        return ProxyParse::Invalid("v1 header is not ASCII");
    };
    let parts: Vec<&str> = line.split(' ').collect();
    let consumed = end + 2;

    match parts.get(1).copied() {
        Some("UNKNOWN") => ProxyParse::Complete(ProxyHeader {
            consumed,
            source: None,
        }),
        Some("TCP4") | Some("TCP6") if parts.len() == 6 => {
            let ip = parts[2].parse::<IpAddr>();
            let port = parts[4].parse::<u16>();
            match (ip, port) {
                (Ok(ip), Ok(port)) => ProxyParse::Complete(ProxyHeader {
                    consumed,
                    source: Some(SocketAddr::new(ip, port)),
                }),
                _ => ProxyParse::Invalid("v1 malformed address"),
            }
        }
        _ => ProxyParse::Invalid("v1 unsupported family"),
    }
}

fn parse_v2(buf: &[u8]) -> ProxyParse {
    if buf.len() < V2_HEADER_LEN {
        return ProxyParse::Incomplete;
    }
    let version_command = buf[12];
    if version_command >> 4 != 2 {
        return ProxyParse::Invalid("v2 bad version");
    }
    let family = buf[13];
    let consumed = declared_len(buf).unwrap_or(V2_HEADER_LEN);
    if buf.len() < consumed {
        return ProxyParse::Incomplete;
    }
    let addrs = &buf[V2_HEADER_LEN..consumed];

    let source = match (version_command & 0x0f, family) {
        // LOCAL: health checks from the proxy itself.
        (0x0, _) => None,
        (0x1, 0x11) if addrs.len() >= 12 => {
            let ip = Ipv4Addr::new(addrs[0], addrs[1], addrs[2], addrs[3]);
            let port = u16::from_be_bytes([addrs[8], addrs[9]]);
            Some(SocketAddr::new(IpAddr::V4(ip), port))
        }
        (0x1, 0x21) if addrs.len() >= 36 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&addrs[..16]);
            let port = u16::from_be_bytes([addrs[32], addrs[33]]);
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        (0x1, _) => None,
        _ => return ProxyParse::Invalid("v2 unsupported command"),
    };

    ProxyParse::Complete(ProxyHeader { consumed, source })
}
