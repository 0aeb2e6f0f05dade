//! Protocol recognition rules.
//!
//! # Responsibilities
//! - Answer "does this prefix belong to protocol P?" for each known protocol
//! - Combine the answers of all rules into one verdict in priority order
//!
//! # Design Decisions
//! - Rules are pure byte comparisons, never parsers; routing only
//! - A match only counts once every higher-priority rule has ruled itself out,
//!   so the verdict does not depend on how the bytes were chunked
//! - At the byte ceiling, "need more" collapses to "no match"

use std::fmt;

use crate::protocol::descriptor::ProtocolDescriptor;

/// Answer of a single rule for the bytes seen so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recognition {
    Match,
    NoMatch,
    NeedMoreBytes,
}

/// Combined answer of a [`RecognizerSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Matched(ProtocolDescriptor),
    NeedMoreBytes,
    NoMatch,
}

/// A side-effect-free matcher for one protocol.
pub trait RecognitionRule: Send + Sync + fmt::Debug {
    /// Protocol this rule recognizes.
    fn descriptor(&self) -> ProtocolDescriptor;

    /// Inspect the leading bytes of a connection.
    fn recognize(&self, prefix: &[u8]) -> Recognition;
}

/// Compare `prefix` against a constant header.
pub fn literal(prefix: &[u8], token: &[u8]) -> Recognition {
    if prefix.len() >= token.len() {
        if prefix.starts_with(token) {
            Recognition::Match
        } else {
            Recognition::NoMatch
        }
    } else if token.starts_with(prefix) {
        Recognition::NeedMoreBytes
    } else {
        Recognition::NoMatch
    }
}

/// Best of several alternatives: any match wins, then any "need more".
fn any_of(results: impl IntoIterator<Item = Recognition>) -> Recognition {
    let mut outcome = Recognition::NoMatch;
    for result in results {
        match result {
            Recognition::Match => return Recognition::Match,
            Recognition::NeedMoreBytes => outcome = Recognition::NeedMoreBytes,
            Recognition::NoMatch => {}
        }
    }
    outcome
}

/// TLS record header: handshake content type, SSL 3.0 / TLS 1.x version.
#[derive(Debug, Default)]
pub struct TlsRule;

impl RecognitionRule for TlsRule {
    fn descriptor(&self) -> ProtocolDescriptor {
        ProtocolDescriptor::TLS
    }

    fn recognize(&self, prefix: &[u8]) -> Recognition {
        match prefix {
            [] => Recognition::NeedMoreBytes,
            [0x16] | [0x16, 0x03] => Recognition::NeedMoreBytes,
            [0x16, 0x03, minor, ..] if *minor <= 0x04 => Recognition::Match,
            _ => Recognition::NoMatch,
        }
    }
}

/// HAProxy PROXY protocol, text (v1) and binary (v2) signatures.
#[derive(Debug, Default)]
pub struct ProxyProtocolRule;

pub const PROXY_V1_SIGNATURE: &[u8] = b"PROXY ";
pub const PROXY_V2_SIGNATURE: &[u8] = b"\r\n\r\n\x00\r\nQUIT\n";

impl RecognitionRule for ProxyProtocolRule {
    fn descriptor(&self) -> ProtocolDescriptor {
        ProtocolDescriptor::PROXY_PROTOCOL
    }

    fn recognize(&self, prefix: &[u8]) -> Recognition {
        any_of([
            literal(prefix, PROXY_V1_SIGNATURE),
            literal(prefix, PROXY_V2_SIGNATURE),
        ])
    }
}

/// Client connection preface of HTTP/2 with prior knowledge.
pub const HTTP2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

#[derive(Debug, Default)]
pub struct Http2PrefaceRule;

impl RecognitionRule for Http2PrefaceRule {
    fn descriptor(&self) -> ProtocolDescriptor {
        ProtocolDescriptor::H2C_PRIOR_KNOWLEDGE
    }

    fn recognize(&self, prefix: &[u8]) -> Recognition {
        literal(prefix, HTTP2_PREFACE)
    }
}

/// HTTP/1.x request line.
#[derive(Debug)]
pub struct Http1Rule {
    max_header_len: usize,
}

const HTTP1_METHODS: &[&[u8]] = &[
    b"GET ",
    b"POST ",
    b"PUT ",
    b"DELETE ",
    b"OPTIONS ",
    b"PATCH ",
    b"HEAD ",
    b"TRACE ",
    b"CONNECT ",
];

/// Longest method token accepted before the request-line fallback gives up.
const MAX_METHOD_LEN: usize = 16;

impl Http1Rule {
    pub fn new(max_header_len: usize) -> Self {
        Self { max_header_len }
    }

    /// Request line terminated within the header limit and ending in `HTTP/1.x`.
    fn request_line(&self, prefix: &[u8]) -> Recognition {
        let token_len = prefix
            .iter()
            .take_while(|b| b.is_ascii_uppercase())
            .count();
        if token_len > MAX_METHOD_LEN {
            return Recognition::NoMatch;
        }
        if token_len == prefix.len() {
            return Recognition::NeedMoreBytes;
        }
        if token_len == 0 || prefix[token_len] != b' ' {
            return Recognition::NoMatch;
        }

        let window = &prefix[..prefix.len().min(self.max_header_len)];
        match window.iter().position(|&b| b == b'\n') {
            Some(lf) => {
                let line = &window[..lf];
                let line = line.strip_suffix(b"\r").unwrap_or(line);
                let version_ok = line.len() >= 8 && line[line.len() - 8..].starts_with(b"HTTP/1.");
                if version_ok {
                    Recognition::Match
                } else {
                    Recognition::NoMatch
                }
            }
            None if prefix.len() < self.max_header_len => Recognition::NeedMoreBytes,
            None => Recognition::NoMatch,
        }
    }
}

impl RecognitionRule for Http1Rule {
    fn descriptor(&self) -> ProtocolDescriptor {
        ProtocolDescriptor::HTTP1_1
    }

    fn recognize(&self, prefix: &[u8]) -> Recognition {
        let by_method = any_of(HTTP1_METHODS.iter().map(|m| literal(prefix, m)));
        match by_method {
            Recognition::Match => Recognition::Match,
            _ => any_of([by_method, self.request_line(prefix)]),
        }
    }
}

/// NRPC frame magic.
#[derive(Debug)]
pub struct NrpcRule {
    magic: [u8; 4],
}

impl NrpcRule {
    pub fn new(magic: [u8; 4]) -> Self {
        Self { magic }
    }
}

impl RecognitionRule for NrpcRule {
    fn descriptor(&self) -> ProtocolDescriptor {
        ProtocolDescriptor::NRPC
    }

    fn recognize(&self, prefix: &[u8]) -> Recognition {
        literal(prefix, &self.magic)
    }
}

/// MQTT CONNECT packet: type byte, remaining length, protocol name.
#[derive(Debug, Default)]
pub struct MqttRule;

const MQTT_CONNECT: u8 = 0x10;
const MQTT_V311_NAME: &[u8] = b"\x00\x04MQTT";
const MQTT_V31_NAME: &[u8] = b"\x00\x06MQIsdp";

impl RecognitionRule for MqttRule {
    fn descriptor(&self) -> ProtocolDescriptor {
        ProtocolDescriptor::MQTT
    }

    fn recognize(&self, prefix: &[u8]) -> Recognition {
        match prefix.first() {
            None => return Recognition::NeedMoreBytes,
            Some(&MQTT_CONNECT) => {}
            Some(_) => return Recognition::NoMatch,
        }

        // Remaining length is a 1-4 byte varint.
        let mut idx = 1;
        for i in 0..4 {
            let Some(&b) = prefix.get(idx) else {
                return Recognition::NeedMoreBytes;
            };
            idx += 1;
            if b & 0x80 == 0 {
                break;
            }
            if i == 3 {
                return Recognition::NoMatch;
            }
        }

        let rest = &prefix[idx..];
        any_of([literal(rest, MQTT_V311_NAME), literal(rest, MQTT_V31_NAME)])
    }
}

/// Dubbo frame magic.
#[derive(Debug, Default)]
pub struct DubboRule;

impl RecognitionRule for DubboRule {
    fn descriptor(&self) -> ProtocolDescriptor {
        ProtocolDescriptor::DUBBO
    }

    fn recognize(&self, prefix: &[u8]) -> Recognition {
        literal(prefix, &[0xda, 0xbb])
    }
}

/// Options for [`RecognizerSet::standard`].
#[derive(Debug, Clone)]
pub struct RecognizerOptions {
    pub nrpc_magic: [u8; 4],
    pub accept_proxy_protocol: bool,
    pub max_prefix_len: usize,
}

impl Default for RecognizerOptions {
    fn default() -> Self {
        Self {
            nrpc_magic: *b"NRPC",
            accept_proxy_protocol: false,
            max_prefix_len: 8 * 1024,
        }
    }
}

/// Ordered collection of rules; earlier rules take priority.
#[derive(Debug)]
pub struct RecognizerSet {
    rules: Vec<Box<dyn RecognitionRule>>,
    max_prefix_len: usize,
}

impl RecognizerSet {
    /// Create an empty set with the given byte ceiling.
    pub fn new(max_prefix_len: usize) -> Self {
        Self {
            rules: Vec::new(),
            max_prefix_len,
        }
    }

    /// The rule table used by the server.
    pub fn standard(options: &RecognizerOptions) -> Self {
        let mut set = Self::new(options.max_prefix_len);
        set.push(TlsRule);
        if options.accept_proxy_protocol {
            set.push(ProxyProtocolRule);
        }
        set.push(Http2PrefaceRule);
        set.push(Http1Rule::new(options.max_prefix_len));
        set.push(NrpcRule::new(options.nrpc_magic));
        set.push(MqttRule);
        set.push(DubboRule);
        set
    }

    /// Append a rule with lower priority than all existing ones.
    pub fn push(&mut self, rule: impl RecognitionRule + 'static) {
        self.rules.push(Box::new(rule));
    }

    /// Byte count at which undetermined prefixes are rejected.
    pub fn max_prefix_len(&self) -> usize {
        self.max_prefix_len
    }

    /// Protocols this set can report, in priority order.
    pub fn descriptors(&self) -> Vec<ProtocolDescriptor> {
        self.rules.iter().map(|r| r.descriptor()).collect()
    }

    /// Classify the leading bytes of a connection.
    pub fn classify(&self, prefix: &[u8]) -> Verdict {
        let at_ceiling = prefix.len() >= self.max_prefix_len;
        let mut undecided = false;

        for rule in &self.rules {
            match rule.recognize(prefix) {
                Recognition::Match if !undecided => return Verdict::Matched(rule.descriptor()),
                Recognition::Match => return Verdict::NeedMoreBytes,
                Recognition::NeedMoreBytes if !at_ceiling => undecided = true,
                Recognition::NeedMoreBytes | Recognition::NoMatch => {}
            }
        }

        if undecided {
            Verdict::NeedMoreBytes
        } else {
            Verdict::NoMatch
        }
    }
}
