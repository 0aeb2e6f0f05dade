//! Per-connection sniffing state machine.
//!
//! # States
//! ```text
//! Accumulating → Matched → (handed off by the dispatcher)
//! Accumulating → Rejected → (connection closed)
//! ```
//!
//! The sniffer owns the accumulation buffer. It is synchronous so the state
//! machine can be driven by tests byte by byte; the dispatcher feeds it
//! from the socket.

use std::net::SocketAddr;

use bytes::{Buf, BytesMut};

use crate::protocol::descriptor::ProtocolDescriptor;
use crate::protocol::proxy_header::{self, ProxyParse};
use crate::protocol::recognizer::{RecognizerSet, Verdict};

/// Why a connection was refused before any protocol was selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// No rule matched the prefix.
    Unrecognized,
    /// The byte ceiling was reached while rules still wanted more.
    Overflow,
    /// A PROXY header was present but malformed or repeated.
    InvalidProxyHeader(&'static str),
}

impl RejectReason {
    /// Metric label.
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::Unrecognized => "unrecognized",
            RejectReason::Overflow => "overflow",
            RejectReason::InvalidProxyHeader(_) => "invalid_proxy_header",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::InvalidProxyHeader(detail) => write!(f, "invalid proxy header: {}", detail),
            other => f.write_str(other.as_str()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SniffState {
    Accumulating,
    Matched(ProtocolDescriptor),
    Rejected(RejectReason),
}

/// Classifies one connection from the bytes fed to it.
#[derive(Debug)]
pub struct Sniffer<'a> {
    recognizers: &'a RecognizerSet,
    buffer: BytesMut,
    state: SniffState,
    proxy_source: Option<SocketAddr>,
    proxy_seen: bool,
}

impl<'a> Sniffer<'a> {
    pub fn new(recognizers: &'a RecognizerSet) -> Self {
        Self {
            recognizers,
            buffer: BytesMut::with_capacity(1024),
            state: SniffState::Accumulating,
            proxy_source: None,
            proxy_seen: false,
        }
    }

    pub fn state(&self) -> SniffState {
        self.state
    }

    /// Bytes held for replay.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Client address announced by a PROXY header, if one was stripped.
    pub fn proxy_source(&self) -> Option<SocketAddr> {
        self.proxy_source
    }

    /// Append freshly read bytes and re-run classification.
    ///
    /// Once the state leaves `Accumulating`, further input is ignored.
    pub fn feed(&mut self, bytes: &[u8]) -> SniffState {
        if self.state != SniffState::Accumulating {
            return self.state;
        }
        self.buffer.extend_from_slice(bytes);
        self.state = self.evaluate();
        self.state
    }

    fn evaluate(&mut self) -> SniffState {
        loop {
            match self.recognizers.classify(&self.buffer) {
                Verdict::Matched(protocol) if protocol == ProtocolDescriptor::PROXY_PROTOCOL => {
                    if self.proxy_seen {
                        return SniffState::Rejected(RejectReason::InvalidProxyHeader("repeated header"));
                    }
                    match proxy_header::parse(&self.buffer) {
                        ProxyParse::Incomplete => return self.await_proxy_header(),
                        ProxyParse::Invalid(detail) => {
                            return SniffState::Rejected(RejectReason::InvalidProxyHeader(detail))
                        }
                        ProxyParse::Complete(header) => {
                            self.buffer.advance(header.consumed);
                            self.proxy_source = header.source;
                            self.proxy_seen = true;
                        }
                    }
                }
                Verdict::Matched(protocol) => return SniffState::Matched(protocol),
                Verdict::NeedMoreBytes => return SniffState::Accumulating,
                Verdict::NoMatch if self.buffer.len() >= self.recognizers.max_prefix_len() => {
                    return SniffState::Rejected(RejectReason::Overflow)
                }
                Verdict::NoMatch => return SniffState::Rejected(RejectReason::Unrecognized),
            }
        }
    }

    /// Keep reading a partial PROXY header only while it can fit under the ceiling.
    fn await_proxy_header(&self) -> SniffState {
        let ceiling = self.recognizers.max_prefix_len();
        let too_long = proxy_header::declared_len(&self.buffer).is_some_and(|len| len > ceiling);
        if too_long || self.buffer.len() >= ceiling {
            SniffState::Rejected(RejectReason::Overflow)
        } else {
            SniffState::Accumulating
        }
    }

    /// Give up the buffered bytes so they can be replayed into a handler.
    pub fn into_buffer(self) -> BytesMut {
        self.buffer
    }
}
