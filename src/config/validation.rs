//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, thread counts, addresses parse)
//! - Check that forwards and the server-first protocol name known protocols
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;
use thiserror::Error;

use crate::config::schema::ServerConfig;
use crate::protocol::descriptor::ProtocolDescriptor;

/// A single semantic problem in a configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field}: invalid socket address '{value}'")]
    InvalidAddress { field: &'static str, value: String },

    #[error("{field}: must be greater than zero")]
    Zero { field: &'static str },

    #[error("{field}: {value} is out of range {min}..={max}")]
    OutOfRange {
        field: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },

    #[error("{field}: magic must be exactly 4 bytes, got '{value}'")]
    BadMagic { field: &'static str, value: String },

    #[error("{field}: unknown protocol '{value}'")]
    UnknownProtocol { field: &'static str, value: String },
}

/// Validate a configuration, collecting every problem found.
pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    check_address(&mut errors, "listener.bind_address", &config.listener.bind_address);
    check_nonzero(&mut errors, "listener.max_connections", config.listener.max_connections as u64);

    // Below 24 bytes the HTTP/2 preface could never be recognized.
    if config.dispatch.max_sniff_bytes < 24 {
        errors.push(ValidationError::OutOfRange {
            field: "dispatch.max_sniff_bytes",
            value: config.dispatch.max_sniff_bytes as i64,
            min: 24,
            max: i64::MAX,
        });
    }
    check_nonzero(&mut errors, "dispatch.first_packet_timeout_ms", config.dispatch.first_packet_timeout_ms);
    if let Some(name) = &config.dispatch.server_first_protocol {
        check_protocol(&mut errors, "dispatch.server_first_protocol", name);
    }

    check_nonzero(&mut errors, "http.request_timeout_secs", config.http.request_timeout_secs);

    let server = &config.nrpc.server;
    check_magic(&mut errors, "nrpc.server.magic", &server.magic);
    check_nonzero(&mut errors, "nrpc.server.message_max_length", server.message_max_length as u64);

    let client = &config.nrpc.client;
    check_magic(&mut errors, "nrpc.client.magic", &client.magic);
    check_nonzero(&mut errors, "nrpc.client.io_threads", client.io_threads as u64);
    if !(1..=100).contains(&client.io_ratio) {
        errors.push(ValidationError::OutOfRange {
            field: "nrpc.client.io_ratio",
            value: client.io_ratio as i64,
            min: 1,
            max: 100,
        });
    }
    check_nonzero(&mut errors, "nrpc.client.connect_timeout_ms", client.connect_timeout_ms);
    check_nonzero(&mut errors, "nrpc.client.heartbeat_interval_ms", client.heartbeat_interval_ms);
    check_nonzero(&mut errors, "nrpc.client.missed_heartbeats", client.missed_heartbeats as u64);
    check_nonzero(&mut errors, "nrpc.client.reconnect_interval_ms", client.reconnect_interval_ms);
    check_nonzero(&mut errors, "nrpc.client.message_max_length", client.message_max_length as u64);
    if client.default_timeout_ms < -1 {
        errors.push(ValidationError::OutOfRange {
            field: "nrpc.client.default_timeout_ms",
            value: client.default_timeout_ms,
            min: -1,
            max: i64::MAX,
        });
    }
    if !(0.0..=1.0).contains(&client.reconnect_jitter) {
        errors.push(ValidationError::OutOfRange {
            field: "nrpc.client.reconnect_jitter",
            value: (client.reconnect_jitter * 100.0) as i64,
            min: 0,
            max: 100,
        });
    }
    for address in &client.addresses {
        check_address(&mut errors, "nrpc.client.addresses", address);
    }

    for forward in &config.forwards {
        check_protocol(&mut errors, "forwards.protocol", &forward.protocol);
        check_address(&mut errors, "forwards.backend", &forward.backend);
    }

    if config.observability.metrics_enabled {
        check_address(&mut errors, "observability.metrics_address", &config.observability.metrics_address);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_address(errors: &mut Vec<ValidationError>, field: &'static str, value: &str) {
    if value.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidAddress {
            field,
            value: value.to_string(),
        });
    }
}

fn check_nonzero(errors: &mut Vec<ValidationError>, field: &'static str, value: u64) {
    if value == 0 {
        errors.push(ValidationError::Zero { field });
    }
}

fn check_magic(errors: &mut Vec<ValidationError>, field: &'static str, value: &str) {
    if value.len() != 4 {
        errors.push(ValidationError::BadMagic {
            field,
            value: value.to_string(),
        });
    }
}

fn check_protocol(errors: &mut Vec<ValidationError>, field: &'static str, value: &str) {
    if ProtocolDescriptor::by_name(value).is_none() {
        errors.push(ValidationError::UnknownProtocol {
            field,
            value: value.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::ForwardConfig;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(validate_config(&ServerConfig::default()), Ok(()));
    }

    #[test]
    fn collects_every_error() {
        let mut config = ServerConfig::default();
        config.listener.bind_address = "not-an-address".into();
        config.nrpc.client.io_threads = 0;
        config.nrpc.client.magic = "TOOLONG".into();
        config.forwards.push(ForwardConfig {
            protocol: "gopher".into(),
            backend: "127.0.0.1:70".into(),
            connect_timeout_ms: 100,
        });

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 4);
        assert!(errors.contains(&ValidationError::Zero {
            field: "nrpc.client.io_threads"
        }));
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::UnknownProtocol { value, .. } if value == "gopher")));
    }
}
