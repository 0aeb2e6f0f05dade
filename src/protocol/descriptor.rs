//! Protocol descriptors.
//!
//! A descriptor names a wire protocol the shared port can recognize. They are
//! `'static` constants: registered once, compared by identity of `name`.

use std::fmt;

/// Immutable description of a recognizable protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtocolDescriptor {
    /// Unique name, used in configuration and metrics labels.
    pub name: &'static str,
    /// Only reachable after TLS termination.
    pub requires_tls: bool,
    /// Carries concurrent exchanges over one connection (HTTP/2 style).
    pub multiplexed: bool,
    /// Name shared by plaintext and secure variants (ALPN-style).
    pub normalized_name: &'static str,
}

impl ProtocolDescriptor {
    const fn new(
        name: &'static str,
        normalized_name: &'static str,
        requires_tls: bool,
        multiplexed: bool,
    ) -> Self {
        Self {
            name,
            requires_tls,
            multiplexed,
            normalized_name,
        }
    }

    pub const HTTP1_1: Self = Self::new("http1_1", "http/1.1", false, false);
    pub const HTTPS1_1: Self = Self::new("https1_1", "http/1.1", true, false);
    pub const H2: Self = Self::new("h2", "h2", true, true);
    pub const H2C: Self = Self::new("h2c", "h2c", false, true);
    pub const H2C_PRIOR_KNOWLEDGE: Self = Self::new("h2c_prior_knowledge", "h2c", false, true);
    pub const NRPC: Self = Self::new("nrpc", "nrpc", false, true);
    pub const MQTT: Self = Self::new("mqtt", "mqtt", false, false);
    pub const MYSQL: Self = Self::new("mysql", "mysql", false, false);
    pub const DUBBO: Self = Self::new("dubbo", "dubbo", false, true);
    /// TLS record layer; never handed off, it wraps another protocol.
    pub const TLS: Self = Self::new("tls", "tls", false, false);
    /// HAProxy PROXY header; stripped before the real protocol is sniffed.
    pub const PROXY_PROTOCOL: Self = Self::new("proxy_protocol", "proxy", false, false);

    /// Every descriptor known to the server.
    pub const ALL: &'static [ProtocolDescriptor] = &[
        Self::HTTP1_1,
        Self::HTTPS1_1,
        Self::H2,
        Self::H2C,
        Self::H2C_PRIOR_KNOWLEDGE,
        Self::NRPC,
        Self::MQTT,
        Self::MYSQL,
        Self::DUBBO,
        Self::TLS,
        Self::PROXY_PROTOCOL,
    ];

    /// Look up a descriptor by its unique name.
    pub fn by_name(name: &str) -> Option<&'static ProtocolDescriptor> {
        Self::ALL.iter().find(|d| d.name == name)
    }

    /// The variant of this protocol when it was found inside a TLS session.
    pub fn secure_variant(&self) -> ProtocolDescriptor {
        match self.name {
            "http1_1" => Self::HTTPS1_1,
            "h2c" | "h2c_prior_knowledge" => Self::H2,
            _ => *self,
        }
    }

    /// HTTP/1.x or HTTP/2 in any variant.
    pub fn is_http(&self) -> bool {
        matches!(self.normalized_name, "http/1.1" | "h2" | "h2c")
    }

    /// Protocols that wrap another protocol rather than carry application data.
    pub fn is_envelope(&self) -> bool {
        *self == Self::TLS || *self == Self::PROXY_PROTOCOL
    }
}

impl fmt::Display for ProtocolDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_unique() {
        for (i, a) in ProtocolDescriptor::ALL.iter().enumerate() {
            for b in &ProtocolDescriptor::ALL[i + 1..] {
                assert_ne!(a.name, b.name);
            }
        }
    }

    #[test]
    fn secure_variants() {
        assert_eq!(ProtocolDescriptor::HTTP1_1.secure_variant(), ProtocolDescriptor::HTTPS1_1);
        assert_eq!(ProtocolDescriptor::H2C_PRIOR_KNOWLEDGE.secure_variant(), ProtocolDescriptor::H2);
        assert_eq!(ProtocolDescriptor::NRPC.secure_variant(), ProtocolDescriptor::NRPC);
        assert!(ProtocolDescriptor::H2.requires_tls);
        assert!(ProtocolDescriptor::H2.is_http());
        assert!(!ProtocolDescriptor::MQTT.is_http());
    }

    #[test]
    fn lookup_by_name() {
        assert_eq!(ProtocolDescriptor::by_name("mysql"), Some(&ProtocolDescriptor::MYSQL));
        assert_eq!(ProtocolDescriptor::by_name("gopher"), None);
    }
}
