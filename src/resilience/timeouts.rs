//! Call timeout resolution.
//!
//! # Design Decisions
//! - Timeouts are configured in milliseconds as signed integers:
//!   `-1` never times out, `0` defers to the remote side, `n > 0` is a deadline
//! - Client: per-call override, else method, else interface, else client default
//! - Server: the method's own value, where `0` adopts the client's timeout

use std::time::Duration;

/// Effective client-side deadline policy for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTimeout {
    /// Wait for the response indefinitely.
    Never,
    /// No local deadline; the server applies its own policy.
    Remote,
    After(Duration),
}

impl CallTimeout {
    pub fn from_millis(ms: i64) -> Self {
        match ms {
            0 => CallTimeout::Remote,
            n if n < 0 => CallTimeout::Never,
            n => CallTimeout::After(Duration::from_millis(n as u64)),
        }
    }

    /// First configured value wins.
    pub fn resolve(per_call: Option<i64>, method: Option<i64>, interface: Option<i64>, client_default: i64) -> Self {
        Self::from_millis(per_call.or(method).or(interface).unwrap_or(client_default))
    }

    /// Local deadline to enforce, if any.
    pub fn duration(&self) -> Option<Duration> {
        match self {
            CallTimeout::After(d) => Some(*d),
            CallTimeout::Never | CallTimeout::Remote => None,
        }
    }

    /// Value sent to the server so it can apply the "use the client's timeout" policy.
    pub fn as_wire_millis(&self) -> i64 {
        match self {
            CallTimeout::Never => -1,
            CallTimeout::Remote => 0,
            CallTimeout::After(d) => d.as_millis().min(i64::MAX as u128) as i64,
        }
    }
}

/// Server-side execution deadline for a method.
///
/// `method_ms` is the method's configured timeout (`None` behaves as `0`);
/// `client_ms` is the timeout the client announced for the call.
pub fn server_deadline(method_ms: Option<i64>, client_ms: i64) -> Option<Duration> {
    match method_ms.unwrap_or(0) {
        n if n < 0 => None,
        0 if client_ms > 0 => Some(Duration::from_millis(client_ms as u64)),
        0 => None,
        n => Some(Duration::from_millis(n as u64)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_order() {
        assert_eq!(CallTimeout::resolve(Some(50), Some(10), Some(5), 1000), CallTimeout::After(Duration::from_millis(50)));
        assert_eq!(CallTimeout::resolve(None, Some(10), Some(5), 1000), CallTimeout::After(Duration::from_millis(10)));
        assert_eq!(CallTimeout::resolve(None, None, Some(5), 1000), CallTimeout::After(Duration::from_millis(5)));
        assert_eq!(CallTimeout::resolve(None, None, None, 1000), CallTimeout::After(Duration::from_secs(1)));
    }

    #[test]
    fn special_values() {
        assert_eq!(CallTimeout::from_millis(-1), CallTimeout::Never);
        assert_eq!(CallTimeout::from_millis(0), CallTimeout::Remote);
        assert_eq!(CallTimeout::Never.duration(), None);
        assert_eq!(CallTimeout::Remote.duration(), None);
        assert_eq!(CallTimeout::Remote.as_wire_millis(), 0);
        assert_eq!(CallTimeout::from_millis(250).as_wire_millis(), 250);
    }

    #[test]
    fn server_policy() {
        assert_eq!(server_deadline(Some(-1), 500), None);
        assert_eq!(server_deadline(Some(0), 500), Some(Duration::from_millis(500)));
        assert_eq!(server_deadline(None, 0), None);
        assert_eq!(server_deadline(Some(200), 500), Some(Duration::from_millis(200)));
    }
}
