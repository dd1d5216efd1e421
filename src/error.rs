//! Probe error taxonomy.
//!
//! Engines surface every failure as one of these categories; the dispatcher
//! decides which ones become HTTP 4xx (validation only) and which travel
//! inside a `success=false` result. Stack traces are never serialized.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProbeError {
    /// Malformed target, unknown variant, out-of-range numeric. No engine
    /// work is attempted.
    #[error("validation error: {0}")]
    Validation(String),

    /// DNS lookup failed for the target host.
    #[error("resolution error: {0}")]
    Resolution(String),

    /// Connect/read/write/handshake failure.
    #[error("network error: {0}")]
    Network(String),

    /// The transport worked but the protocol exchange did not (bad HTTP
    /// status, TLS verification failure, SSH timeout).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Subprocess exited nonzero and produced nothing parseable.
    #[error("tool error: {0}")]
    Tool(String),

    /// Reserved variants (http3, dtls). Never retried.
    #[error("{0}")]
    Unsupported(String),

    /// Caller-driven cancellation. Not logged as an error.
    #[error("probe cancelled")]
    Cancelled,
}

impl ProbeError {
    /// Stable machine-readable code for the envelope.
    pub fn code(&self) -> &'static str {
        match self {
            ProbeError::Validation(_) => "validation",
            ProbeError::Resolution(_) => "resolution",
            ProbeError::Network(_) => "network",
            ProbeError::Protocol(_) => "protocol",
            ProbeError::Tool(_) => "tool",
            ProbeError::Unsupported(_) => "unsupported",
            ProbeError::Cancelled => "cancelled",
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, ProbeError::Validation(_))
    }

    pub fn unsupported_http3() -> Self {
        ProbeError::Unsupported("HTTP/3 is not supported yet".into())
    }

    pub fn unsupported_dtls() -> Self {
        ProbeError::Unsupported("DTLS probing is not supported".into())
    }
}

impl From<std::io::Error> for ProbeError {
    fn from(e: std::io::Error) -> Self {
        ProbeError::Network(e.to_string())
    }
}

impl From<crate::runner::RunError> for ProbeError {
    fn from(e: crate::runner::RunError) -> Self {
        use crate::runner::RunError;
        match e {
            RunError::Cancelled => ProbeError::Cancelled,
            other => ProbeError::Tool(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_messages_are_stable() {
        assert_eq!(
            ProbeError::unsupported_http3().to_string(),
            "HTTP/3 is not supported yet"
        );
        assert_eq!(
            ProbeError::unsupported_dtls().to_string(),
            "DTLS probing is not supported"
        );
    }

    #[test]
    fn io_errors_map_to_network() {
        let e: ProbeError = std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out").into();
        assert_eq!(e.code(), "network");
    }
}
