//! Protocol families and variants.
//!
//! Human labels arrive in many spellings ("HTTP/2", "Raw TCP", "icmp-trace");
//! a single normalization routine maps them all onto canonical tokens so the
//! engines never do ad-hoc string comparisons.

use crate::error::ProbeError;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolFamily {
    Http,
    Tcp,
    Udp,
    Icmp,
    Trace,
}

impl ProtocolFamily {
    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolFamily::Http => "http",
            ProtocolFamily::Tcp => "tcp",
            ProtocolFamily::Udp => "udp",
            ProtocolFamily::Icmp => "icmp",
            ProtocolFamily::Trace => "trace",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ProbeError> {
        match normalize_token(s).as_str() {
            "http" | "https" => Ok(ProtocolFamily::Http),
            "tcp" => Ok(ProtocolFamily::Tcp),
            "udp" => Ok(ProtocolFamily::Udp),
            "icmp" => Ok(ProtocolFamily::Icmp),
            "trace" | "traceroute" => Ok(ProtocolFamily::Trace),
            other => Err(ProbeError::Validation(format!(
                "unknown protocol family: {other:?}"
            ))),
        }
    }
}

impl fmt::Display for ProtocolFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A variant is always interpreted in the context of its family, since the
/// bare token "raw" is legal for both TCP and UDP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolVariant {
    Http1,
    Http2,
    /// Reserved; always fails fast.
    Http3,
    TcpRaw,
    TcpTls,
    Ssh,
    UdpRaw,
    Dns,
    /// Reserved; always fails fast.
    Dtls,
    Ping,
    IcmpTraceroute,
    HttpTrace,
    TcpTrace,
    UdpTrace,
    IcmpTrace,
}

impl ProtocolVariant {
    pub fn family(self) -> ProtocolFamily {
        match self {
            ProtocolVariant::Http1 | ProtocolVariant::Http2 | ProtocolVariant::Http3 => {
                ProtocolFamily::Http
            }
            ProtocolVariant::TcpRaw | ProtocolVariant::TcpTls | ProtocolVariant::Ssh => {
                ProtocolFamily::Tcp
            }
            ProtocolVariant::UdpRaw | ProtocolVariant::Dns | ProtocolVariant::Dtls => {
                ProtocolFamily::Udp
            }
            ProtocolVariant::Ping | ProtocolVariant::IcmpTraceroute => ProtocolFamily::Icmp,
            ProtocolVariant::HttpTrace
            | ProtocolVariant::TcpTrace
            | ProtocolVariant::UdpTrace
            | ProtocolVariant::IcmpTrace => ProtocolFamily::Trace,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolVariant::Http1 => "http1",
            ProtocolVariant::Http2 => "http2",
            ProtocolVariant::Http3 => "http3",
            ProtocolVariant::TcpRaw => "raw",
            ProtocolVariant::TcpTls => "tls",
            ProtocolVariant::Ssh => "ssh",
            ProtocolVariant::UdpRaw => "raw",
            ProtocolVariant::Dns => "dns",
            ProtocolVariant::Dtls => "dtls",
            ProtocolVariant::Ping => "ping",
            ProtocolVariant::IcmpTraceroute => "traceroute",
            ProtocolVariant::HttpTrace => "http_trace",
            ProtocolVariant::TcpTrace => "tcp_trace",
            ProtocolVariant::UdpTrace => "udp_trace",
            ProtocolVariant::IcmpTrace => "icmp_trace",
        }
    }

    /// Default variant when the request leaves the field empty.
    pub fn default_for(family: ProtocolFamily) -> Self {
        match family {
            ProtocolFamily::Http => ProtocolVariant::Http2,
            ProtocolFamily::Tcp => ProtocolVariant::TcpRaw,
            ProtocolFamily::Udp => ProtocolVariant::UdpRaw,
            ProtocolFamily::Icmp => ProtocolVariant::Ping,
            ProtocolFamily::Trace => ProtocolVariant::IcmpTrace,
        }
    }

    /// Parse a human label within a family. Case-insensitive, tolerant of
    /// whitespace and `-`/`_`/`/`/`.` separators.
    pub fn parse(family: ProtocolFamily, label: &str) -> Result<Self, ProbeError> {
        let token = normalize_token(label);
        if token.is_empty() {
            return Ok(Self::default_for(family));
        }
        let variant = match family {
            ProtocolFamily::Http => match token.as_str() {
                "http1" | "http11" | "http10" => Some(ProtocolVariant::Http1),
                "http2" | "http20" | "h2" => Some(ProtocolVariant::Http2),
                "http3" | "h3" | "quic" => Some(ProtocolVariant::Http3),
                _ => None,
            },
            ProtocolFamily::Tcp => match token.as_str() {
                "raw" | "rawtcp" | "tcpraw" | "tcp" => Some(ProtocolVariant::TcpRaw),
                "tls" | "ssl" | "tcptls" => Some(ProtocolVariant::TcpTls),
                "ssh" => Some(ProtocolVariant::Ssh),
                _ => None,
            },
            ProtocolFamily::Udp => match token.as_str() {
                "raw" | "rawudp" | "udpraw" | "udp" => Some(ProtocolVariant::UdpRaw),
                "dns" => Some(ProtocolVariant::Dns),
                "tls" | "dtls" => Some(ProtocolVariant::Dtls),
                _ => None,
            },
            ProtocolFamily::Icmp => match token.as_str() {
                "ping" | "icmp" | "echo" => Some(ProtocolVariant::Ping),
                "traceroute" | "trace" | "tracert" => Some(ProtocolVariant::IcmpTraceroute),
                _ => None,
            },
            ProtocolFamily::Trace => match token.as_str() {
                "httptrace" | "http" => Some(ProtocolVariant::HttpTrace),
                "tcptrace" | "tcp" => Some(ProtocolVariant::TcpTrace),
                "udptrace" | "udp" => Some(ProtocolVariant::UdpTrace),
                "icmptrace" | "icmp" => Some(ProtocolVariant::IcmpTrace),
                _ => None,
            },
        };
        variant.ok_or_else(|| {
            ProbeError::Validation(format!(
                "unknown {family} variant: {label:?}"
            ))
        })
    }
}

impl fmt::Display for ProtocolVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lowercase and strip whitespace plus `-`, `_`, `/` and `.` separators.
fn normalize_token(s: &str) -> String {
    s.chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, '-' | '_' | '/' | '.'))
        .flat_map(|c| c.to_lowercase())
        .collect()
}
