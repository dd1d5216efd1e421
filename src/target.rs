//! Target normalization.
//!
//! User input arrives as a bare host, a `host:port` pair, or a full URL.
//! Normalization resolves that into a canonical `(host, port, scheme)` and
//! applies per-variant default ports, so the engines only ever see a ready
//! endpoint.

use crate::error::ProbeError;
use crate::variant::ProtocolVariant;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedTarget {
    pub host: String,
    pub port: Option<u16>,
    pub scheme: Option<String>,
    /// Path + query carried over from URL-form targets; `None` for bare
    /// hosts. HTTP probes request this path, everything else ignores it.
    pub path: Option<String>,
}

impl NormalizedTarget {
    /// Canonical `host:port` (bare host when no port applies, e.g. ICMP).
    /// IPv6 hosts are bracketed.
    pub fn endpoint(&self) -> String {
        match self.port {
            Some(port) if self.host.contains(':') => format!("[{}]:{}", self.host, port),
            Some(port) => format!("{}:{}", self.host, port),
            None => self.host.clone(),
        }
    }

    /// Full URL for HTTP probes.
    pub fn http_url(&self) -> String {
        let scheme = self.scheme.as_deref().unwrap_or("https");
        let path = self.path.as_deref().unwrap_or("/");
        match self.port {
            Some(port) if self.host.contains(':') => {
                format!("{scheme}://[{}]:{port}{path}", self.host)
            }
            Some(port) => format!("{scheme}://{}:{port}{path}", self.host),
            None => format!("{scheme}://{}{path}", self.host),
        }
    }

    pub fn uses_tls(&self) -> bool {
        self.scheme.as_deref() != Some("http")
    }
}

/// Default port for a variant, applied only when neither the target nor the
/// explicit override supplied one.
fn default_port(variant: ProtocolVariant, scheme: Option<&str>) -> Option<u16> {
    match variant {
        ProtocolVariant::Http1 | ProtocolVariant::Http2 | ProtocolVariant::Http3 => {
            Some(if scheme == Some("http") { 80 } else { 443 })
        }
        ProtocolVariant::Ssh => Some(22),
        ProtocolVariant::TcpTls => Some(443),
        ProtocolVariant::TcpRaw => Some(80),
        ProtocolVariant::UdpRaw => Some(161),
        ProtocolVariant::Dns => Some(53),
        ProtocolVariant::Dtls => Some(443),
        ProtocolVariant::Ping | ProtocolVariant::IcmpTraceroute | ProtocolVariant::IcmpTrace => {
            None
        }
        ProtocolVariant::TcpTrace => Some(22),
        ProtocolVariant::UdpTrace => Some(53),
        ProtocolVariant::HttpTrace => Some(if scheme == Some("http") { 80 } else { 443 }),
    }
}

pub fn normalize(
    target: &str,
    port_override: Option<u16>,
    variant: ProtocolVariant,
) -> Result<NormalizedTarget, ProbeError> {
    let target = target.trim();
    if target.is_empty() {
        return Err(ProbeError::Validation("target must not be empty".into()));
    }

    let is_http = matches!(
        variant,
        ProtocolVariant::Http1
            | ProtocolVariant::Http2
            | ProtocolVariant::Http3
            | ProtocolVariant::HttpTrace
    );

    let (host, mut port, scheme, path) = if target.contains("://") {
        parse_url_target(target)?
    } else if is_http {
        // HTTP accepts scheme-less input; treat it as https.
        parse_url_target(&format!("https://{target}"))?
    } else if target.bytes().filter(|b| *b == b':').count() == 1 {
        let (host, port_str) = target.split_once(':').expect("single colon");
        if host.is_empty() {
            return Err(ProbeError::Validation("target has an empty host".into()));
        }
        (host.to_string(), Some(parse_port(port_str)?), None, None)
    } else {
        // Bare host, or an unbracketed IPv6 literal.
        (target.to_string(), None, None, None)
    };

    if let Some(p) = port_override {
        if p == 0 {
            return Err(ProbeError::Validation("port must be between 1 and 65535".into()));
        }
        port = Some(p);
    }

    if port.is_none() {
        port = default_port(variant, scheme.as_deref());
    }

    Ok(NormalizedTarget {
        host,
        port,
        scheme,
        path,
    })
}

fn parse_url_target(
    target: &str,
) -> Result<(String, Option<u16>, Option<String>, Option<String>), ProbeError> {
    let url = Url::parse(target)
        .map_err(|e| ProbeError::Validation(format!("invalid target URL {target:?}: {e}")))?;
    let host = url
        .host_str()
        .ok_or_else(|| ProbeError::Validation("target URL has no host".into()))?
        .trim_matches(|c| c == '[' || c == ']')
        .to_string();
    if host.is_empty() {
        return Err(ProbeError::Validation("target has an empty host".into()));
    }
    let path = match (url.path(), url.query()) {
        ("/", None) | ("", None) => None,
        (p, None) => Some(p.to_string()),
        (p, Some(q)) => Some(format!("{p}?{q}")),
    };
    Ok((
        host,
        url.port(),
        Some(url.scheme().to_string()),
        path,
    ))
}

fn parse_port(s: &str) -> Result<u16, ProbeError> {
    let port: u16 = s
        .parse()
        .map_err(|_| ProbeError::Validation(format!("invalid port {s:?}")))?;
    if port == 0 {
        return Err(ProbeError::Validation("port must be between 1 and 65535".into()));
    }
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variant::ProtocolVariant as V;

    #[test]
    fn bare_host_gets_variant_default_port() {
        let t = normalize("example.com", None, V::Ssh).unwrap();
        assert_eq!(t.endpoint(), "example.com:22");
        let t = normalize("example.com", None, V::Dns).unwrap();
        assert_eq!(t.endpoint(), "example.com:53");
        let t = normalize("example.com", None, V::UdpRaw).unwrap();
        assert_eq!(t.endpoint(), "example.com:161");
    }

    #[test]
    fn host_port_pair_is_used_directly() {
        let t = normalize("example.com:8443", None, V::TcpTls).unwrap();
        assert_eq!(t.endpoint(), "example.com:8443");
    }

    #[test]
    fn url_target_preserves_scheme_and_path() {
        let t = normalize("http://example.com/health?x=1", None, V::Http1).unwrap();
        assert_eq!(t.scheme.as_deref(), Some("http"));
        assert_eq!(t.port, Some(80));
        assert_eq!(t.http_url(), "http://example.com:80/health?x=1");
        assert!(!t.uses_tls());
    }

    #[test]
    fn http_target_without_scheme_defaults_to_https() {
        let t = normalize("www.example.com", None, V::Http2).unwrap();
        assert_eq!(t.scheme.as_deref(), Some("https"));
        assert_eq!(t.endpoint(), "www.example.com:443");
        assert!(t.uses_tls());
    }

    #[test]
    fn explicit_override_wins_over_url_port() {
        let t = normalize("https://example.com:444", Some(8443), V::Http2).unwrap();
        assert_eq!(t.port, Some(8443));
    }

    #[test]
    fn icmp_ping_keeps_bare_host() {
        let t = normalize("203.0.113.1", None, V::Ping).unwrap();
        assert_eq!(t.endpoint(), "203.0.113.1");
        assert_eq!(t.port, None);
    }

    #[test]
    fn bad_inputs_are_validation_errors() {
        assert!(normalize("  ", None, V::TcpRaw).is_err());
        assert!(normalize("host:notaport", None, V::TcpRaw).is_err());
        assert!(normalize("host:0", None, V::TcpRaw).is_err());
        assert!(normalize("host:70000", None, V::TcpRaw).is_err());
        assert!(normalize("example.com", Some(0), V::TcpRaw).is_err());
    }

    #[test]
    fn ipv6_literal_is_bracketed_in_endpoint() {
        let t = normalize("2001:db8::1", None, V::TcpRaw).unwrap();
        assert_eq!(t.endpoint(), "[2001:db8::1]:80");
    }

    #[test]
    fn normalization_is_idempotent() {
        let once = normalize("example.com", None, V::TcpTls).unwrap();
        let twice = normalize(&once.endpoint(), None, V::TcpTls).unwrap();
        assert_eq!(once, twice);

        let once = normalize("www.example.com", None, V::Http2).unwrap();
        let twice = normalize(&once.http_url(), None, V::Http2).unwrap();
        assert_eq!(once.endpoint(), twice.endpoint());
        assert_eq!(once.scheme, twice.scheme);
    }
}
