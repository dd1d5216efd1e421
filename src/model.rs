//! Request and result model for the test execution core.
//!
//! All objects are created per call and discarded after serialization; the
//! engines hold no per-caller state.

use crate::error::ProbeError;
use crate::target::{self, NormalizedTarget};
use crate::variant::{ProtocolFamily, ProtocolVariant};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const MAX_TIMEOUT_SECONDS: u64 = 300;
pub const MAX_COUNT: u32 = 1000;
pub const DEFAULT_MAX_HOPS: u32 = 30;
pub const DEFAULT_DNS_QUERY: &str = "google.com";
pub const USER_AGENT: &str = "WaddlePerf-TestServer/1.0";

/// Wire-format probe request, shared by every `/api/v1/test/*` endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProbeRequest {
    pub target: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub protocol_family: Option<String>,
    #[serde(default)]
    pub protocol_variant: Option<String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub count: Option<u32>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub dns_query: Option<String>,
    #[serde(default)]
    pub traceroute_max_hops: Option<u32>,
    #[serde(default)]
    pub packet_size: Option<u32>,
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

/// A validated, normalized request ready for an engine.
#[derive(Debug, Clone)]
pub struct ProbeSpec {
    pub target: NormalizedTarget,
    pub family: ProtocolFamily,
    pub variant: ProtocolVariant,
    /// Whole-dispatch deadline. `None` means the engine default applies.
    pub timeout: Option<Duration>,
    pub count: u32,
    pub method: String,
    pub dns_query: String,
    pub max_hops: u32,
    pub packet_size: Option<u32>,
    pub insecure_skip_verify: bool,
}

impl ProbeSpec {
    /// Validate a wire request against the family implied by the endpoint.
    ///
    /// Every invariant violation is a `ValidationError`; no engine work has
    /// happened yet when this fails.
    pub fn from_request(family: ProtocolFamily, req: &ProbeRequest) -> Result<Self, ProbeError> {
        if let Some(declared) = req.protocol_family.as_deref() {
            let declared = ProtocolFamily::parse(declared)?;
            if declared != family {
                return Err(ProbeError::Validation(format!(
                    "protocol_family {declared} does not match the {family} endpoint"
                )));
            }
        }

        let variant =
            ProtocolVariant::parse(family, req.protocol_variant.as_deref().unwrap_or(""))?;

        let timeout = match req.timeout_seconds {
            None | Some(0) => None,
            Some(s) if s > MAX_TIMEOUT_SECONDS => {
                return Err(ProbeError::Validation(format!(
                    "timeout_seconds must be at most {MAX_TIMEOUT_SECONDS}"
                )));
            }
            Some(s) => Some(Duration::from_secs(s)),
        };

        let count = req.count.unwrap_or(1);
        if count == 0 || count > MAX_COUNT {
            return Err(ProbeError::Validation(format!(
                "count must be between 1 and {MAX_COUNT}"
            )));
        }

        let max_hops = req.traceroute_max_hops.unwrap_or(DEFAULT_MAX_HOPS);
        if max_hops == 0 || max_hops > 255 {
            return Err(ProbeError::Validation(
                "traceroute_max_hops must be between 1 and 255".into(),
            ));
        }

        let method = req
            .method
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or("GET")
            .to_ascii_uppercase();
        if !method.bytes().all(|b| b.is_ascii_alphabetic()) {
            return Err(ProbeError::Validation(format!("invalid method {method:?}")));
        }

        let target = target::normalize(&req.target, req.port, variant)?;

        Ok(ProbeSpec {
            target,
            family,
            variant,
            timeout,
            count,
            method,
            dns_query: req
                .dns_query
                .as_deref()
                .map(str::trim)
                .filter(|q| !q.is_empty())
                .unwrap_or(DEFAULT_DNS_QUERY)
                .to_string(),
            max_hops,
            packet_size: req.packet_size,
            insecure_skip_verify: req.insecure_skip_verify,
        })
    }
}

/// One router's entry in a trace result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Hop {
    pub hop_number: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    pub timeout: bool,
    pub raw: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HttpDetail {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttfb_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_lookup_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_connect_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_handshake_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_time_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_length_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_speed_mbps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_proto: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TcpDetail {
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handshake_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_cipher: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_server_version: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UdpDetail {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_answers: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IcmpDetail {
    pub packets_sent: u32,
    pub packets_received: u32,
    pub packet_loss_percent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hops: Option<Vec<Hop>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HttpTraceDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub via: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x_forwarded_for: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TlsTraceDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cipher_suite: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub negotiated_protocol: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TraceDetail {
    pub hops: Vec<Hop>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_info: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_details: Option<HttpTraceDetails>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_details: Option<TlsTraceDetails>,
}

/// Family-specific result extension; serialized flattened into the envelope.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ProbeDetail {
    Http(HttpDetail),
    Tcp(TcpDetail),
    Udp(UdpDetail),
    Icmp(IcmpDetail),
    Trace(TraceDetail),
}

/// Latency statistics natively computed by a multi-sample engine (ICMP ping
/// parses N samples from one invocation).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NativeStats {
    pub mean_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub jitter_ms: f64,
    pub stddev_ms: f64,
}

/// One successful engine iteration.
#[derive(Debug, Clone)]
pub struct ProbeSample {
    pub latency_ms: f64,
    pub remote_addr: Option<String>,
    pub detail: ProbeDetail,
    /// Advisory text carried into the envelope's `error` field while
    /// `success` stays true (SSH reports reachability this way).
    pub note: Option<String>,
    /// Set only by multi-sample-native engines; the iteration wrapper copies
    /// these instead of aggregating.
    pub native_stats: Option<NativeStats>,
}

/// Device identity echoed from `X-Device-*` request headers for downstream
/// aggregation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeviceIdentity {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
}

impl DeviceIdentity {
    pub fn is_empty(&self) -> bool {
        self.serial.is_none()
            && self.hostname.is_none()
            && self.os.is_none()
            && self.os_version.is_none()
    }
}

/// The response envelope common to all probes.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub target: String,
    pub protocol: ProtocolFamily,
    pub protocol_variant: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<&'static str>,
    pub latency_ms: f64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
    pub jitter_ms: f64,
    pub stddev_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_addr: Option<String>,
    // A `None` detail flattens to nothing.
    #[serde(flatten)]
    pub detail: Option<ProbeDetail>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceIdentity>,
    pub timestamp_utc: String,
}

impl ProbeReport {
    pub fn empty(spec: &ProbeSpec) -> Self {
        ProbeReport {
            target: spec.target.endpoint(),
            protocol: spec.family,
            protocol_variant: spec.variant.as_str().to_string(),
            success: false,
            error: None,
            error_code: None,
            latency_ms: 0.0,
            min_latency_ms: 0.0,
            max_latency_ms: 0.0,
            jitter_ms: 0.0,
            stddev_ms: 0.0,
            remote_addr: None,
            detail: None,
            device: None,
            timestamp_utc: now_rfc3339(),
        }
    }

    pub fn failed(spec: &ProbeSpec, err: &ProbeError) -> Self {
        let mut report = Self::empty(spec);
        report.error = Some(err.to_string());
        report.error_code = Some(err.code());
        report
    }
}

pub fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "now".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_request(target: &str) -> ProbeRequest {
        ProbeRequest {
            target: target.into(),
            ..Default::default()
        }
    }

    #[test]
    fn spec_applies_defaults() {
        let spec =
            ProbeSpec::from_request(ProtocolFamily::Http, &base_request("example.com")).unwrap();
        assert_eq!(spec.variant, ProtocolVariant::Http2);
        assert_eq!(spec.count, 1);
        assert_eq!(spec.method, "GET");
        assert_eq!(spec.dns_query, DEFAULT_DNS_QUERY);
        assert_eq!(spec.max_hops, DEFAULT_MAX_HOPS);
        assert!(spec.timeout.is_none());
    }

    #[test]
    fn zero_timeout_means_engine_default() {
        let mut req = base_request("example.com");
        req.timeout_seconds = Some(0);
        let spec = ProbeSpec::from_request(ProtocolFamily::Tcp, &req).unwrap();
        assert!(spec.timeout.is_none());
    }

    #[test]
    fn out_of_range_numerics_are_rejected() {
        let mut req = base_request("example.com");
        req.timeout_seconds = Some(301);
        assert!(ProbeSpec::from_request(ProtocolFamily::Tcp, &req).is_err());

        let mut req = base_request("example.com");
        req.count = Some(0);
        assert!(ProbeSpec::from_request(ProtocolFamily::Tcp, &req).is_err());

        let mut req = base_request("example.com");
        req.count = Some(1001);
        assert!(ProbeSpec::from_request(ProtocolFamily::Tcp, &req).is_err());
    }

    #[test]
    fn family_mismatch_is_rejected() {
        let mut req = base_request("example.com");
        req.protocol_family = Some("udp".into());
        let err = ProbeSpec::from_request(ProtocolFamily::Tcp, &req).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn declared_family_accepts_spelling_variants() {
        let mut req = base_request("example.com");
        req.protocol_family = Some("TCP ".into());
        assert!(ProbeSpec::from_request(ProtocolFamily::Tcp, &req).is_ok());
    }

    #[test]
    fn method_is_upcased_and_checked() {
        let mut req = base_request("example.com");
        req.method = Some("post".into());
        let spec = ProbeSpec::from_request(ProtocolFamily::Http, &req).unwrap();
        assert_eq!(spec.method, "POST");

        let mut req = base_request("example.com");
        req.method = Some("G ET".into());
        assert!(ProbeSpec::from_request(ProtocolFamily::Http, &req).is_err());
    }

    #[test]
    fn icmp_report_carries_loss_fields_and_lowercase_protocol() {
        let mut req = base_request("8.8.8.8");
        req.protocol_variant = Some("ping".into());
        let spec = ProbeSpec::from_request(ProtocolFamily::Icmp, &req).unwrap();
        let mut report = ProbeReport::empty(&spec);
        report.detail = Some(ProbeDetail::Icmp(IcmpDetail {
            packets_sent: 4,
            packets_received: 3,
            packet_loss_percent: 25.0,
            hops: None,
        }));
        let v = serde_json::to_value(&report).unwrap();
        assert_eq!(v["protocol"], "icmp");
        assert_eq!(v["protocol_variant"], "ping");
        assert_eq!(v["target"], "8.8.8.8");
        assert_eq!(v["packets_sent"], 4);
        assert_eq!(v["packet_loss_percent"], 25.0);
        assert!(v.get("hops").is_none());
    }

    #[test]
    fn report_serializes_flattened_detail() {
        let spec =
            ProbeSpec::from_request(ProtocolFamily::Tcp, &base_request("example.com:443")).unwrap();
        let mut report = ProbeReport::empty(&spec);
        report.success = true;
        report.detail = Some(ProbeDetail::Tcp(TcpDetail {
            connected: true,
            handshake_ms: Some(12.5),
            ..Default::default()
        }));
        let v: serde_json::Value = serde_json::to_value(&report).unwrap();
        assert_eq!(v["connected"], serde_json::json!(true));
        assert_eq!(v["handshake_ms"], serde_json::json!(12.5));
        assert_eq!(v["target"], serde_json::json!("example.com:443"));
        assert!(v.get("tls_version").is_none());
    }
}
