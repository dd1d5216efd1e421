//! UDP probe engine.
//!
//! Raw UDP is connectionless: a successful write with no reply is still a
//! successful probe, and the response summary says so. The dns variant
//! drives a real resolver at the target instead of guessing about opaque
//! datagrams.

use super::{ms, resolve, ProbeEngine, ProbeFailure, ProbeResult};
use crate::error::ProbeError;
use crate::model::{ProbeDetail, ProbeSample, ProbeSpec, UdpDetail};
use crate::variant::ProtocolVariant;
use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

/// 4-byte sentinel for the raw variant.
const RAW_PROBE_PAYLOAD: &[u8] = b"PING";

/// Upper bound on the single read attempt / DNS exchange.
const DEFAULT_WAIT: Duration = Duration::from_secs(5);

pub struct UdpProbe;

#[async_trait]
impl ProbeEngine for UdpProbe {
    async fn run_once(&self, spec: &ProbeSpec, _cancel: &CancellationToken) -> ProbeResult {
        match spec.variant {
            ProtocolVariant::UdpRaw => raw_probe(spec).await,
            ProtocolVariant::Dns => dns_probe(spec).await,
            ProtocolVariant::Dtls => Err(ProbeError::unsupported_dtls().into()),
            other => Err(ProbeFailure::new(ProbeError::Validation(format!(
                "variant {other} is not a UDP probe"
            )))),
        }
    }
}

/// Wait budget for one exchange, kept inside the dispatch deadline so a
/// no-response read resolves before the whole probe is aborted.
fn wait_budget(spec: &ProbeSpec) -> Duration {
    match spec.timeout {
        Some(t) => DEFAULT_WAIT.min(t.mul_f64(0.8)),
        None => DEFAULT_WAIT,
    }
}

async fn raw_probe(spec: &ProbeSpec) -> ProbeResult {
    let port = spec.target.port.unwrap_or(161);
    let (addr, _) = resolve(&spec.target.host, port).await?;
    let remote = addr.to_string();

    let bind_addr: SocketAddr = if addr.is_ipv4() {
        "0.0.0.0:0".parse().expect("ipv4 wildcard")
    } else {
        "[::]:0".parse().expect("ipv6 wildcard")
    };
    let socket = UdpSocket::bind(bind_addr)
        .await
        .map_err(|e| ProbeError::Network(format!("failed to bind UDP socket: {e}")))?;
    socket
        .connect(addr)
        .await
        .map_err(|e| ProbeError::Network(format!("UDP dial failed: {e}")))?;

    let start = Instant::now();
    socket
        .send(RAW_PROBE_PAYLOAD)
        .await
        .map_err(|e| ProbeFailure {
            error: ProbeError::Network(format!("UDP send failed: {e}")),
            partial: None,
            remote_addr: Some(remote.clone()),
        })?;
    let sent = start.elapsed();

    let mut buf = [0u8; 2048];
    let detail = match tokio::time::timeout(wait_budget(spec), socket.recv(&mut buf)).await {
        Ok(Ok(n)) => {
            return Ok(ProbeSample {
                latency_ms: ms(start.elapsed()),
                remote_addr: Some(remote),
                detail: ProbeDetail::Udp(UdpDetail {
                    response: Some(format!("Received {n} bytes")),
                    dns_answers: None,
                }),
                note: None,
                native_stats: None,
            });
        }
        Ok(Err(e)) => {
            // ICMP port-unreachable surfaces here on connected sockets; the
            // datagram still left, so the probe stands.
            UdpDetail {
                response: Some(format!("No response ({e})")),
                dns_answers: None,
            }
        }
        Err(_) => UdpDetail {
            response: Some("No response (expected for raw UDP)".to_string()),
            dns_answers: None,
        },
    };

    Ok(ProbeSample {
        latency_ms: ms(sent),
        remote_addr: Some(remote),
        detail: ProbeDetail::Udp(detail),
        note: None,
        native_stats: None,
    })
}

async fn dns_probe(spec: &ProbeSpec) -> ProbeResult {
    let port = spec.target.port.unwrap_or(53);
    let (addr, _) = resolve(&spec.target.host, port).await?;
    let remote = addr.to_string();

    let mut config = ResolverConfig::new();
    config.add_name_server(NameServerConfig::new(addr, Protocol::Udp));
    let mut opts = ResolverOpts::default();
    opts.timeout = wait_budget(spec);
    opts.attempts = 1;
    let resolver = TokioAsyncResolver::tokio(config, opts);

    let start = Instant::now();
    let lookup = resolver
        .lookup_ip(spec.dns_query.as_str())
        .await
        .map_err(|e| ProbeFailure {
            error: ProbeError::Protocol(format!("DNS lookup of {} failed: {e}", spec.dns_query)),
            partial: None,
            remote_addr: Some(remote.clone()),
        })?;
    let elapsed = start.elapsed();

    let answers: Vec<String> = lookup.iter().map(|ip| ip.to_string()).collect();
    if answers.is_empty() {
        return Err(ProbeFailure {
            error: ProbeError::Protocol(format!("DNS returned no addresses for {}", spec.dns_query)),
            partial: None,
            remote_addr: Some(remote),
        });
    }

    Ok(ProbeSample {
        latency_ms: ms(elapsed),
        remote_addr: Some(remote),
        detail: ProbeDetail::Udp(UdpDetail {
            response: Some(format!(
                "Resolved {} address(es) for {}",
                answers.len(),
                spec.dns_query
            )),
            dns_answers: Some(answers),
        }),
        note: None,
        native_stats: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ProbeRequest;
    use crate::probe::run_probe;
    use crate::variant::ProtocolFamily;

    fn spec(target: String, variant: &str, timeout: u64, query: Option<&str>) -> ProbeSpec {
        let req = ProbeRequest {
            target,
            protocol_variant: Some(variant.into()),
            timeout_seconds: Some(timeout),
            dns_query: query.map(String::from),
            ..Default::default()
        };
        ProbeSpec::from_request(ProtocolFamily::Udp, &req).unwrap()
    }

    #[tokio::test]
    async fn raw_probe_reports_echoed_bytes() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            if let Ok((n, from)) = server.recv_from(&mut buf).await {
                let _ = server.send_to(&buf[..n], from).await;
            }
        });

        let report = run_probe(
            &UdpProbe,
            &spec(addr.to_string(), "raw", 5, None),
            &CancellationToken::new(),
        )
        .await;
        assert!(report.success);
        let v = serde_json::to_value(&report).unwrap();
        assert_eq!(v["response"], "Received 4 bytes");
        assert!(report.latency_ms > 0.0);
    }

    #[tokio::test]
    async fn raw_probe_without_reply_is_still_success() {
        // A bound socket that never answers.
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        let report = run_probe(
            &UdpProbe,
            &spec(addr.to_string(), "raw", 1, None),
            &CancellationToken::new(),
        )
        .await;
        assert!(report.success, "error: {:?}", report.error);
        let v = serde_json::to_value(&report).unwrap();
        let response = v["response"].as_str().unwrap();
        assert!(response.starts_with("No response"), "got {response:?}");
    }

    #[tokio::test]
    async fn dtls_fails_fast_with_stable_message() {
        let report = run_probe(
            &UdpProbe,
            &spec("example.com".into(), "dtls", 5, None),
            &CancellationToken::new(),
        )
        .await;
        assert!(!report.success);
        assert_eq!(report.error_code, Some("unsupported"));
        assert_eq!(report.error.as_deref(), Some("DTLS probing is not supported"));
    }

    /// Minimal DNS responder: echoes the question and answers with one A
    /// record so the resolver path can be exercised at loopback.
    async fn serve_dns_once(answer: [u8; 4]) -> std::net::SocketAddr {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let Ok((n, from)) = server.recv_from(&mut buf).await else {
                return;
            };
            if n < 12 {
                return;
            }
            // Question section: name labels, then QTYPE + QCLASS.
            let mut idx = 12;
            while idx < n && buf[idx] != 0 {
                idx += (buf[idx] as usize) + 1;
            }
            idx += 5;
            if idx > n {
                return;
            }
            let mut resp = Vec::with_capacity(idx + 16);
            resp.extend_from_slice(&buf[0..2]); // transaction id
            resp.extend_from_slice(&[0x81, 0x80]); // standard response, RA
            resp.extend_from_slice(&[0x00, 0x01]); // QDCOUNT
            resp.extend_from_slice(&[0x00, 0x01]); // ANCOUNT
            resp.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]); // NS/AR
            resp.extend_from_slice(&buf[12..idx]); // question
            resp.extend_from_slice(&[0xc0, 0x0c]); // name pointer
            resp.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]); // A IN
            resp.extend_from_slice(&[0x00, 0x00, 0x00, 0x3c]); // TTL
            resp.extend_from_slice(&[0x00, 0x04]);
            resp.extend_from_slice(&answer);
            let _ = server.send_to(&resp, from).await;
        });
        addr
    }

    #[tokio::test]
    async fn dns_probe_collects_answers() {
        let addr = serve_dns_once([192, 0, 2, 7]).await;
        let report = run_probe(
            &UdpProbe,
            &spec(addr.to_string(), "dns", 5, Some("example.com")),
            &CancellationToken::new(),
        )
        .await;
        assert!(report.success, "error: {:?}", report.error);
        let v = serde_json::to_value(&report).unwrap();
        assert_eq!(v["dns_answers"][0], "192.0.2.7");
        assert_eq!(report.remote_addr.as_deref(), Some(&*addr.to_string()));
    }

    #[tokio::test]
    async fn dns_probe_against_silence_fails() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        let report = run_probe(
            &UdpProbe,
            &spec(addr.to_string(), "dns", 1, Some("example.com")),
            &CancellationToken::new(),
        )
        .await;
        assert!(!report.success);
        assert_eq!(report.error_code, Some("protocol"));
    }
}
