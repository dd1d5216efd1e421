//! Multi-protocol path tracing.
//!
//! Wraps the platform traceroute family (`tcptraceroute`, `traceroute`,
//! `tracert`) through the `CommandRunner` capability, parses the output into
//! hop records, and composes protocol-specific detail on top. When the tools
//! fail outright, tcp/udp traces degrade to a direct dial so the caller at
//! least learns whether the endpoint is reachable.

use super::{ms, resolve, tls, ProbeEngine, ProbeFailure, ProbeResult};
use crate::error::ProbeError;
use crate::model::{
    Hop, HttpTraceDetails, NativeStats, ProbeDetail, ProbeSample, ProbeSpec, TraceDetail,
    USER_AGENT,
};
use crate::runner::{CommandRunner, CommandSpec, RunError};
use crate::variant::ProtocolVariant;
use async_trait::async_trait;
use regex::Regex;
use std::net::SocketAddr;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};
use tokio::net::{TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::debug;

static HOP_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\d+)\s+(.+)$").expect("hop regex"));
static IPV4: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{1,3}(?:\.\d{1,3}){3})\b").expect("ipv4 regex"));
static LATENCY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:\.\d+)?)\s*ms").expect("latency regex"));

/// Parse one line of traceroute output. Header and footer lines don't start
/// with a hop number and fall through to `None`.
pub(crate) fn parse_hop_line(line: &str) -> Option<Hop> {
    let caps = HOP_LINE.captures(line)?;
    let hop_number: u32 = caps[1].parse().ok()?;
    let rest = caps[2].trim();

    let ip = IPV4.captures(rest).map(|c| c[1].to_string());
    let latency_ms = LATENCY
        .captures(rest)
        .and_then(|c| c[1].parse::<f64>().ok());
    let timeout = ip.is_none() && rest.contains('*');

    // IP and latency tokens are purely numeric, so the first token carrying
    // a letter is the reverse-resolved name, once annotations (`!H`,
    // `[open]`) and the `ms` unit are ruled out.
    let hostname = rest
        .split_whitespace()
        .find(|tok| {
            tok.chars().any(|c| c.is_ascii_alphabetic())
                && *tok != "ms"
                && !tok.starts_with(['!', '[', '<'])
        })
        .map(|tok| tok.trim_matches(|c| c == '(' || c == ')').to_string());

    if ip.is_none() && latency_ms.is_none() && !timeout {
        return None;
    }

    Some(Hop {
        hop_number,
        ip,
        hostname,
        latency_ms,
        timeout,
        raw: line.to_string(),
    })
}

/// Parse full tool output, preserving hop numbering and truncating past
/// `max_hops`.
pub(crate) fn parse_hops(output: &str, max_hops: u32) -> Vec<Hop> {
    output
        .lines()
        .filter_map(parse_hop_line)
        .filter(|h| h.hop_number >= 1 && h.hop_number <= max_hops)
        .collect()
}

pub struct TraceProbe {
    runner: Arc<dyn CommandRunner>,
}

impl TraceProbe {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        TraceProbe { runner }
    }
}

#[async_trait]
impl ProbeEngine for TraceProbe {
    fn default_timeout(&self, spec: &ProbeSpec) -> Duration {
        // Worst case is max_hops sequential waits.
        Duration::from_secs((spec.max_hops as u64 * 3).clamp(60, 180))
    }

    fn multi_sample_native(&self) -> bool {
        true
    }

    async fn run_once(&self, spec: &ProbeSpec, cancel: &CancellationToken) -> ProbeResult {
        match spec.variant {
            ProtocolVariant::IcmpTrace => self.icmp_trace(spec, cancel).await,
            ProtocolVariant::TcpTrace => self.tcp_trace(spec, cancel).await,
            ProtocolVariant::UdpTrace => self.udp_trace(spec, cancel).await,
            ProtocolVariant::HttpTrace => self.http_trace(spec, cancel).await,
            other => Err(ProbeFailure::new(ProbeError::Validation(format!(
                "variant {other} is not a trace probe"
            )))),
        }
    }
}

/// Per-hop wait passed to the tool, in whole seconds.
fn hop_wait_secs(spec: &ProbeSpec) -> u64 {
    spec.timeout
        .map(|t| (t.as_secs() / 10).clamp(1, 5))
        .unwrap_or(3)
}

fn trace_sample(
    elapsed_ms: f64,
    remote: Option<String>,
    detail: TraceDetail,
) -> ProbeSample {
    ProbeSample {
        latency_ms: elapsed_ms,
        remote_addr: remote,
        detail: ProbeDetail::Trace(detail),
        note: None,
        native_stats: Some(NativeStats {
            mean_ms: elapsed_ms,
            min_ms: elapsed_ms,
            max_ms: elapsed_ms,
            jitter_ms: 0.0,
            stddev_ms: 0.0,
        }),
    }
}

impl TraceProbe {
    /// Run trace commands in preference order. A missing binary moves on to
    /// the next candidate; the first run that yields hops wins.
    async fn run_candidates(
        &self,
        candidates: Vec<CommandSpec>,
        spec: &ProbeSpec,
        cancel: &CancellationToken,
    ) -> Result<(Vec<Hop>, String), ProbeError> {
        let wait = hop_wait_secs(spec);
        let tool_timeout = Duration::from_secs(wait * (spec.max_hops as u64) + 30);
        let mut last_err: Option<ProbeError> = None;

        for candidate in candidates {
            let program = candidate.program.clone();
            match self.runner.run(&candidate, tool_timeout, cancel).await {
                Ok(output) => {
                    let hops = parse_hops(&output.combined(), spec.max_hops);
                    if !hops.is_empty() {
                        return Ok((hops, program));
                    }
                    last_err = Some(ProbeError::Tool(format!(
                        "{program} produced no hops (exit code {:?})",
                        output.exit_code
                    )));
                }
                Err(RunError::NotFound(p)) => {
                    debug!(program = %p, "trace tool not found, trying next candidate");
                    last_err = Some(ProbeError::Tool(format!("{p}: command not found")));
                }
                Err(RunError::Cancelled) => return Err(ProbeError::Cancelled),
                Err(e) => last_err = Some(e.into()),
            }
        }

        Err(last_err.unwrap_or_else(|| ProbeError::Tool("no trace tool available".into())))
    }

    async fn icmp_trace(&self, spec: &ProbeSpec, cancel: &CancellationToken) -> ProbeResult {
        let wait = hop_wait_secs(spec);
        let host = spec.target.host.clone();
        let candidates = if cfg!(target_os = "windows") {
            vec![CommandSpec::new(
                "tracert",
                [
                    "-w".into(),
                    (wait * 1000).to_string(),
                    "-h".into(),
                    spec.max_hops.to_string(),
                    host,
                ],
            )]
        } else {
            vec![CommandSpec::new(
                "traceroute",
                [
                    "-w".into(),
                    wait.to_string(),
                    "-m".into(),
                    spec.max_hops.to_string(),
                    host,
                ],
            )]
        };

        let start = Instant::now();
        let (hops, program) = self
            .run_candidates(candidates, spec, cancel)
            .await
            .map_err(|e| ProbeFailure {
                error: e,
                partial: Some(ProbeDetail::Trace(TraceDetail::default())),
                remote_addr: None,
            })?;

        let route_info = format!(
            "{} hops to {} via {program}",
            hops.len(),
            spec.target.host
        );
        Ok(trace_sample(
            ms(start.elapsed()),
            None,
            TraceDetail {
                hops,
                route_info: Some(route_info),
                http_details: None,
                tls_details: None,
            },
        ))
    }

    async fn tcp_trace(&self, spec: &ProbeSpec, cancel: &CancellationToken) -> ProbeResult {
        let port = spec.target.port.unwrap_or(22);
        let (addr, _) = resolve(&spec.target.host, port).await?;
        let start = Instant::now();

        match self.network_path_tcp(spec, port, cancel).await {
            Ok((hops, program)) => {
                let route_info = format!("{} hops to {addr} via {program}", hops.len());
                Ok(trace_sample(
                    ms(start.elapsed()),
                    Some(addr.to_string()),
                    TraceDetail {
                        hops,
                        route_info: Some(route_info),
                        http_details: None,
                        tls_details: None,
                    },
                ))
            }
            Err(tool_err) => degrade_tcp(addr, start, tool_err).await,
        }
    }

    /// TCP network path: prefer `tcptraceroute`, fall back to
    /// `traceroute -T`.
    async fn network_path_tcp(
        &self,
        spec: &ProbeSpec,
        port: u16,
        cancel: &CancellationToken,
    ) -> Result<(Vec<Hop>, String), ProbeError> {
        let wait = hop_wait_secs(spec);
        let host = spec.target.host.clone();
        let candidates = if cfg!(target_os = "windows") {
            vec![CommandSpec::new(
                "tracert",
                [
                    "-w".into(),
                    (wait * 1000).to_string(),
                    "-h".into(),
                    spec.max_hops.to_string(),
                    host,
                ],
            )]
        } else {
            vec![
                CommandSpec::new(
                    "tcptraceroute",
                    [
                        "-w".into(),
                        wait.to_string(),
                        "-m".into(),
                        spec.max_hops.to_string(),
                        host.clone(),
                        port.to_string(),
                    ],
                ),
                CommandSpec::new(
                    "traceroute",
                    [
                        "-T".into(),
                        "-p".into(),
                        port.to_string(),
                        "-w".into(),
                        wait.to_string(),
                        "-m".into(),
                        spec.max_hops.to_string(),
                        host,
                    ],
                ),
            ]
        };
        self.run_candidates(candidates, spec, cancel).await
    }

    async fn udp_trace(&self, spec: &ProbeSpec, cancel: &CancellationToken) -> ProbeResult {
        let port = spec.target.port.unwrap_or(53);
        let (addr, _) = resolve(&spec.target.host, port).await?;
        let wait = hop_wait_secs(spec);
        let host = spec.target.host.clone();
        let candidates = if cfg!(target_os = "windows") {
            vec![CommandSpec::new(
                "tracert",
                [
                    "-w".into(),
                    (wait * 1000).to_string(),
                    "-h".into(),
                    spec.max_hops.to_string(),
                    host,
                ],
            )]
        } else {
            vec![CommandSpec::new(
                "traceroute",
                [
                    "-U".into(),
                    "-p".into(),
                    port.to_string(),
                    "-w".into(),
                    wait.to_string(),
                    "-m".into(),
                    spec.max_hops.to_string(),
                    host,
                ],
            )]
        };

        let start = Instant::now();
        match self.run_candidates(candidates, spec, cancel).await {
            Ok((hops, program)) => {
                let route_info = format!("{} hops to {addr} via {program}", hops.len());
                Ok(trace_sample(
                    ms(start.elapsed()),
                    Some(addr.to_string()),
                    TraceDetail {
                        hops,
                        route_info: Some(route_info),
                        http_details: None,
                        tls_details: None,
                    },
                ))
            }
            Err(tool_err) => degrade_udp(addr, start, tool_err).await,
        }
    }

    async fn http_trace(&self, spec: &ProbeSpec, cancel: &CancellationToken) -> ProbeResult {
        let port = spec.target.port.unwrap_or(443);
        let (addr, _) = resolve(&spec.target.host, port).await?;
        let start = Instant::now();

        // Network path first; a failed trace is reported in route_info, not
        // fatal as long as the HTTP request itself works.
        let (mut hops, route_info) = match self.network_path_tcp(spec, port, cancel).await {
            Ok((hops, program)) => {
                let info = format!("{} network hops via {program}", hops.len());
                (hops, info)
            }
            Err(e) => (Vec::new(), format!("network path unavailable: {e}")),
        };

        let url = spec.target.http_url();
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(spec.insecure_skip_verify)
            .timeout(Duration::from_secs(hop_wait_secs(spec) * 10))
            .build()
            .map_err(|e| ProbeError::Network(format!("failed to build HTTP client: {e}")))?;

        let method = reqwest::Method::from_bytes(spec.method.as_bytes())
            .map_err(|_| ProbeError::Validation(format!("invalid method {:?}", spec.method)))?;

        let request_start = Instant::now();
        let response = client
            .request(method.clone(), url.as_str())
            .send()
            .await
            .map_err(|e| ProbeFailure {
                error: ProbeError::Network(format!("HTTP request failed: {e}")),
                partial: Some(ProbeDetail::Trace(TraceDetail {
                    hops: hops.clone(),
                    route_info: Some(route_info.clone()),
                    http_details: None,
                    tls_details: None,
                })),
                remote_addr: Some(addr.to_string()),
            })?;
        let request_ms = ms(request_start.elapsed());

        let proto = match response.version() {
            reqwest::Version::HTTP_10 => "HTTP/1.0",
            reqwest::Version::HTTP_11 => "HTTP/1.1",
            reqwest::Version::HTTP_2 => "HTTP/2.0",
            _ => "HTTP/?",
        };
        let status = response.status().as_u16();
        let headers = response.headers();
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(String::from)
        };
        let http_details = HttpTraceDetails {
            server: header("server"),
            via: header("via"),
            x_forwarded_for: header("x-forwarded-for"),
        };

        // reqwest hides the TLS session, so negotiated parameters come from
        // a dedicated handshake to the same endpoint.
        let tls_details = if spec.target.uses_tls() {
            tls_details_for(spec, addr).await
        } else {
            None
        };

        let final_hop = Hop {
            hop_number: hops.last().map(|h| h.hop_number + 1).unwrap_or(1),
            ip: Some(addr.ip().to_string()),
            hostname: Some(spec.target.host.clone()),
            latency_ms: Some(request_ms),
            timeout: false,
            raw: format!("{method} {url} -> {proto} {status} ({request_ms:.2} ms)"),
        };
        hops.push(final_hop);

        Ok(trace_sample(
            ms(start.elapsed()),
            Some(addr.to_string()),
            TraceDetail {
                hops,
                route_info: Some(route_info),
                http_details: Some(http_details),
                tls_details,
            },
        ))
    }
}

async fn tls_details_for(
    spec: &ProbeSpec,
    addr: SocketAddr,
) -> Option<crate::model::TlsTraceDetails> {
    let config = tls::client_config(spec.insecure_skip_verify, &[b"h2", b"http/1.1"]).ok()?;
    let tcp = TcpStream::connect(addr).await.ok()?;
    let stream = tls::handshake(tcp, &spec.target.host, config).await.ok()?;
    Some(tls::connection_details(&stream, &spec.target.host))
}

/// Graceful degradation: the trace tools failed, so at least report whether
/// the endpoint answers a direct dial.
async fn degrade_tcp(addr: SocketAddr, start: Instant, tool_err: ProbeError) -> ProbeResult {
    match tokio::time::timeout(Duration::from_secs(10), TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            drop(stream);
            let elapsed = ms(start.elapsed());
            Ok(trace_sample(
                elapsed,
                Some(addr.to_string()),
                synthetic_direct_hop(addr, elapsed, &tool_err),
            ))
        }
        Ok(Err(e)) => Err(ProbeFailure {
            error: ProbeError::Network(format!("direct dial failed after {tool_err}: {e}")),
            partial: Some(ProbeDetail::Trace(TraceDetail::default())),
            remote_addr: Some(addr.to_string()),
        }),
        Err(_) => Err(ProbeFailure {
            error: ProbeError::Network(format!("direct dial timed out after {tool_err}")),
            partial: Some(ProbeDetail::Trace(TraceDetail::default())),
            remote_addr: Some(addr.to_string()),
        }),
    }
}

async fn degrade_udp(addr: SocketAddr, start: Instant, tool_err: ProbeError) -> ProbeResult {
    let bind: SocketAddr = if addr.is_ipv4() {
        "0.0.0.0:0".parse().expect("ipv4 wildcard")
    } else {
        "[::]:0".parse().expect("ipv6 wildcard")
    };
    let attempt = async {
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(addr).await?;
        socket.send(b"PING").await?;
        Ok::<(), std::io::Error>(())
    };
    match attempt.await {
        Ok(()) => {
            let elapsed = ms(start.elapsed());
            Ok(trace_sample(
                elapsed,
                Some(addr.to_string()),
                synthetic_direct_hop(addr, elapsed, &tool_err),
            ))
        }
        Err(e) => Err(ProbeFailure {
            error: ProbeError::Network(format!("direct dial failed after {tool_err}: {e}")),
            partial: Some(ProbeDetail::Trace(TraceDetail::default())),
            remote_addr: Some(addr.to_string()),
        }),
    }
}

fn synthetic_direct_hop(addr: SocketAddr, elapsed_ms: f64, tool_err: &ProbeError) -> TraceDetail {
    let raw = format!("Direct connection to {addr} successful");
    TraceDetail {
        hops: vec![Hop {
            hop_number: 1,
            ip: Some(addr.ip().to_string()),
            hostname: None,
            latency_ms: Some(elapsed_ms),
            timeout: false,
            raw: raw.clone(),
        }],
        route_info: Some(format!("path discovery degraded ({tool_err}); {raw}")),
        http_details: None,
        tls_details: None,
    }
}
