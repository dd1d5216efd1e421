//! ICMP probe engine.
//!
//! Shells out to the platform `ping`/`traceroute` binaries; in the
//! deployment image those carry `CAP_NET_RAW` file capabilities while the
//! server itself stays unprivileged. Ping parses all N echo replies from a
//! single invocation, so this engine is multi-sample native and the outer
//! iteration wrapper runs it exactly once.

use super::{ms, trace, ProbeEngine, ProbeFailure, ProbeResult};
use crate::error::ProbeError;
use crate::model::{IcmpDetail, NativeStats, ProbeDetail, ProbeSample, ProbeSpec};
use crate::runner::{CommandRunner, CommandSpec};
use crate::stats;
use crate::variant::ProtocolVariant;
use async_trait::async_trait;
use regex::Regex;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Matches `time=12.3 ms` (Unix) and `time=14ms` / `time<1ms` (Windows).
static ECHO_TIME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[tT]ime[=<](\d+(?:\.\d+)?)\s*ms").expect("echo regex"));

/// Per-reply wait when the request does not set a timeout, in seconds.
const DEFAULT_REPLY_WAIT: u64 = 5;

pub struct IcmpProbe {
    runner: Arc<dyn CommandRunner>,
}

impl IcmpProbe {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        IcmpProbe { runner }
    }
}

#[async_trait]
impl ProbeEngine for IcmpProbe {
    fn default_timeout(&self, spec: &ProbeSpec) -> Duration {
        // One silent target costs count * reply-wait.
        Duration::from_secs((spec.count as u64 * DEFAULT_REPLY_WAIT + 10).clamp(30, 300))
    }

    fn multi_sample_native(&self) -> bool {
        true
    }

    async fn run_once(&self, spec: &ProbeSpec, cancel: &CancellationToken) -> ProbeResult {
        match spec.variant {
            ProtocolVariant::Ping => self.ping(spec, cancel).await,
            ProtocolVariant::IcmpTraceroute => self.traceroute(spec, cancel).await,
            other => Err(ProbeFailure::new(ProbeError::Validation(format!(
                "variant {other} is not an ICMP probe"
            )))),
        }
    }
}

fn reply_wait_secs(spec: &ProbeSpec) -> u64 {
    spec.timeout
        .map(|t| t.as_secs().clamp(1, DEFAULT_REPLY_WAIT))
        .unwrap_or(DEFAULT_REPLY_WAIT)
}

fn ping_command(spec: &ProbeSpec, wait_secs: u64) -> CommandSpec {
    let count = spec.count.to_string();
    let host = spec.target.host.clone();
    let mut args: Vec<String> = if cfg!(target_os = "windows") {
        vec![
            "-n".into(),
            count,
            "-w".into(),
            (wait_secs * 1000).to_string(),
        ]
    } else if cfg!(target_os = "macos") {
        vec![
            "-c".into(),
            count,
            "-W".into(),
            (wait_secs * 1000).to_string(),
        ]
    } else {
        vec!["-c".into(), count, "-W".into(), wait_secs.to_string()]
    };
    if let Some(size) = spec.packet_size {
        if cfg!(target_os = "windows") {
            args.push("-l".into());
        } else {
            args.push("-s".into());
        }
        args.push(size.to_string());
    }
    args.push(host);
    CommandSpec::new("ping", args)
}

fn traceroute_command(spec: &ProbeSpec, wait_secs: u64) -> CommandSpec {
    let host = spec.target.host.clone();
    if cfg!(target_os = "windows") {
        CommandSpec::new(
            "tracert",
            [
                "-w".into(),
                (wait_secs * 1000).to_string(),
                "-h".into(),
                spec.max_hops.to_string(),
                host,
            ],
        )
    } else {
        CommandSpec::new(
            "traceroute",
            [
                "-w".into(),
                wait_secs.to_string(),
                "-m".into(),
                spec.max_hops.to_string(),
                host,
            ],
        )
    }
}

/// Pull the echo-reply times, in output order, out of combined ping output.
pub(crate) fn parse_echo_times(output: &str) -> Vec<f64> {
    output
        .lines()
        .filter_map(|line| {
            ECHO_TIME
                .captures(line)
                .and_then(|c| c[1].parse::<f64>().ok())
        })
        .collect()
}

/// Transmitted count from the ping summary, when present. An interrupted
/// ping sends fewer packets than requested; the summary is authoritative.
pub(crate) fn parse_transmitted(output: &str) -> Option<u32> {
    for line in output.lines() {
        // Unix: "4 packets transmitted, 4 received, ..."
        if let Some(rest) = line.trim().split_once(" packets transmitted") {
            if let Ok(n) = rest.0.trim().parse() {
                return Some(n);
            }
        }
        // Windows: "    Packets: Sent = 4, Received = 4, Lost = 0 ..."
        if let Some(idx) = line.find("Sent = ") {
            let tail = &line[idx + 7..];
            let digits: String = tail.chars().take_while(|c| c.is_ascii_digit()).collect();
            if let Ok(n) = digits.parse() {
                return Some(n);
            }
        }
    }
    None
}

impl IcmpProbe {
    async fn ping(&self, spec: &ProbeSpec, cancel: &CancellationToken) -> ProbeResult {
        let wait = reply_wait_secs(spec);
        let command = ping_command(spec, wait);
        let tool_timeout = Duration::from_secs(spec.count as u64 * wait + 15);

        let output = self
            .runner
            .run(&command, tool_timeout, cancel)
            .await
            .map_err(ProbeError::from)?;

        // Exit code is informational; lossy pings exit nonzero but still
        // carry samples.
        let combined = output.combined();
        let samples = parse_echo_times(&combined);
        let sent = parse_transmitted(&combined)
            .unwrap_or(spec.count)
            .max(samples.len() as u32)
            .max(1);
        let received = (samples.len() as u32).min(sent);
        let loss = ((sent - received) as f64) / (sent as f64) * 100.0;

        let detail = IcmpDetail {
            packets_sent: sent,
            packets_received: received,
            packet_loss_percent: loss,
            hops: None,
        };

        if received == 0 {
            return Err(ProbeFailure {
                error: ProbeError::Network(format!(
                    "no ICMP echo replies from {}",
                    spec.target.host
                )),
                partial: Some(ProbeDetail::Icmp(detail)),
                remote_addr: None,
            });
        }

        let agg = stats::aggregate(&samples);
        Ok(ProbeSample {
            latency_ms: agg.mean_ms,
            remote_addr: None,
            detail: ProbeDetail::Icmp(detail),
            note: None,
            native_stats: Some(agg),
        })
    }

    async fn traceroute(&self, spec: &ProbeSpec, cancel: &CancellationToken) -> ProbeResult {
        let wait = reply_wait_secs(spec);
        let command = traceroute_command(spec, wait);
        let tool_timeout = Duration::from_secs(spec.max_hops as u64 * wait + 30);

        let start = Instant::now();
        let output = self
            .runner
            .run(&command, tool_timeout, cancel)
            .await
            .map_err(ProbeError::from)?;

        let hops = trace::parse_hops(&output.combined(), spec.max_hops);
        if hops.is_empty() {
            return Err(ProbeFailure {
                error: ProbeError::Tool(format!(
                    "traceroute produced no hops (exit code {:?})",
                    output.exit_code
                )),
                partial: Some(ProbeDetail::Icmp(IcmpDetail::default())),
                remote_addr: None,
            });
        }

        let elapsed = ms(start.elapsed());
        Ok(ProbeSample {
            latency_ms: elapsed,
            remote_addr: None,
            detail: ProbeDetail::Icmp(IcmpDetail {
                packets_sent: 0,
                packets_received: 0,
                packet_loss_percent: 0.0,
                hops: Some(hops),
            }),
            note: None,
            native_stats: Some(NativeStats {
                mean_ms: elapsed,
                min_ms: elapsed,
                max_ms: elapsed,
                jitter_ms: 0.0,
                stddev_ms: 0.0,
            }),
        })
    }
}
