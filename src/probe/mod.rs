//! Probe engines, one per protocol family, behind a single `ProbeEngine`
//! contract, plus the iteration wrapper that turns single-shot engines into
//! N-sample aggregates.

mod http;
mod icmp;
mod tcp;
mod tls;
mod trace;
mod udp;

pub use http::HttpProbe;
pub use icmp::IcmpProbe;
pub use tcp::TcpProbe;
pub use trace::TraceProbe;
pub use udp::UdpProbe;

use crate::error::ProbeError;
use crate::model::{ProbeDetail, ProbeReport, ProbeSample, ProbeSpec};
use crate::stats;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Sleep between iterations of a multi-count probe.
const ITERATION_GAP: Duration = Duration::from_millis(100);

/// A failed iteration. Timings collected before the error are preserved so
/// a fully failed aggregate still carries diagnostics.
#[derive(Debug)]
pub struct ProbeFailure {
    pub error: ProbeError,
    pub partial: Option<ProbeDetail>,
    pub remote_addr: Option<String>,
}

impl ProbeFailure {
    pub fn new(error: ProbeError) -> Self {
        ProbeFailure {
            error,
            partial: None,
            remote_addr: None,
        }
    }
}

impl<E: Into<ProbeError>> From<E> for ProbeFailure {
    fn from(e: E) -> Self {
        ProbeFailure::new(e.into())
    }
}

pub type ProbeResult = Result<ProbeSample, ProbeFailure>;

#[async_trait]
pub trait ProbeEngine: Send + Sync {
    /// Applied to the whole dispatch when the request does not set a timeout.
    fn default_timeout(&self, _spec: &ProbeSpec) -> Duration {
        Duration::from_secs(10)
    }

    /// Engines that parse N samples from a single invocation (ICMP ping)
    /// opt out of the outer iteration wrapper.
    fn multi_sample_native(&self) -> bool {
        false
    }

    async fn run_once(&self, spec: &ProbeSpec, cancel: &CancellationToken) -> ProbeResult;
}

/// Run an engine `spec.count` times sequentially and reduce to an aggregate
/// report.
///
/// The deadline covers the whole run, not one iteration: an iteration that
/// cannot finish in time is aborted but earlier samples still count.
/// Cancellation is different — partial data is discarded and a `Cancelled`
/// aggregate is emitted.
pub async fn run_probe(
    engine: &dyn ProbeEngine,
    spec: &ProbeSpec,
    cancel: &CancellationToken,
) -> ProbeReport {
    let timeout = spec.timeout.unwrap_or_else(|| engine.default_timeout(spec));
    let deadline = Instant::now() + timeout;
    let iterations = if engine.multi_sample_native() {
        1
    } else {
        spec.count
    };

    let mut samples: Vec<f64> = Vec::with_capacity(iterations as usize);
    let mut last_success: Option<ProbeSample> = None;
    let mut last_failure: Option<ProbeFailure> = None;
    let mut deadline_hit = false;

    for i in 0..iterations {
        if cancel.is_cancelled() {
            return ProbeReport::failed(spec, &ProbeError::Cancelled);
        }
        let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
            deadline_hit = true;
            break;
        };
        if i > 0 {
            tokio::select! {
                _ = tokio::time::sleep(ITERATION_GAP) => {}
                _ = cancel.cancelled() => {
                    return ProbeReport::failed(spec, &ProbeError::Cancelled);
                }
            }
        }

        let outcome = tokio::select! {
            r = engine.run_once(spec, cancel) => Some(r),
            _ = cancel.cancelled() => None,
            _ = tokio::time::sleep(remaining) => {
                deadline_hit = true;
                break;
            }
        };
        let Some(outcome) = outcome else {
            return ProbeReport::failed(spec, &ProbeError::Cancelled);
        };

        match outcome {
            Ok(sample) => {
                samples.push(sample.latency_ms);
                last_success = Some(sample);
            }
            Err(failure) => {
                if matches!(failure.error, ProbeError::Cancelled) {
                    return ProbeReport::failed(spec, &ProbeError::Cancelled);
                }
                debug!(
                    target_host = %spec.target.host,
                    iteration = i + 1,
                    error = %failure.error,
                    "probe iteration failed"
                );
                // Unsupported variants and validation misses cannot change
                // between iterations; fail fast instead of retrying.
                let fatal = matches!(
                    failure.error,
                    ProbeError::Unsupported(_) | ProbeError::Validation(_)
                );
                last_failure = Some(failure);
                if fatal {
                    break;
                }
            }
        }
    }

    let mut report = ProbeReport::empty(spec);

    match last_success {
        Some(sample) => {
            report.success = true;
            report.remote_addr = sample.remote_addr.clone();
            let agg = match sample.native_stats {
                Some(native) => native,
                None => stats::aggregate(&samples),
            };
            report.latency_ms = agg.mean_ms;
            report.min_latency_ms = agg.min_ms;
            report.max_latency_ms = agg.max_ms;
            report.jitter_ms = agg.jitter_ms;
            report.stddev_ms = agg.stddev_ms;
            // Non-latency fields come from the last successful iteration.
            report.error = sample.note;
            report.detail = Some(sample.detail);
        }
        None => {
            let failure = last_failure.unwrap_or_else(|| {
                ProbeFailure::new(ProbeError::Network(if deadline_hit {
                    format!("probe did not complete within {timeout:?}")
                } else {
                    "probe produced no samples".to_string()
                }))
            });
            report.error = Some(failure.error.to_string());
            report.error_code = Some(failure.error.code());
            report.remote_addr = failure.remote_addr;
            report.detail = failure.partial;
        }
    }

    report
}

/// Resolve `host:port` to the first address, as a `ResolutionError` on
/// failure. Returns the elapsed lookup time alongside.
pub(crate) async fn resolve(
    host: &str,
    port: u16,
) -> Result<(SocketAddr, Duration), ProbeError> {
    let start = Instant::now();
    let addr = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| ProbeError::Resolution(format!("failed to resolve {host}: {e}")))?
        .next()
        .ok_or_else(|| ProbeError::Resolution(format!("no addresses found for {host}")))?;
    Ok((addr, start.elapsed()))
}

pub(crate) fn ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ProbeRequest, TcpDetail};
    use crate::variant::ProtocolFamily;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FixedEngine {
        latencies: Vec<f64>,
        calls: AtomicU32,
        fail_first: u32,
    }

    impl FixedEngine {
        fn new(latencies: Vec<f64>) -> Self {
            FixedEngine {
                latencies,
                calls: AtomicU32::new(0),
                fail_first: 0,
            }
        }
    }

    #[async_trait]
    impl ProbeEngine for FixedEngine {
        async fn run_once(&self, _spec: &ProbeSpec, _cancel: &CancellationToken) -> ProbeResult {
            let i = self.calls.fetch_add(1, Ordering::SeqCst);
            if i < self.fail_first {
                return Err(ProbeFailure::new(ProbeError::Network(
                    "connection refused".into(),
                )));
            }
            let latency = self.latencies[(i as usize) % self.latencies.len()];
            Ok(ProbeSample {
                latency_ms: latency,
                remote_addr: Some("192.0.2.1:80".into()),
                detail: ProbeDetail::Tcp(TcpDetail {
                    connected: true,
                    ..Default::default()
                }),
                note: None,
                native_stats: None,
            })
        }
    }

    fn spec(count: u32) -> ProbeSpec {
        let req = ProbeRequest {
            target: "example.com:80".into(),
            count: Some(count),
            ..Default::default()
        };
        ProbeSpec::from_request(ProtocolFamily::Tcp, &req).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn single_iteration_has_zero_jitter_and_stddev() {
        let engine = FixedEngine::new(vec![12.0]);
        let report = run_probe(&engine, &spec(1), &CancellationToken::new()).await;
        assert!(report.success);
        assert_eq!(report.latency_ms, 12.0);
        assert_eq!(report.jitter_ms, 0.0);
        assert_eq!(report.stddev_ms, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn multi_iteration_aggregates_in_order() {
        let engine = FixedEngine::new(vec![10.0, 20.0, 10.0]);
        let report = run_probe(&engine, &spec(3), &CancellationToken::new()).await;
        assert!(report.success);
        assert!(report.min_latency_ms <= report.latency_ms);
        assert!(report.latency_ms <= report.max_latency_ms);
        assert_eq!(report.jitter_ms, 10.0);
        assert_eq!(report.remote_addr.as_deref(), Some("192.0.2.1:80"));
    }

    #[tokio::test(start_paused = true)]
    async fn partial_failures_still_aggregate() {
        let mut engine = FixedEngine::new(vec![15.0]);
        engine.fail_first = 2;
        let report = run_probe(&engine, &spec(4), &CancellationToken::new()).await;
        assert!(report.success);
        assert_eq!(report.latency_ms, 15.0);
        assert!(report.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn all_failures_return_last_error() {
        let mut engine = FixedEngine::new(vec![15.0]);
        engine.fail_first = u32::MAX;
        let report = run_probe(&engine, &spec(3), &CancellationToken::new()).await;
        assert!(!report.success);
        assert_eq!(report.error_code, Some("network"));
        assert!(report.error.unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn pre_cancelled_request_fails_fast() {
        let engine = FixedEngine::new(vec![15.0]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let start = std::time::Instant::now();
        let report = run_probe(&engine, &spec(1000), &cancel).await;
        assert!(!report.success);
        assert_eq!(report.error_code, Some("cancelled"));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    struct HangingEngine;

    #[async_trait]
    impl ProbeEngine for HangingEngine {
        fn default_timeout(&self, _spec: &ProbeSpec) -> Duration {
            Duration::from_millis(200)
        }

        async fn run_once(&self, _spec: &ProbeSpec, _cancel: &CancellationToken) -> ProbeResult {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            unreachable!("probe should have been aborted")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_aborts_hanging_iterations() {
        let report = run_probe(&HangingEngine, &spec(2), &CancellationToken::new()).await;
        assert!(!report.success);
        assert_eq!(report.error_code, Some("network"));
    }
}
