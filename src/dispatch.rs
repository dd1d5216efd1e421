//! Probe dispatcher: validate, normalize, route, enforce the deadline.
//!
//! Validation failures never reach an engine and map to HTTP 4xx upstream;
//! engine failures come back as `success=false` reports and are not
//! dispatcher-level errors.

use crate::error::ProbeError;
use crate::model::{ProbeReport, ProbeRequest, ProbeSpec};
use crate::probe::{self, HttpProbe, IcmpProbe, TcpProbe, TraceProbe, UdpProbe};
use crate::runner::{CommandRunner, SystemCommandRunner};
use crate::variant::ProtocolFamily;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct Dispatcher {
    runner: Arc<dyn CommandRunner>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::with_runner(Arc::new(SystemCommandRunner))
    }

    pub fn with_runner(runner: Arc<dyn CommandRunner>) -> Self {
        Dispatcher { runner }
    }

    /// Dispatch one probe request.
    ///
    /// `Err` is returned only for validation failures; everything an engine
    /// reports (including total failure) is an `Ok` report.
    pub async fn dispatch(
        &self,
        family: ProtocolFamily,
        request: &ProbeRequest,
        cancel: CancellationToken,
    ) -> Result<ProbeReport, ProbeError> {
        let spec = ProbeSpec::from_request(family, request)?;
        debug!(
            target = %spec.target.endpoint(),
            family = %spec.family,
            variant = %spec.variant,
            count = spec.count,
            "dispatching probe"
        );

        let report = match family {
            ProtocolFamily::Http => probe::run_probe(&HttpProbe, &spec, &cancel).await,
            ProtocolFamily::Tcp => probe::run_probe(&TcpProbe, &spec, &cancel).await,
            ProtocolFamily::Udp => probe::run_probe(&UdpProbe, &spec, &cancel).await,
            ProtocolFamily::Icmp => {
                probe::run_probe(&IcmpProbe::new(self.runner.clone()), &spec, &cancel).await
            }
            ProtocolFamily::Trace => {
                probe::run_probe(&TraceProbe::new(self.runner.clone()), &spec, &cancel).await
            }
        };

        if !report.success {
            // Caller-driven cancellation is expected, not an error condition.
            if report.error_code == Some("cancelled") {
                debug!(target = %report.target, "probe cancelled by caller");
            } else {
                warn!(
                    target = %report.target,
                    family = %spec.family,
                    variant = %spec.variant,
                    error = report.error.as_deref().unwrap_or("unknown"),
                    "probe failed"
                );
            }
        }

        Ok(report)
    }
}
