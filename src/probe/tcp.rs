//! TCP probe engine: raw dial timing, TLS handshake inspection, and SSH
//! reachability via banner exchange.

use super::{ms, resolve, tls, ProbeEngine, ProbeFailure, ProbeResult};
use crate::error::ProbeError;
use crate::model::{ProbeDetail, ProbeSample, ProbeSpec, TcpDetail};
use crate::variant::ProtocolVariant;
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// Identification string we present during the SSH exchange.
const SSH_CLIENT_BANNER: &[u8] = b"SSH-2.0-WaddlePerf_1.0\r\n";

/// How long to wait for the server's SSH identification line.
const SSH_BANNER_TIMEOUT: Duration = Duration::from_secs(5);

/// Marker reported on successful SSH reachability; the probe tests the
/// service, not credentials.
const SSH_REACHABLE_NOTE: &str = "SSH service reachable; authentication not attempted";

pub struct TcpProbe;

#[async_trait]
impl ProbeEngine for TcpProbe {
    async fn run_once(&self, spec: &ProbeSpec, _cancel: &CancellationToken) -> ProbeResult {
        let port = spec.target.port.unwrap_or(80);
        let (addr, _) = resolve(&spec.target.host, port).await?;
        let remote = addr.to_string();

        let start = Instant::now();
        let stream = TcpStream::connect(addr).await.map_err(|e| ProbeFailure {
            error: ProbeError::Network(format!("connect failed: {e}")),
            partial: Some(ProbeDetail::Tcp(TcpDetail::default())),
            remote_addr: Some(remote.clone()),
        })?;
        let dial = start.elapsed();

        match spec.variant {
            ProtocolVariant::TcpRaw => {
                // Latency is the dial duration; close right away.
                drop(stream);
                Ok(ProbeSample {
                    latency_ms: ms(dial),
                    remote_addr: Some(remote),
                    detail: ProbeDetail::Tcp(TcpDetail {
                        connected: true,
                        ..Default::default()
                    }),
                    note: None,
                    native_stats: None,
                })
            }
            ProtocolVariant::TcpTls => {
                tls_handshake(spec, stream, remote, start, dial).await
            }
            ProtocolVariant::Ssh => ssh_exchange(stream, remote, start).await,
            other => Err(ProbeFailure::new(ProbeError::Validation(format!(
                "variant {other} is not a TCP probe"
            )))),
        }
    }
}

async fn tls_handshake(
    spec: &ProbeSpec,
    stream: TcpStream,
    remote: String,
    start: Instant,
    dial: Duration,
) -> ProbeResult {
    let connected_partial = || TcpDetail {
        connected: true,
        ..Default::default()
    };

    let config = tls::client_config(spec.insecure_skip_verify, &[]).map_err(|e| ProbeFailure {
        error: e,
        partial: Some(ProbeDetail::Tcp(connected_partial())),
        remote_addr: Some(remote.clone()),
    })?;

    let handshake_start = Instant::now();
    let tls_stream = tls::handshake(stream, &spec.target.host, config)
        .await
        .map_err(|e| ProbeFailure {
            error: e,
            partial: Some(ProbeDetail::Tcp(connected_partial())),
            remote_addr: Some(remote.clone()),
        })?;
    let handshake = handshake_start.elapsed();

    let negotiated = tls::connection_details(&tls_stream, &spec.target.host);
    drop(tls_stream);

    Ok(ProbeSample {
        latency_ms: ms(start.elapsed()),
        remote_addr: Some(remote),
        detail: ProbeDetail::Tcp(TcpDetail {
            connected: true,
            handshake_ms: Some(ms(handshake)),
            tls_version: negotiated.tls_version,
            tls_cipher: negotiated.cipher_suite,
            ssh_server_version: None,
        }),
        note: None,
        native_stats: None,
    })
}

async fn ssh_exchange(mut stream: TcpStream, remote: String, start: Instant) -> ProbeResult {
    let connected_partial = || TcpDetail {
        connected: true,
        ..Default::default()
    };

    // Both sides send their identification line independently (RFC 4253 §4.2),
    // so writing first is fine.
    stream
        .write_all(SSH_CLIENT_BANNER)
        .await
        .map_err(|e| ProbeFailure {
            error: ProbeError::Network(format!("failed to send SSH banner: {e}")),
            partial: Some(ProbeDetail::Tcp(connected_partial())),
            remote_addr: Some(remote.clone()),
        })?;

    let mut buf = [0u8; 256];
    let mut collected = Vec::new();
    let read_result = tokio::time::timeout(SSH_BANNER_TIMEOUT, async {
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            collected.extend_from_slice(&buf[..n]);
            if collected.contains(&b'\n') || collected.len() >= 255 {
                break;
            }
        }
        Ok::<(), std::io::Error>(())
    })
    .await;

    let latency = start.elapsed();
    drop(stream);

    match read_result {
        Err(_) => Err(ProbeFailure {
            error: ProbeError::Protocol("timed out waiting for SSH banner".into()),
            partial: Some(ProbeDetail::Tcp(connected_partial())),
            remote_addr: Some(remote),
        }),
        Ok(Err(e)) => Err(ProbeFailure {
            error: ProbeError::Network(format!("failed to read SSH banner: {e}")),
            partial: Some(ProbeDetail::Tcp(connected_partial())),
            remote_addr: Some(remote),
        }),
        Ok(Ok(())) => {
            let banner = String::from_utf8_lossy(&collected);
            let line = banner.lines().next().unwrap_or("").trim().to_string();
            if line.starts_with("SSH-") {
                Ok(ProbeSample {
                    latency_ms: ms(latency),
                    remote_addr: Some(remote),
                    detail: ProbeDetail::Tcp(TcpDetail {
                        connected: true,
                        ssh_server_version: Some(line),
                        ..Default::default()
                    }),
                    note: Some(SSH_REACHABLE_NOTE.to_string()),
                    native_stats: None,
                })
            } else {
                Err(ProbeFailure {
                    error: ProbeError::Protocol(format!(
                        "service did not present an SSH banner (got {line:?})"
                    )),
                    partial: Some(ProbeDetail::Tcp(connected_partial())),
                    remote_addr: Some(remote),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ProbeRequest;
    use crate::probe::run_probe;
    use crate::variant::ProtocolFamily;
    use tokio::net::TcpListener;

    fn spec(addr: std::net::SocketAddr, variant: &str, count: u32) -> ProbeSpec {
        let req = ProbeRequest {
            target: addr.to_string(),
            protocol_variant: Some(variant.into()),
            timeout_seconds: Some(5),
            count: Some(count),
            ..Default::default()
        };
        ProbeSpec::from_request(ProtocolFamily::Tcp, &req).unwrap()
    }

    async fn listener() -> (TcpListener, std::net::SocketAddr) {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = l.local_addr().unwrap();
        (l, addr)
    }

    #[tokio::test]
    async fn raw_dial_succeeds_and_closes() {
        let (l, addr) = listener().await;
        tokio::spawn(async move {
            loop {
                let Ok((_s, _)) = l.accept().await else { break };
            }
        });
        let report = run_probe(&TcpProbe, &spec(addr, "raw", 3), &CancellationToken::new()).await;
        assert!(report.success);
        let v = serde_json::to_value(&report).unwrap();
        assert_eq!(v["connected"], true);
        assert!(report.min_latency_ms <= report.latency_ms);
        assert!(report.latency_ms <= report.max_latency_ms);
        assert!(report.jitter_ms >= 0.0);
    }

    #[tokio::test]
    async fn raw_dial_refused_is_a_network_failure() {
        let addr = {
            let (l, addr) = listener().await;
            drop(l);
            addr
        };
        let report = run_probe(&TcpProbe, &spec(addr, "raw", 1), &CancellationToken::new()).await;
        assert!(!report.success);
        assert_eq!(report.error_code, Some("network"));
    }

    #[tokio::test]
    async fn ssh_banner_marks_reachable_with_note() {
        let (l, addr) = listener().await;
        tokio::spawn(async move {
            if let Ok((mut s, _)) = l.accept().await {
                use tokio::io::AsyncWriteExt;
                let _ = s.write_all(b"SSH-2.0-OpenSSH_9.6\r\n").await;
                // Hold the socket open briefly like a real sshd awaiting KEX.
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        });
        let report = run_probe(&TcpProbe, &spec(addr, "ssh", 1), &CancellationToken::new()).await;
        assert!(report.success);
        assert_eq!(report.error.as_deref(), Some(SSH_REACHABLE_NOTE));
        let v = serde_json::to_value(&report).unwrap();
        assert_eq!(v["connected"], true);
        assert_eq!(v["ssh_server_version"], "SSH-2.0-OpenSSH_9.6");
    }

    #[tokio::test]
    async fn non_ssh_service_is_a_protocol_failure() {
        let (l, addr) = listener().await;
        tokio::spawn(async move {
            if let Ok((mut s, _)) = l.accept().await {
                use tokio::io::AsyncWriteExt;
                let _ = s.write_all(b"220 smtp.example.com ESMTP\r\n").await;
            }
        });
        let report = run_probe(&TcpProbe, &spec(addr, "ssh", 1), &CancellationToken::new()).await;
        assert!(!report.success);
        assert_eq!(report.error_code, Some("protocol"));
        // The dial itself worked; that much is preserved.
        let v = serde_json::to_value(&report).unwrap();
        assert_eq!(v["connected"], true);
    }

    #[tokio::test]
    async fn tls_against_plaintext_listener_fails_with_protocol_error() {
        let (l, addr) = listener().await;
        tokio::spawn(async move {
            if let Ok((mut s, _)) = l.accept().await {
                use tokio::io::AsyncWriteExt;
                let _ = s.write_all(b"not a tls server\r\n").await;
            }
        });
        let report = run_probe(&TcpProbe, &spec(addr, "tls", 1), &CancellationToken::new()).await;
        assert!(!report.success);
        assert_eq!(report.error_code, Some("protocol"));
        let v = serde_json::to_value(&report).unwrap();
        assert_eq!(v["connected"], true);
    }
}
