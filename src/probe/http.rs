//! HTTP probe engine.
//!
//! The connection is established by hand (DNS, TCP, TLS, then a hyper
//! client conn pinned to the requested HTTP version) so every phase gets its
//! own timing instead of one opaque request duration.

use super::{ms, resolve, tls, ProbeEngine, ProbeFailure, ProbeResult};
use crate::error::ProbeError;
use crate::model::{HttpDetail, ProbeDetail, ProbeSample, ProbeSpec, USER_AGENT};
use crate::variant::ProtocolVariant;
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::client::conn::{http1, http2};
use hyper::{Request, Version};
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

pub struct HttpProbe;

enum Sender {
    H1(http1::SendRequest<Empty<Bytes>>),
    H2(http2::SendRequest<Empty<Bytes>>),
}

#[async_trait]
impl ProbeEngine for HttpProbe {
    fn default_timeout(&self, _spec: &ProbeSpec) -> Duration {
        Duration::from_secs(30)
    }

    async fn run_once(&self, spec: &ProbeSpec, _cancel: &CancellationToken) -> ProbeResult {
        if spec.variant == ProtocolVariant::Http3 {
            return Err(ProbeError::unsupported_http3().into());
        }

        let mut detail = HttpDetail::default();
        let host = spec.target.host.as_str();
        let port = spec.target.port.unwrap_or(443);
        let start = Instant::now();

        let (addr, dns_dur) = resolve(host, port)
            .await
            .map_err(|e| fail(&detail, None, e))?;
        detail.dns_lookup_ms = Some(ms(dns_dur));
        let remote = addr.to_string();

        let connect_start = Instant::now();
        let tcp = TcpStream::connect(addr)
            .await
            .map_err(|e| fail(&detail, Some(&remote), ProbeError::Network(e.to_string())))?;
        detail.tcp_connect_ms = Some(ms(connect_start.elapsed()));
        let _ = tcp.set_nodelay(true);

        let force_h2 = spec.variant == ProtocolVariant::Http2;

        let mut sender = if spec.target.uses_tls() {
            let alpn: &[&[u8]] = if force_h2 { &[b"h2"] } else { &[b"http/1.1"] };
            let config = tls::client_config(spec.insecure_skip_verify, alpn)
                .map_err(|e| fail(&detail, Some(&remote), e))?;
            let tls_start = Instant::now();
            let stream = tls::handshake(tcp, host, config)
                .await
                .map_err(|e| fail(&detail, Some(&remote), e))?;
            detail.tls_handshake_ms = Some(ms(tls_start.elapsed()));
            if force_h2 {
                connect_h2(TokioIo::new(stream))
                    .await
                    .map_err(|e| fail(&detail, Some(&remote), e))?
            } else {
                connect_h1(TokioIo::new(stream))
                    .await
                    .map_err(|e| fail(&detail, Some(&remote), e))?
            }
        } else if force_h2 {
            // Cleartext HTTP/2 needs prior knowledge; no upgrade dance.
            connect_h2(TokioIo::new(tcp))
                .await
                .map_err(|e| fail(&detail, Some(&remote), e))?
        } else {
            connect_h1(TokioIo::new(tcp))
                .await
                .map_err(|e| fail(&detail, Some(&remote), e))?
        };

        let request = build_request(spec, &sender)
            .map_err(|e| fail(&detail, Some(&remote), e))?;

        let mut response = match &mut sender {
            Sender::H1(s) => s.send_request(request).await,
            Sender::H2(s) => s.send_request(request).await,
        }
        .map_err(|e| {
            fail(
                &detail,
                Some(&remote),
                ProbeError::Network(format!("request failed: {e}")),
            )
        })?;
        // The status line is the first response byte on the wire.
        detail.ttfb_ms = Some(ms(start.elapsed()));
        detail.status_code = Some(response.status().as_u16());
        detail.connected_proto = Some(version_label(response.version()).to_string());

        let mut body_bytes = 0u64;
        let body = response.body_mut();
        while let Some(frame) = body.frame().await {
            match frame {
                Ok(frame) => {
                    if let Some(data) = frame.data_ref() {
                        body_bytes += data.len() as u64;
                    }
                }
                Err(e) => {
                    return Err(fail(
                        &detail,
                        Some(&remote),
                        ProbeError::Network(format!("body read failed: {e}")),
                    ));
                }
            }
        }

        let total = start.elapsed();
        detail.total_time_ms = Some(ms(total));
        detail.content_length_bytes = Some(body_bytes);
        if total > Duration::ZERO {
            detail.transfer_speed_mbps =
                Some((body_bytes as f64) * 8.0 / (total.as_secs_f64() * 1_000_000.0));
        }

        let status = response.status().as_u16();
        if !(200..400).contains(&status) {
            return Err(fail(
                &detail,
                Some(&remote),
                ProbeError::Protocol(format!("HTTP status {status}")),
            ));
        }

        Ok(ProbeSample {
            latency_ms: ms(total),
            remote_addr: Some(remote),
            detail: ProbeDetail::Http(detail),
            note: None,
            native_stats: None,
        })
    }
}

fn fail(detail: &HttpDetail, remote: Option<&str>, error: ProbeError) -> ProbeFailure {
    ProbeFailure {
        error,
        partial: Some(ProbeDetail::Http(detail.clone())),
        remote_addr: remote.map(String::from),
    }
}

async fn connect_h1<T>(io: T) -> Result<Sender, ProbeError>
where
    T: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let (sender, conn) = http1::handshake(io)
        .await
        .map_err(|e| ProbeError::Network(format!("HTTP/1.1 handshake failed: {e}")))?;
    tokio::spawn(async move {
        let _ = conn.await;
    });
    Ok(Sender::H1(sender))
}

async fn connect_h2<T>(io: T) -> Result<Sender, ProbeError>
where
    T: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let (sender, conn) = http2::handshake(TokioExecutor::new(), io)
        .await
        .map_err(|e| ProbeError::Network(format!("HTTP/2 handshake failed: {e}")))?;
    tokio::spawn(async move {
        let _ = conn.await;
    });
    Ok(Sender::H2(sender))
}

fn build_request(
    spec: &ProbeSpec,
    sender: &Sender,
) -> Result<Request<Empty<Bytes>>, ProbeError> {
    let method = hyper::Method::from_bytes(spec.method.as_bytes())
        .map_err(|_| ProbeError::Validation(format!("invalid method {:?}", spec.method)))?;

    let builder = match sender {
        // Origin-form path plus a Host header for HTTP/1.1.
        Sender::H1(_) => Request::builder()
            .method(method)
            .uri(spec.target.path.as_deref().unwrap_or("/"))
            .header(hyper::header::HOST, spec.target.endpoint()),
        // Absolute URI so hyper derives :scheme/:authority for HTTP/2.
        Sender::H2(_) => Request::builder()
            .method(method)
            .uri(spec.target.http_url()),
    };

    builder
        .header(hyper::header::USER_AGENT, USER_AGENT)
        .body(Empty::new())
        .map_err(|e| ProbeError::Validation(format!("failed to build request: {e}")))
}

fn version_label(version: Version) -> &'static str {
    match version {
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_11 => "HTTP/1.1",
        Version::HTTP_2 => "HTTP/2.0",
        Version::HTTP_3 => "HTTP/3.0",
        _ => "HTTP/0.9",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ProbeRequest;
    use crate::probe::run_probe;
    use crate::variant::ProtocolFamily;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// One-shot HTTP/1.1 server returning a canned response.
    async fn serve_once(response: &'static str) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf).await;
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });
        addr
    }

    fn http1_spec(addr: std::net::SocketAddr) -> ProbeSpec {
        let req = ProbeRequest {
            target: format!("http://{addr}/"),
            protocol_variant: Some("http1".into()),
            timeout_seconds: Some(5),
            ..Default::default()
        };
        ProbeSpec::from_request(ProtocolFamily::Http, &req).unwrap()
    }

    #[tokio::test]
    async fn http1_probe_records_all_phases() {
        let addr =
            serve_once("HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello")
                .await;
        let report = run_probe(&HttpProbe, &http1_spec(addr), &CancellationToken::new()).await;
        assert!(report.success, "error: {:?}", report.error);
        let v = serde_json::to_value(&report).unwrap();
        assert_eq!(v["status_code"], 200);
        assert_eq!(v["connected_proto"], "HTTP/1.1");
        assert_eq!(v["content_length_bytes"], 5);

        let ttfb = v["ttfb_ms"].as_f64().unwrap();
        let total = v["total_time_ms"].as_f64().unwrap();
        let dns = v["dns_lookup_ms"].as_f64().unwrap();
        let connect = v["tcp_connect_ms"].as_f64().unwrap();
        assert!(ttfb <= total);
        assert!(dns + connect <= total + 0.5);
        assert!(report.latency_ms > 0.0);
    }

    #[tokio::test]
    async fn http_error_status_fails_but_keeps_timings() {
        let addr = serve_once(
            "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;
        let report = run_probe(&HttpProbe, &http1_spec(addr), &CancellationToken::new()).await;
        assert!(!report.success);
        assert_eq!(report.error_code, Some("protocol"));
        let v = serde_json::to_value(&report).unwrap();
        assert_eq!(v["status_code"], 503);
        assert!(v["total_time_ms"].as_f64().unwrap() > 0.0);
    }

    #[tokio::test]
    async fn connection_refused_is_a_network_error_with_dns_timing() {
        // Bind then drop to get a port nothing listens on.
        let addr = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };
        let report = run_probe(&HttpProbe, &http1_spec(addr), &CancellationToken::new()).await;
        assert!(!report.success);
        assert_eq!(report.error_code, Some("network"));
        let v = serde_json::to_value(&report).unwrap();
        assert!(v["dns_lookup_ms"].is_number());
        assert!(v.get("status_code").is_none());
    }

    #[tokio::test]
    async fn http3_fails_fast() {
        let req = ProbeRequest {
            target: "https://example.com".into(),
            protocol_variant: Some("http3".into()),
            ..Default::default()
        };
        let spec = ProbeSpec::from_request(ProtocolFamily::Http, &req).unwrap();
        let start = std::time::Instant::now();
        let report = run_probe(&HttpProbe, &spec, &CancellationToken::new()).await;
        assert!(!report.success);
        assert_eq!(report.error_code, Some("unsupported"));
        assert_eq!(report.error.as_deref(), Some("HTTP/3 is not supported yet"));
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
