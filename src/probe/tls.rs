//! Shared rustls plumbing for the TLS-touching probes.

use crate::error::ProbeError;
use crate::model::TlsTraceDetails;
use rustls::crypto::ring;
use rustls::ClientConfig;
use rustls_pki_types::ServerName;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

/// Build a client config with the platform trust store. ALPN is pinned by
/// the caller; verification is on unless the request explicitly opted out.
pub(crate) fn client_config(
    insecure_skip_verify: bool,
    alpn: &[&[u8]],
) -> Result<ClientConfig, ProbeError> {
    let provider = Arc::new(ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| ProbeError::Protocol(format!("TLS setup failed: {e}")))?;

    let mut config = if insecure_skip_verify {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::NoVerification::new(provider)))
            .with_no_client_auth()
    } else {
        let mut roots = rustls::RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        for cert in native.certs {
            let _ = roots.add(cert);
        }
        if roots.is_empty() {
            return Err(ProbeError::Protocol(
                "no trusted root certificates available".into(),
            ));
        }
        builder
            .with_root_certificates(roots)
            .with_no_client_auth()
    };

    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Ok(config)
}

/// Perform a TLS handshake over an established TCP stream.
pub(crate) async fn handshake(
    tcp: TcpStream,
    host: &str,
    config: ClientConfig,
) -> Result<TlsStream<TcpStream>, ProbeError> {
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| ProbeError::Validation(format!("invalid TLS server name {host:?}")))?;
    TlsConnector::from(Arc::new(config))
        .connect(server_name, tcp)
        .await
        .map_err(|e| ProbeError::Protocol(format!("TLS handshake failed: {e}")))
}

/// Spec'd mapping of negotiated versions to display names.
pub(crate) fn version_name(version: rustls::ProtocolVersion) -> &'static str {
    match version {
        rustls::ProtocolVersion::TLSv1_0 => "TLS 1.0",
        rustls::ProtocolVersion::TLSv1_1 => "TLS 1.1",
        rustls::ProtocolVersion::TLSv1_2 => "TLS 1.2",
        rustls::ProtocolVersion::TLSv1_3 => "TLS 1.3",
        _ => "unknown",
    }
}

/// Negotiated connection details, read off the client side of the stream.
pub(crate) fn connection_details(stream: &TlsStream<TcpStream>, host: &str) -> TlsTraceDetails {
    let (_, conn) = stream.get_ref();
    TlsTraceDetails {
        tls_version: conn.protocol_version().map(|v| version_name(v).to_string()),
        cipher_suite: conn
            .negotiated_cipher_suite()
            .map(|s| format!("{:?}", s.suite())),
        server_name: Some(host.to_string()),
        negotiated_protocol: conn
            .alpn_protocol()
            .map(|p| String::from_utf8_lossy(p).into_owned()),
    }
}

mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
    use rustls::DigitallySignedStruct;
    use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
    use std::sync::Arc;

    /// Accept-anything verifier, reachable only through the request's
    /// explicit `insecure_skip_verify` field.
    #[derive(Debug)]
    pub(crate) struct NoVerification {
        provider: Arc<CryptoProvider>,
    }

    impl NoVerification {
        pub(crate) fn new(provider: Arc<CryptoProvider>) -> Self {
            NoVerification { provider }
        }
    }

    impl ServerCertVerifier for NoVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls12_signature(
                message,
                cert,
                dss,
                &self.provider.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls13_signature(
                message,
                cert,
                dss,
                &self.provider.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            self.provider
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_names_follow_the_wire_values() {
        assert_eq!(version_name(rustls::ProtocolVersion::TLSv1_0), "TLS 1.0");
        assert_eq!(version_name(rustls::ProtocolVersion::TLSv1_3), "TLS 1.3");
        assert_eq!(version_name(rustls::ProtocolVersion::SSLv3), "unknown");
    }

    #[test]
    fn alpn_is_carried_into_the_config() {
        let cfg = client_config(true, &[b"h2", b"http/1.1"]).unwrap();
        assert_eq!(cfg.alpn_protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
    }
}
