//! End-to-end smoke test driving the engine over a real loopback QUIC
//! connection: a synthesized client performs the control-stream handshake,
//! issues an extended-CONNECT, and the server accepts it into a session.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Buf;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use webtransport_proto::{ConnectRequest, Frame, SERVER_SETTINGS_BYTES};

use crate::{wire, CertOptions, CertRing, Server, ServerBuilder};

/// Accepts any certificate. Fine for a loopback test talking to a
/// certificate we just generated ourselves; never use this against a real
/// peer.
#[derive(Debug)]
struct AcceptAnyCert(Arc<rustls::crypto::CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCert {
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
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

fn test_client_endpoint() -> quinn::Endpoint {
    let provider = crate::crypto::default_provider();
    let verifier = Arc::new(AcceptAnyCert(provider.clone()));

    let mut crypto = rustls::ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .unwrap()
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();
    crypto.alpn_protocols = vec![crate::ALPN.to_vec()];

    let quic_crypto = quinn::crypto::rustls::QuicClientConfig::try_from(crypto).unwrap();
    let client_config = quinn::ClientConfig::new(Arc::new(quic_crypto));

    let mut endpoint = quinn::Endpoint::client("127.0.0.1:0".parse().unwrap()).unwrap();
    endpoint.set_default_client_config(client_config);
    endpoint
}

fn test_server() -> (Server, SocketAddr) {
    let ring = Arc::new(CertRing::new(CertOptions {
        dns_names: vec!["localhost".to_string()],
        ..CertOptions::default()
    }));
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let server = ServerBuilder::new(addr).with_cert_ring(ring).unwrap();
    let local_addr = server.local_addr().unwrap();
    (server, local_addr)
}

fn connect_request_bytes(version: &str) -> Vec<u8> {
    let request = ConnectRequest {
        authority: "localhost".to_string(),
        path: "/test".to_string(),
        origin: "https://example".to_string(),
        version: version.to_string(),
    };
    let mut buf = Vec::new();
    request.encode(&mut buf);
    buf
}

#[tokio::test]
async fn happy_path_session_setup() {
    let (mut server, addr) = test_server();
    let client = test_client_endpoint();

    let server_task = tokio::spawn(async move {
        let conn = tokio::time::timeout(Duration::from_secs(5), server.accept())
            .await
            .expect("server accept timed out")
            .expect("connection");

        let request = tokio::time::timeout(Duration::from_secs(5), conn.accept_request())
            .await
            .expect("accept_request timed out")
            .expect("request");

        assert_eq!(request.authority(), "localhost");
        assert_eq!(request.path(), "/test");
        assert_eq!(request.origin(), "https://example");
        assert_eq!(request.version(), "02");

        let session = request.accept().await.expect("accept");
        // The client's first bidirectional stream, so stream id 0.
        assert_eq!(session.id(), 0);
    });

    let client_task = tokio::spawn(async move {
        let connecting = client.connect(addr, "localhost").unwrap();
        let conn = connecting.await.expect("client handshake");

        let mut control = conn.open_uni().await.unwrap();
        control.write_all(&SERVER_SETTINGS_BYTES).await.unwrap();

        // The server's own control stream, carrying its SETTINGS frame.
        let mut peer_control = conn.accept_uni().await.unwrap();
        let mut peer_settings = vec![0u8; SERVER_SETTINGS_BYTES.len()];
        tokio::io::AsyncReadExt::read_exact(&mut peer_control, &mut peer_settings)
            .await
            .unwrap();
        assert_eq!(peer_settings, SERVER_SETTINGS_BYTES);

        let (mut send, mut recv) = conn.open_bi().await.unwrap();
        send.write_all(&connect_request_bytes("02")).await.unwrap();

        let (typ, len) = wire::read_frame_header(&mut recv).await.unwrap();
        assert_eq!(typ, Frame::HEADERS);

        let mut body = vec![0u8; len as usize];
        wire::read_exact(&mut recv, &mut body).await.unwrap();

        let mut cursor = body.as_slice();
        assert_eq!(cursor.get_u8(), 0);
        assert_eq!(cursor.get_u8(), 0);
        // indexed static field 25 (`:status 200`): top two bits `11`, 6-bit
        // index in the low bits.
        assert_eq!(cursor.get_u8(), 0xc0 | 25);

        send.finish().unwrap();
        conn.close(0u64.try_into().unwrap(), b"done");
    });

    let (server_res, client_res) = tokio::join!(server_task, client_task);
    server_res.expect("server task panicked");
    client_res.expect("client task panicked");
}
