//! Binds a [`quinn::Endpoint`] to a [`CertRing`] and yields [`Connection`]s.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;

use crate::{cert::CertRing, crypto, Connection, Error};

/// Presents whatever certificate [`CertRing`] currently considers current on
/// every handshake, so a long-running listener never needs to restart to
/// rotate in a fresh one.
struct CertResolver {
    ring: Arc<CertRing>,
}

impl std::fmt::Debug for CertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertResolver").finish()
    }
}

impl ResolvesServerCert for CertResolver {
    fn resolve(&self, _client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        let issued = self.ring.get_certificate();
        let provider = crypto::default_provider();
        let key = provider
            .key_provider
            .load_private_key(issued.key.clone_key())
            .ok()?;
        Some(Arc::new(CertifiedKey::new(
            vec![(*issued.chain).clone()],
            key,
        )))
    }
}

/// Constructs a [`Server`] from a listen address and a certificate ring.
pub struct ServerBuilder {
    addr: SocketAddr,
}

impl ServerBuilder {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    /// Bind the endpoint, presenting certificates from `ring` and rotating
    /// them transparently as it does.
    pub fn with_cert_ring(self, ring: Arc<CertRing>) -> Result<Server, Error> {
        let provider = crypto::default_provider();

        let mut config = rustls::ServerConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(CertResolver { ring }));
        config.alpn_protocols = vec![crate::ALPN.to_vec()];

        let quic_crypto: quinn::crypto::rustls::QuicServerConfig = config
            .try_into()
            .map_err(|_| Error::InvalidOperation("rustls config missing an initial cipher suite"))?;
        let server_config = quinn::ServerConfig::with_crypto(Arc::new(quic_crypto));

        let endpoint = quinn::Endpoint::server(server_config, self.addr)?;
        Ok(Server::new(endpoint))
    }
}

/// A bound QUIC endpoint accepting HTTP/3 + WebTransport connections.
pub struct Server {
    endpoint: quinn::Endpoint,
    accepting: FuturesUnordered<BoxFuture<'static, Option<Connection>>>,
}

impl Server {
    pub fn new(endpoint: quinn::Endpoint) -> Self {
        Self {
            endpoint,
            accepting: FuturesUnordered::new(),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.endpoint.local_addr()
    }

    /// Accept the next fully-established HTTP/3 connection. Connections that
    /// fail their handshake are logged and skipped; the server keeps running.
    pub async fn accept(&mut self) -> Option<Connection> {
        loop {
            tokio::select! {
                incoming = self.endpoint.accept() => {
                    let Some(incoming) = incoming else { return None };
                    self.accepting.push(Box::pin(async move {
                        let conn = match incoming.await {
                            Ok(conn) => conn,
                            Err(e) => {
                                log::debug!("quic handshake failed: {e}");
                                return None;
                            }
                        };
                        match Connection::accept(conn).await {
                            Ok(conn) => Some(conn),
                            Err(e) => {
                                log::debug!("h3 handshake failed: {e}");
                                None
                            }
                        }
                    }));
                }
                Some(res) = self.accepting.next(), if !self.accepting.is_empty() => {
                    if let Some(conn) = res {
                        return Some(conn);
                    }
                }
            }
        }
    }
}
