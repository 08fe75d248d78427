//! The TLS listener: accepts connections, resolves a certificate per
//! connection via [`CertificateResolver::resolve_certificate`], and hands
//! the handshake to `tokio_rustls`. Binds once and spawns one task per
//! accepted connection, using `tokio_rustls::LazyConfigAcceptor` so the
//! ClientHello's SNI can be inspected before a `rustls::ServerConfig` is
//! built, since `resolve_certificate` is async and `ResolvesServerCert` is
//! not.

use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper_util::rt::TokioIo;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::LazyConfigAcceptor;
use tower::{Layer, Service};
use tracing::{error, warn};

use crate::acme::{AcmeError, CertEntry, CertificateResolver, ChallengeLayer};

use super::handler::Handler;

fn load_chain(pem: &str) -> Result<Vec<CertificateDer<'static>>, AcmeError> {
    let mut reader = Cursor::new(pem.as_bytes());
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| AcmeError::Storage(format!("invalid certificate PEM: {e}")))
}

fn load_key(pem: &str) -> Result<PrivateKeyDer<'static>, AcmeError> {
    let mut reader = Cursor::new(pem.as_bytes());
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| AcmeError::Storage(format!("invalid private key PEM: {e}")))?
        .ok_or_else(|| AcmeError::Storage("no private key found in PEM".into()))
}

fn certified_key_from_entry(entry: &CertEntry) -> Result<Arc<CertifiedKey>, AcmeError> {
    let key_der = load_key(&entry.private_key_pem)?;
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key_der)
        .map_err(|e| AcmeError::Storage(format!("unsupported private key: {e}")))?;
    let chain = load_chain(&entry.certificate_pem)?;
    Ok(Arc::new(CertifiedKey::new(chain, signing_key)))
}

/// A `rustls::server::ResolvesServerCert` that only ever serves the
/// in-memory fast path. For embedding a statically-built `ServerConfig`
/// directly into rustls rather than driving resolution from this crate's
/// own accept loop; never triggers issuance itself.
pub struct CacheOnlyResolver(pub Arc<CertificateResolver>);

impl std::fmt::Debug for CacheOnlyResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CacheOnlyResolver")
    }
}

impl ResolvesServerCert for CacheOnlyResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let name = client_hello.server_name()?;
        let entry = self.0.fast_path(name)?;
        certified_key_from_entry(&entry).ok()
    }
}

fn build_server_config(certified_key: Arc<CertifiedKey>) -> ServerConfig {
    struct Fixed(Arc<CertifiedKey>);
    impl std::fmt::Debug for Fixed {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("Fixed")
        }
    }
    impl ResolvesServerCert for Fixed {
        fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
            Some(self.0.clone())
        }
    }

    ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(Fixed(certified_key)))
}

/// The TLS-terminating listener.
pub struct TlsServer<H: ?Sized> {
    resolver: Arc<CertificateResolver>,
    handler: Arc<H>,
    bind_addr: SocketAddr,
}

impl<H: Handler + ?Sized> TlsServer<H> {
    pub fn new(resolver: Arc<CertificateResolver>, handler: Arc<H>, bind_addr: SocketAddr) -> Self {
        Self {
            resolver,
            handler,
            bind_addr,
        }
    }

    pub async fn run(self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        tracing::info!(addr = %self.bind_addr, "TLS listener bound");

        loop {
            let (stream, peer) = listener.accept().await?;
            let resolver = self.resolver.clone();
            let handler = self.handler.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, resolver, handler).await {
                    warn!(peer = %peer, error = %e, "TLS connection failed");
                }
            });
        }
    }
}

async fn handle_connection<H: Handler + ?Sized>(
    stream: TcpStream,
    resolver: Arc<CertificateResolver>,
    handler: Arc<H>,
) -> anyhow::Result<()> {
    let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream);
    let start = acceptor.await?;

    let server_name = start
        .client_hello()
        .server_name()
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("ClientHello carried no SNI server name"))?;

    let entry = resolver.resolve_certificate(&server_name).await?;
    let certified_key = certified_key_from_entry(&entry)?;
    let config = Arc::new(build_server_config(certified_key));

    let tls_stream = start.into_stream(config).await?;

    let challenge_ctx = crate::acme::ChallengeContext {
        store: resolver.challenges.clone(),
        account_key: resolver.account_key_slot.clone(),
    };

    let service = tower::service_fn(move |req| {
        let handler = handler.clone();
        async move { Ok::<_, std::convert::Infallible>(handler.handle(req).await) }
    });
    let service = ChallengeLayer::over_tls(challenge_ctx).layer(service);

    let io = TokioIo::new(tls_stream);
    let conn = hyper::server::conn::http1::Builder::new().serve_connection(
        io,
        hyper::service::service_fn(move |req| {
            let mut service = service.clone();
            async move { tower::Service::call(&mut service, req).await }
        }),
    );

    if let Err(e) = conn.await {
        error!(error = %e, "connection error");
    }

    Ok(())
}
