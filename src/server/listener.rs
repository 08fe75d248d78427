//! The plain-HTTP listener (typically port 80): always wraps the inner
//! handler in [`ChallengeLayer`] so HTTP-01 validation requests are
//! answered, and everything else falls through to the inner handler (most
//! deployments redirect it to HTTPS, which is the inner handler's call, not
//! this crate's).

use std::net::SocketAddr;
use std::sync::Arc;

use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tower::{Layer, Service};
use tracing::warn;

use crate::acme::{ChallengeContext, ChallengeLayer};

use super::handler::Handler;

pub struct PlainHttpServer<H: ?Sized> {
    handler: Arc<H>,
    challenge_ctx: ChallengeContext,
    bind_addr: SocketAddr,
}

impl<H: Handler + ?Sized> PlainHttpServer<H> {
    pub fn new(handler: Arc<H>, challenge_ctx: ChallengeContext, bind_addr: SocketAddr) -> Self {
        Self {
            handler,
            challenge_ctx,
            bind_addr,
        }
    }

    pub async fn run(self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        tracing::info!(addr = %self.bind_addr, "plain HTTP listener bound");

        loop {
            let (stream, peer) = listener.accept().await?;
            let handler = self.handler.clone();
            let challenge_ctx = self.challenge_ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, handler, challenge_ctx).await {
                    warn!(peer = %peer, error = %e, "HTTP connection failed");
                }
            });
        }
    }
}

async fn handle_connection<H: Handler + ?Sized>(
    stream: tokio::net::TcpStream,
    handler: Arc<H>,
    challenge_ctx: ChallengeContext,
) -> anyhow::Result<()> {
    let service = tower::service_fn(move |req| {
        let handler = handler.clone();
        async move { Ok::<_, std::convert::Infallible>(handler.handle(req).await) }
    });
    let service = ChallengeLayer::new(challenge_ctx).layer(service);

    let io = TokioIo::new(stream);
    hyper::server::conn::http1::Builder::new()
        .serve_connection(
            io,
            hyper::service::service_fn(move |req| {
                let mut service = service.clone();
                async move { tower::Service::call(&mut service, req).await }
            }),
        )
        .await?;
    Ok(())
}
