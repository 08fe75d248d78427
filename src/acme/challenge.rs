//! Challenge HTTP responder (C5): a `tower::Layer`/`Service` pair that
//! intercepts `/.well-known/acme-challenge/*` requests in front of whatever
//! inner service is actually serving the site.

use std::path::PathBuf;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use dashmap::DashMap;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use tower::{Layer, Service};

use super::error::Result;
use super::key::{key_authorization, AccountKey};

const WELL_KNOWN_PREFIX: &str = "/.well-known/acme-challenge/";

/// Domain -> HTTP-01 token, held both in memory (for the fast path that
/// answers a challenge the moment it's issued) and persisted to disk so a
/// restart mid-flow can still answer a challenge the ACME server retries.
pub struct ChallengeStore {
    memory: DashMap<String, String>,
    cache_dir: PathBuf,
}

impl ChallengeStore {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self {
            memory: DashMap::new(),
            cache_dir,
        }
    }

    pub async fn put(&self, domain: &str, token: &str) -> Result<()> {
        self.memory.insert(domain.to_string(), token.to_string());
        let path = super::cache::token_path(&self.cache_dir, domain);
        crate::util::atomic_write(&path, token.as_bytes(), 0o600).await?;
        Ok(())
    }

    pub fn remove(&self, domain: &str) {
        self.memory.remove(domain);
    }

    /// The token for `domain`, checking memory first, then falling back to
    /// the on-disk token file so a process restarted mid-challenge can still
    /// answer a retried validation request.
    pub async fn lookup_token(&self, domain: &str) -> Option<String> {
        if let Some(token) = self.memory.get(domain) {
            return Some(token.clone());
        }
        let path = super::cache::token_path(&self.cache_dir, domain);
        tokio::fs::read_to_string(&path).await.ok()
    }
}

type ResponseBody = BoxBody<Bytes, hyper::Error>;

fn box_body(body: Bytes) -> ResponseBody {
    Full::new(body)
        .map_err(|never| match never {})
        .boxed()
}

fn respond(status: StatusCode, body: impl Into<Bytes>) -> Response<ResponseBody> {
    Response::builder()
        .status(status)
        .body(box_body(body.into()))
        .expect("building a static response never fails")
}

/// Shared state the challenge service needs: the token store plus the
/// account key (to recompute the key authorization at serve time — the
/// token alone is what's compared against the URL and persisted to disk;
/// the thumbprint half is always deterministic from the account key, so
/// there's no need to persist the joined string separately).
#[derive(Clone)]
pub struct ChallengeContext {
    pub store: Arc<ChallengeStore>,
    pub account_key: Arc<tokio::sync::RwLock<Option<Arc<AccountKey>>>>,
}

/// Whether a [`ChallengeLayer`] is mounted behind the TLS listener or the
/// plain-HTTP listener. The HTTP-01 challenge is only ever valid over plain
/// HTTP; a request that reaches this layer having already been TLS
/// terminated means the CA (or a client) hit the wrong port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    PlainHttp,
    Tls,
}

pub struct ChallengeLayer {
    ctx: ChallengeContext,
    transport: Transport,
}

impl ChallengeLayer {
    pub fn new(ctx: ChallengeContext) -> Self {
        Self {
            ctx,
            transport: Transport::PlainHttp,
        }
    }

    pub fn over_tls(ctx: ChallengeContext) -> Self {
        Self {
            ctx,
            transport: Transport::Tls,
        }
    }
}

impl<S> Layer<S> for ChallengeLayer {
    type Service = ChallengeService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ChallengeService {
            inner,
            ctx: self.ctx.clone(),
            transport: self.transport,
        }
    }
}

#[derive(Clone)]
pub struct ChallengeService<S> {
    inner: S,
    ctx: ChallengeContext,
    transport: Transport,
}

impl<S> Service<Request<Incoming>> for ChallengeService<S>
where
    S: Service<Request<Incoming>, Response = Response<ResponseBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
{
    type Response = Response<ResponseBody>;
    type Error = S::Error;
    type Future = std::pin::Pin<Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Incoming>) -> Self::Future {
        let path = req.uri().path().to_string();

        if let Some(token) = path.strip_prefix(WELL_KNOWN_PREFIX) {
            if self.transport == Transport::Tls {
                return Box::pin(async move { Ok(respond(StatusCode::IM_A_TEAPOT, "")) });
            }

            let token = token.to_string();
            let ctx = self.ctx.clone();
            let host = host_of(&req);
            return Box::pin(async move { Ok(answer_challenge(ctx, host, token).await) });
        }

        let mut inner = self.inner.clone();
        Box::pin(async move { inner.call(req).await })
    }
}

fn host_of(req: &Request<Incoming>) -> Option<String> {
    req.headers()
        .get(hyper::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(|h| h.split(':').next().unwrap_or(h).to_string())
        .or_else(|| req.uri().host().map(str::to_string))
}

async fn answer_challenge(
    ctx: ChallengeContext,
    host: Option<String>,
    incoming_token: String,
) -> Response<ResponseBody> {
    let Some(host) = host else {
        return respond(StatusCode::IM_A_TEAPOT, "");
    };

    if host.parse::<std::net::IpAddr>().is_ok() {
        return respond(StatusCode::IM_A_TEAPOT, "");
    }

    let Some(stored_token) = ctx.store.lookup_token(&host).await else {
        return respond(StatusCode::INTERNAL_SERVER_ERROR, "");
    };

    if stored_token != incoming_token {
        return respond(StatusCode::NOT_FOUND, "");
    }

    let thumbprint = {
        let guard = ctx.account_key.read().await;
        match guard.as_ref() {
            Some(key) => match key.thumbprint() {
                Ok(t) => t,
                Err(_) => return respond(StatusCode::INTERNAL_SERVER_ERROR, ""),
            },
            None => return respond(StatusCode::INTERNAL_SERVER_ERROR, ""),
        }
    };

    let key_auth = key_authorization(&stored_token, &thumbprint);
    respond(StatusCode::OK, key_auth)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stores_and_looks_up_token() {
        let dir = std::env::temp_dir().join(format!("fortify-test-chal-{}", std::process::id()));
        let store = ChallengeStore::new(dir.clone());
        store.put("example.com", "tok123").await.unwrap();

        assert_eq!(
            store.lookup_token("example.com").await,
            Some("tok123".to_string())
        );
        assert_eq!(store.lookup_token("other.com").await, None);

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn lookup_falls_back_to_disk_after_memory_eviction() {
        let dir = std::env::temp_dir().join(format!("fortify-test-chal2-{}", std::process::id()));
        let store = ChallengeStore::new(dir.clone());
        store.put("example.com", "tok456").await.unwrap();
        store.remove("example.com");

        assert_eq!(
            store.lookup_token("example.com").await,
            Some("tok456".to_string())
        );

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn answer_challenge_matches_token_and_computes_key_authorization() {
        let dir = std::env::temp_dir().join(format!("fortify-test-chal3-{}", std::process::id()));
        let store = Arc::new(ChallengeStore::new(dir.clone()));
        store.put("example.com", "tok789").await.unwrap();

        let key = Arc::new(AccountKey::generate().unwrap());
        let thumbprint = key.thumbprint().unwrap();
        let ctx = ChallengeContext {
            store: store.clone(),
            account_key: Arc::new(tokio::sync::RwLock::new(Some(key))),
        };

        let resp = answer_challenge(ctx, Some("example.com".to_string()), "tok789".to_string()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from(format!("tok789.{thumbprint}")));

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn answer_challenge_rejects_token_mismatch() {
        let dir = std::env::temp_dir().join(format!("fortify-test-chal4-{}", std::process::id()));
        let store = Arc::new(ChallengeStore::new(dir.clone()));
        store.put("example.com", "correct").await.unwrap();
        let key = Arc::new(AccountKey::generate().unwrap());
        let ctx = ChallengeContext {
            store,
            account_key: Arc::new(tokio::sync::RwLock::new(Some(key))),
        };

        let resp = answer_challenge(ctx, Some("example.com".to_string()), "wrong".to_string()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn answer_challenge_errors_when_no_token_on_file() {
        let dir = std::env::temp_dir().join(format!("fortify-test-chal5-{}", std::process::id()));
        let store = Arc::new(ChallengeStore::new(dir.clone()));
        let key = Arc::new(AccountKey::generate().unwrap());
        let ctx = ChallengeContext {
            store,
            account_key: Arc::new(tokio::sync::RwLock::new(Some(key))),
        };

        let resp = answer_challenge(ctx, Some("never-requested.com".to_string()), "x".to_string()).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn answer_challenge_rejects_ip_literal_host() {
        let dir = std::env::temp_dir().join(format!("fortify-test-chal6-{}", std::process::id()));
        let store = Arc::new(ChallengeStore::new(dir.clone()));
        let key = Arc::new(AccountKey::generate().unwrap());
        let ctx = ChallengeContext {
            store,
            account_key: Arc::new(tokio::sync::RwLock::new(Some(key))),
        };

        let resp = answer_challenge(ctx, Some("127.0.0.1".to_string()), "x".to_string()).await;
        assert_eq!(resp.status(), StatusCode::IM_A_TEAPOT);

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn answer_challenge_rejects_missing_host() {
        let dir = std::env::temp_dir().join(format!("fortify-test-chal7-{}", std::process::id()));
        let store = Arc::new(ChallengeStore::new(dir.clone()));
        let key = Arc::new(AccountKey::generate().unwrap());
        let ctx = ChallengeContext {
            store,
            account_key: Arc::new(tokio::sync::RwLock::new(Some(key))),
        };

        let resp = answer_challenge(ctx, None, "x".to_string()).await;
        assert_eq!(resp.status(), StatusCode::IM_A_TEAPOT);

        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}
