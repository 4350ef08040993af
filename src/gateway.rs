use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use futures::FutureExt;
use http::header::{self, HeaderValue};
use http::request::Parts;
use http::{Method, Response, StatusCode};
use http_body_util::Full;

use crate::cache::{CacheStatus, CacheStore, Lookup};
use crate::config;
use crate::fetch::{FetchCoordinator, Fetched};
use crate::metrics;
use crate::resolver::{self, ResolveError};
use crate::responder::Responder;
use crate::store::{ObjectStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("bad request: {0}")]
    BadRequest(#[from] ResolveError),
    #[error("method not allowed")]
    MethodNotAllowed,
    #[error("object not found")]
    NotFound,
    #[error("backend error: {0}")]
    Backend(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            GatewayError::NotFound => StatusCode::NOT_FOUND,
            GatewayError::Backend(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn public_message(&self) -> String {
        match self {
            GatewayError::BadRequest(err) => format!("Bad Request: {err}"),
            GatewayError::MethodNotAllowed => "Method Not Allowed".to_string(),
            GatewayError::NotFound => "Not Found".to_string(),
            GatewayError::Backend(_) => "Bad Gateway".to_string(),
            GatewayError::Internal(_) => "Internal Server Error".to_string(),
        }
    }
}

impl From<StoreError> for GatewayError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => GatewayError::NotFound,
            StoreError::Backend(reason) => GatewayError::Backend(reason),
        }
    }
}

/// Per-request orchestration: resolve, look up, fetch when needed, respond.
pub struct Gateway {
    cache: Arc<CacheStore>,
    coordinator: FetchCoordinator,
    responder: Responder,
}

impl Gateway {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        cache_cfg: &config::Cache,
        server_cfg: &config::Server,
    ) -> Result<Self> {
        let cache = Arc::new(CacheStore::new(cache_cfg.ttl, cache_cfg.capacity_bytes));
        let coordinator = FetchCoordinator::new(
            Arc::clone(&cache),
            store,
            cache_cfg.fetch_timeout,
            cache_cfg.stale_fallback,
        );
        Ok(Self {
            cache,
            coordinator,
            responder: Responder::new(server_cfg)?,
        })
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    /// Always produces a response; errors and panics are mapped to a status.
    pub async fn handle(&self, req: &Parts) -> Response<Full<Bytes>> {
        recover(req, self.serve(req)).await
    }

    async fn serve(&self, req: &Parts) -> Result<Response<Full<Bytes>>, GatewayError> {
        if req.method != Method::GET && req.method != Method::HEAD {
            return Err(GatewayError::MethodNotAllowed);
        }
        let key = resolver::resolve(req.uri.path())?;

        let (entry, status) = match self.cache.get(&key) {
            Lookup::Fresh(entry) => (entry, CacheStatus::Hit),
            Lookup::Stale(_) | Lookup::Absent => match self.coordinator.fetch(&key).await? {
                Fetched::Loaded(entry) => (entry, CacheStatus::Miss),
                Fetched::Stale(entry) => (entry, CacheStatus::Stale),
            },
        };

        if entry.content.len() as u64 != entry.size {
            self.cache.evict(&key);
            return Err(GatewayError::Internal(format!(
                "cached entry for {key} holds {} bytes, expected {}",
                entry.content.len(),
                entry.size
            )));
        }

        metrics::record_cache_status(status);
        Ok(self.responder.respond(&req.method, &req.headers, &entry, status))
    }
}

async fn recover<F>(req: &Parts, serving: F) -> Response<Full<Bytes>>
where
    F: Future<Output = Result<Response<Full<Bytes>>, GatewayError>>,
{
    match AssertUnwindSafe(serving).catch_unwind().await {
        Ok(Ok(resp)) => resp,
        Ok(Err(err)) => {
            match &err {
                GatewayError::Backend(_) | GatewayError::Internal(_) => {
                    log::error!("{} {}: {err}", req.method, req.uri.path())
                }
                _ => log::debug!("{} {}: {err}", req.method, req.uri.path()),
            }
            error_response(&err)
        }
        Err(_) => {
            log::error!("panic while serving {} {}", req.method, req.uri.path());
            error_response(&GatewayError::Internal("panic".to_string()))
        }
    }
}

fn error_response(err: &GatewayError) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::from(err.public_message())));
    *resp.status_mut() = err.status();
    let headers = resp.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    if matches!(err, GatewayError::MethodNotAllowed) {
        headers.insert(header::ALLOW, HeaderValue::from_static("GET, HEAD"));
    }
    resp
}
