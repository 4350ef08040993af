use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderValue};
use http::{Method, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::{Body, Incoming};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::cache;
use crate::config::Bootstrap;
use crate::constants;
use crate::gateway::Gateway;
use crate::logging;
use crate::metrics;
use crate::store::ObjectStore;

#[derive(Debug, Serialize)]
pub struct BuildInfo {
    pub name: &'static str,
    pub version: &'static str,
    pub commit: &'static str,
}

pub fn build_info() -> BuildInfo {
    BuildInfo {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        commit: option_env!("GIT_REV").unwrap_or("unknown"),
    }
}

pub async fn run(cfg: Arc<Bootstrap>, store: Arc<dyn ObjectStore>) -> Result<()> {
    let gateway = Arc::new(Gateway::new(store, &cfg.cache, &cfg.server)?);

    let listener = bind_listener(&cfg.server.addr)?;
    log::info!("serving objects on {}", listener.local_addr()?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handlers(shutdown_tx);

    let sweeper = if cfg.cache.sweep_interval.is_zero() {
        None
    } else {
        Some(cache::spawn_sweeper(
            Arc::clone(gateway.cache()),
            cfg.cache.sweep_interval,
        ))
    };

    if !cfg.server.admin_addr.trim().is_empty() {
        let admin = bind_listener(&cfg.server.admin_addr).context("bind admin listener")?;
        log::info!("admin endpoints on {}", admin.local_addr()?);
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_admin(admin, shutdown).await {
                log::error!("admin listener stopped: {err}");
            }
        });
    }

    let result = serve(
        listener,
        Arc::clone(&gateway),
        cfg.server.read_header_timeout,
        shutdown_rx,
    )
    .await;

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }
    gateway.cache().clear();
    log::info!("server stopped");
    result
}

fn bind_listener(addr: &str) -> Result<TcpListener> {
    let bind_addr = if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    };
    let socket_addr: SocketAddr = bind_addr
        .parse()
        .with_context(|| format!("parse listen address {addr}"))?;
    let listener = std::net::TcpListener::bind(socket_addr)
        .with_context(|| format!("bind tcp {socket_addr}"))?;
    listener.set_nonblocking(true)?;
    Ok(TcpListener::from_std(listener)?)
}

fn spawn_signal_handlers(shutdown: watch::Sender<bool>) {
    tokio::spawn(async move {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).ok();
        tokio::select! {
            _ = async {
                match sigterm.as_mut() {
                    Some(sig) => { let _ = sig.recv().await; }
                    None => std::future::pending::<()>().await,
                }
            } => log::info!("received SIGTERM, shutting down"),
            _ = async {
                match sigint.as_mut() {
                    Some(sig) => { let _ = sig.recv().await; }
                    None => std::future::pending::<()>().await,
                }
            } => log::info!("received SIGINT, shutting down"),
        }
        let _ = shutdown.send(true);
    });
}

fn conn_builder(read_header_timeout: Duration) -> ConnBuilder<TokioExecutor> {
    let mut builder = ConnBuilder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(read_header_timeout);
    builder
}

/// Accepts connections until `shutdown` flips. Connections already accepted
/// run to completion on their own tasks.
pub async fn serve(
    listener: TcpListener,
    gateway: Arc<Gateway>,
    read_header_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            res = listener.accept() => {
                let (stream, peer) = match res {
                    Ok(conn) => conn,
                    Err(err) => {
                        log::warn!("accept tcp: {err}");
                        continue;
                    }
                };
                let io = TokioIo::new(stream);
                let gateway = Arc::clone(&gateway);

                tokio::spawn(async move {
                    let service = service_fn(move |req| handle(req, Arc::clone(&gateway), peer));
                    let builder = conn_builder(read_header_timeout);
                    if let Err(err) = builder.serve_connection(io, service).await {
                        log::debug!("http connection from {peer} closed: {err}");
                    }
                });
            }
        }
    }
    Ok(())
}

async fn serve_admin(listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            res = listener.accept() => {
                let (stream, _) = res.context("accept admin tcp")?;
                let io = TokioIo::new(stream);

                tokio::spawn(async move {
                    let service = service_fn(handle_admin);
                    let builder = ConnBuilder::new(TokioExecutor::new());
                    if let Err(err) = builder.serve_connection(io, service).await {
                        log::debug!("admin connection closed: {err}");
                    }
                });
            }
        }
    }
    Ok(())
}

async fn handle(
    req: Request<Incoming>,
    gateway: Arc<Gateway>,
    peer: SocketAddr,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let req_info = RequestInfo::from_request(&req, peer);
    let (parts, _body) = req.into_parts();

    let mut resp = logging::with_trace_id(req_info.request_id.clone(), async {
        gateway.handle(&parts).await
    })
    .await;

    if let Ok(val) = HeaderValue::from_str(&req_info.request_id) {
        resp.headers_mut()
            .insert(constants::PROTOCOL_REQUEST_ID_KEY, val);
    }
    metrics::record(resp.status());
    log_access(&req_info, &resp);
    Ok(resp)
}

async fn handle_admin(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    if *req.method() != Method::GET && *req.method() != Method::HEAD {
        return Ok(text_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"));
    }
    let resp = match req.uri().path() {
        "/healthz/liveness-probe" => empty_response(StatusCode::OK),
        "/healthz/readiness-probe" => empty_response(StatusCode::OK),
        "/version" => json_response(&build_info()),
        "/metrics" => text_response(StatusCode::OK, &metrics::render()),
        _ => text_response(StatusCode::NOT_FOUND, "not found"),
    };
    Ok(resp)
}

struct RequestInfo {
    method: Method,
    uri: String,
    client_ip: String,
    user_agent: String,
    range: String,
    request_id: String,
    protocol: String,
    start_at: Instant,
}

impl RequestInfo {
    fn from_request(req: &Request<Incoming>, peer: SocketAddr) -> Self {
        let headers = req.headers();
        Self {
            method: req.method().clone(),
            uri: req.uri().to_string(),
            client_ip: client_ip(&peer.ip().to_string(), headers),
            user_agent: header_or_dash(headers, header::USER_AGENT.as_str()),
            range: header_or_dash(headers, header::RANGE.as_str()),
            request_id: metrics::request_id_from_headers(headers),
            protocol: format!("{:?}", req.version()),
            start_at: Instant::now(),
        }
    }
}

fn header_or_dash(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or("-")
        .to_string()
}

fn client_ip(remote_addr: &str, headers: &HeaderMap) -> String {
    let direct = headers
        .get("X-Real-IP")
        .or_else(|| headers.get("X-Forwarded-For"))
        .and_then(|v| v.to_str().ok());
    direct.unwrap_or(remote_addr).to_string()
}

fn log_access(req: &RequestInfo, resp: &Response<Full<Bytes>>) {
    let cache_status = resp
        .headers()
        .get(constants::PROTOCOL_CACHE_STATUS_KEY)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-");
    let body_len = resp.body().size_hint().exact().unwrap_or(0);
    log::info!(
        target: "access",
        "{} \"{} {} {}\" {} {} {} range={} ua={} {}ms",
        req.client_ip,
        req.method,
        req.uri,
        req.protocol,
        resp.status().as_u16(),
        body_len,
        cache_status,
        req.range.replace(' ', "+"),
        req.user_agent.replace(' ', "+"),
        req.start_at.elapsed().as_millis(),
    );
}

fn empty_response(status: StatusCode) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::new()));
    *resp.status_mut() = status;
    resp
}

fn text_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::from(body.to_string())));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}

fn json_response<T: Serialize>(payload: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(payload) {
        Ok(bytes) => {
            let mut resp = Response::new(Full::new(Bytes::from(bytes)));
            resp.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json; charset=utf-8"),
            );
            resp
        }
        Err(_) => text_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to encode"),
    }
}
