#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures::StreamExt;
use http::{HeaderMap, Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use s3web::config;
use s3web::gateway::Gateway;
use s3web::server;
use s3web::store::{BoxFuture, ObjectBody, ObjectStore, StoreError};
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Fixed backend timestamp: Tue, 14 Nov 2023 22:13:20 GMT.
pub const LAST_MODIFIED_SECS: u64 = 1_700_000_000;

pub fn last_modified() -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(LAST_MODIFIED_SECS)
}

#[derive(Clone)]
struct MockObject {
    body: Bytes,
    content_type: String,
}

/// In-memory bucket that counts every backend call and can be told to fail
/// or stall.
#[derive(Default)]
pub struct MockStore {
    objects: Mutex<HashMap<String, MockObject>>,
    failures: Mutex<HashMap<String, StoreError>>,
    delay: Mutex<Duration>,
    calls: AtomicUsize,
}

impl MockStore {
    pub fn put(&self, key: &str, body: &[u8], content_type: &str) {
        self.objects.lock().unwrap().insert(
            key.to_string(),
            MockObject {
                body: Bytes::copy_from_slice(body),
                content_type: content_type.to_string(),
            },
        );
    }

    pub fn remove(&self, key: &str) {
        self.objects.lock().unwrap().remove(key);
    }

    pub fn fail(&self, key: &str, err: StoreError) {
        self.failures.lock().unwrap().insert(key.to_string(), err);
    }

    pub fn heal(&self, key: &str) {
        self.failures.lock().unwrap().remove(key);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ObjectStore for MockStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<ObjectBody, StoreError>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let delay = *self.delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let failure = self.failures.lock().unwrap().get(key).cloned();
            if let Some(err) = failure {
                return Err(err);
            }
            let object = self.objects.lock().unwrap().get(key).cloned();
            let object = object.ok_or(StoreError::NotFound)?;
            let chunks: Vec<Result<Bytes, StoreError>> = object
                .body
                .chunks(4)
                .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
                .collect();
            Ok(ObjectBody {
                content_type: object.content_type,
                size: object.body.len() as u64,
                last_modified: last_modified(),
                stream: futures::stream::iter(chunks).boxed(),
            })
        })
    }
}

pub fn cache_config() -> config::Cache {
    config::Cache {
        ttl: Duration::from_secs(60),
        capacity_bytes: 1 << 20,
        sweep_interval: Duration::ZERO,
        fetch_timeout: Duration::from_secs(2),
        stale_fallback: true,
    }
}

#[derive(Clone)]
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TestResponse {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }
}

#[derive(Clone)]
pub struct TestClient {
    addr: SocketAddr,
}

impl TestClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    pub async fn send(&self, method: Method, path: &str, headers: HeaderMap) -> TestResponse {
        let stream = tokio::net::TcpStream::connect(self.addr)
            .await
            .expect("connect gateway");
        let io = TokioIo::new(stream);
        let (mut sender, conn) = http1::handshake(io).await.expect("handshake");
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header(http::header::HOST, self.addr.to_string());
        for (k, v) in headers.iter() {
            builder = builder.header(k, v);
        }
        let req = builder.body(Full::new(Bytes::new())).expect("request");

        let resp = sender.send_request(req).await.expect("send request");
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();

        TestResponse {
            status,
            headers,
            body,
        }
    }
}

/// A gateway listening on an ephemeral port, backed by a [`MockStore`].
pub struct E2E {
    pub store: Arc<MockStore>,
    pub gateway: Arc<Gateway>,
    pub client: TestClient,
    shutdown: watch::Sender<bool>,
}

impl E2E {
    pub async fn start() -> Self {
        Self::with_config(cache_config(), config::Server::default()).await
    }

    pub async fn with_config(cache: config::Cache, server_cfg: config::Server) -> Self {
        let store = Arc::new(MockStore::default());
        let gateway = Arc::new(
            Gateway::new(
                Arc::clone(&store) as Arc<dyn ObjectStore>,
                &cache,
                &server_cfg,
            )
            .expect("gateway"),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind gateway");
        let addr = listener.local_addr().expect("local addr");
        let (shutdown, rx) = watch::channel(false);
        tokio::spawn(server::serve(
            listener,
            Arc::clone(&gateway),
            Duration::from_secs(5),
            rx,
        ));
        Self {
            store,
            gateway,
            client: TestClient::new(addr),
            shutdown,
        }
    }

    pub async fn get(&self, path: &str) -> TestResponse {
        self.do_request(path, |_, _| {}).await
    }

    pub async fn do_request<F>(&self, path: &str, edit: F) -> TestResponse
    where
        F: FnOnce(&mut Method, &mut HeaderMap),
    {
        let mut method = Method::GET;
        let mut headers = HeaderMap::new();
        edit(&mut method, &mut headers);
        self.client.send(method, path, headers).await
    }
}

impl Drop for E2E {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}
