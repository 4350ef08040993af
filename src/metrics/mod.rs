use std::sync::OnceLock;

use http::{HeaderMap, StatusCode};
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::cache::CacheStatus;
use crate::constants;

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(Registry::new)
}

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let counter = IntCounterVec::new(Opts::new(name, help), labels).expect("valid counter opts");
    registry()
        .register(Box::new(counter.clone()))
        .expect("counter registered once");
    counter
}

fn gauge(name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::new(name, help).expect("valid gauge opts");
    registry()
        .register(Box::new(gauge.clone()))
        .expect("gauge registered once");
    gauge
}

fn requests_total() -> &'static IntCounterVec {
    static METRIC: OnceLock<IntCounterVec> = OnceLock::new();
    METRIC.get_or_init(|| counter_vec("s3web_requests_total", "Responses by status code", &["code"]))
}

fn cache_lookups_total() -> &'static IntCounterVec {
    static METRIC: OnceLock<IntCounterVec> = OnceLock::new();
    METRIC.get_or_init(|| {
        counter_vec(
            "s3web_cache_lookups_total",
            "Object responses by cache status",
            &["status"],
        )
    })
}

fn backend_fetches_total() -> &'static IntCounterVec {
    static METRIC: OnceLock<IntCounterVec> = OnceLock::new();
    METRIC.get_or_init(|| {
        counter_vec(
            "s3web_backend_fetches_total",
            "Backend fetches by outcome",
            &["result"],
        )
    })
}

fn cache_bytes() -> &'static IntGauge {
    static METRIC: OnceLock<IntGauge> = OnceLock::new();
    METRIC.get_or_init(|| gauge("s3web_cache_bytes", "Bytes held by the object cache"))
}

fn cache_entries() -> &'static IntGauge {
    static METRIC: OnceLock<IntGauge> = OnceLock::new();
    METRIC.get_or_init(|| gauge("s3web_cache_entries", "Entries held by the object cache"))
}

fn init_metrics() {
    let _ = cache_bytes();
    let _ = cache_entries();
    for code in ["200", "206", "304", "400", "404", "405", "412", "416", "500", "502"] {
        requests_total().with_label_values(&[code]).inc_by(0);
    }
    for status in [CacheStatus::Hit, CacheStatus::Miss, CacheStatus::Stale] {
        cache_lookups_total()
            .with_label_values(&[status.as_str()])
            .inc_by(0);
    }
    for result in ["ok", "not_found", "error"] {
        backend_fetches_total().with_label_values(&[result]).inc_by(0);
    }
}

pub fn record(status: StatusCode) {
    requests_total()
        .with_label_values(&[status.as_str()])
        .inc();
}

pub fn record_cache_status(status: CacheStatus) {
    cache_lookups_total()
        .with_label_values(&[status.as_str()])
        .inc();
}

pub fn record_backend_fetch(result: &str) {
    backend_fetches_total().with_label_values(&[result]).inc();
}

pub fn set_cache_usage(bytes: u64, entries: usize) {
    cache_bytes().set(i64::try_from(bytes).unwrap_or(i64::MAX));
    cache_entries().set(i64::try_from(entries).unwrap_or(i64::MAX));
}

pub fn render() -> String {
    init_metrics();
    let families = registry().gather();
    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    encoder.encode(&families, &mut buf).unwrap_or(());
    String::from_utf8(buf).unwrap_or_default()
}

pub fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get(constants::PROTOCOL_REQUEST_ID_KEY)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
        .unwrap_or_else(generate_request_id)
}

pub fn generate_request_id() -> String {
    let mut buf = [0u8; 16];
    OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}
