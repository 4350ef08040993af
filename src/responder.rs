//! Turns a cached object into an HTTP response.
//!
//! Nothing here touches the backend; the entry is the only source of truth,
//! so the same entry always yields the same response for the same request.

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Method, Response, StatusCode};
use http_body_util::Full;

use crate::cache::{CacheEntry, CacheStatus};
use crate::config::{self, CorsMode};
use crate::constants;
use crate::http_range::{self, RangeError};

/// Decides which `Origin` values are echoed back.
#[derive(Debug, Clone)]
pub struct CorsPolicy {
    mode: CorsMode,
    allow_origins: HashSet<String>,
}

impl CorsPolicy {
    pub fn from_config(cfg: &config::Cors) -> Self {
        Self {
            mode: cfg.mode,
            allow_origins: cfg
                .allow_origins
                .iter()
                .map(|origin| origin.trim().trim_end_matches('/').to_string())
                .filter(|origin| !origin.is_empty())
                .collect(),
        }
    }

    pub fn allowed_origin<'a>(&self, origin: Option<&'a HeaderValue>) -> Option<&'a HeaderValue> {
        let origin = origin.filter(|v| !v.is_empty())?;
        match self.mode {
            CorsMode::Disabled => None,
            CorsMode::Reflect => Some(origin),
            CorsMode::AllowList => {
                let raw = origin.to_str().ok()?;
                self.allow_origins.contains(raw).then_some(origin)
            }
        }
    }

    fn apply(&self, req_headers: &HeaderMap, headers: &mut HeaderMap) {
        if self.mode == CorsMode::Disabled {
            return;
        }
        headers.append(header::VARY, HeaderValue::from_static("Origin"));
        if let Some(origin) = self.allowed_origin(req_headers.get(header::ORIGIN)) {
            headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
            headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static("GET"));
        }
    }
}

pub struct Responder {
    cache_control: Option<HeaderValue>,
    powered_by: Option<HeaderValue>,
    cors: CorsPolicy,
}

impl Responder {
    pub fn new(cfg: &config::Server) -> Result<Self> {
        Ok(Self {
            cache_control: optional_header(&cfg.cache_control).context("invalid server.cache_control")?,
            powered_by: optional_header(&cfg.powered_by).context("invalid server.powered_by")?,
            cors: CorsPolicy::from_config(&cfg.cors),
        })
    }

    /// Builds the response for `entry`. `method` must be GET or HEAD.
    pub fn respond(
        &self,
        method: &Method,
        req_headers: &HeaderMap,
        entry: &CacheEntry,
        status: CacheStatus,
    ) -> Response<Full<Bytes>> {
        let modified = unix_seconds(entry.last_modified);
        let mut resp = Response::new(Full::new(Bytes::new()));
        self.common_headers(req_headers, entry, status, resp.headers_mut());

        if let Some(since) = header_date(req_headers, &header::IF_UNMODIFIED_SINCE) {
            if modified > since {
                *resp.status_mut() = StatusCode::PRECONDITION_FAILED;
                return resp;
            }
        }
        if let Some(since) = header_date(req_headers, &header::IF_MODIFIED_SINCE) {
            if modified <= since {
                *resp.status_mut() = StatusCode::NOT_MODIFIED;
                return resp;
            }
        }

        let headers = resp.headers_mut();
        headers.insert(header::CONTENT_TYPE, content_type(&entry.content_type));
        headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));

        let range = req_headers
            .get(header::RANGE)
            .filter(|value| !value.as_bytes().trim_ascii().is_empty())
            .filter(|_| if_range_matches(req_headers, modified))
            .map(|value| {
                value
                    .to_str()
                    .map_err(|_| RangeError::Invalid)
                    .and_then(|raw| http_range::parse_range(raw, entry.size))
            });

        let body = match range {
            None | Some(Err(RangeError::Multiple)) => entry.content.clone(),
            Some(Ok(spec)) => {
                *resp.status_mut() = StatusCode::PARTIAL_CONTENT;
                resp.headers_mut().insert(
                    header::CONTENT_RANGE,
                    header_value(http_range::build_content_range(spec.start, spec.end, entry.size)),
                );
                entry.content.slice(spec.start as usize..=spec.end as usize)
            }
            Some(Err(RangeError::Unsatisfiable)) => {
                *resp.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
                resp.headers_mut().insert(
                    header::CONTENT_RANGE,
                    header_value(http_range::build_unsatisfied_range(entry.size)),
                );
                Bytes::new()
            }
            Some(Err(RangeError::Invalid)) => {
                *resp.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
                Bytes::new()
            }
        };

        resp.headers_mut()
            .insert(header::CONTENT_LENGTH, HeaderValue::from(body.len() as u64));
        if *method != Method::HEAD {
            *resp.body_mut() = Full::new(body);
        }
        resp
    }

    fn common_headers(
        &self,
        req_headers: &HeaderMap,
        entry: &CacheEntry,
        status: CacheStatus,
        headers: &mut HeaderMap,
    ) {
        if let Some(val) = &self.cache_control {
            headers.insert(header::CACHE_CONTROL, val.clone());
        }
        headers.insert(
            header::LAST_MODIFIED,
            header_value(httpdate::fmt_http_date(entry.last_modified)),
        );
        if let Some(val) = &self.powered_by {
            headers.insert(constants::POWERED_BY_KEY, val.clone());
        }
        headers.insert(
            constants::PROTOCOL_CACHE_STATUS_KEY,
            HeaderValue::from_static(status.as_str()),
        );
        self.cors.apply(req_headers, headers);
    }
}

fn optional_header(raw: &str) -> Result<Option<HeaderValue>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    Ok(Some(HeaderValue::from_str(raw)?))
}

fn content_type(raw: &str) -> HeaderValue {
    HeaderValue::from_str(raw)
        .unwrap_or_else(|_| HeaderValue::from_static(constants::DEFAULT_CONTENT_TYPE))
}

/// Values built from digits, ASCII dates and fixed words always parse.
fn header_value(raw: String) -> HeaderValue {
    HeaderValue::try_from(raw).unwrap_or_else(|_| HeaderValue::from_static(""))
}

fn unix_seconds(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

fn header_date(headers: &HeaderMap, name: &HeaderName) -> Option<u64> {
    let raw = headers.get(name)?.to_str().ok()?;
    httpdate::parse_http_date(raw.trim()).ok().map(unix_seconds)
}

/// A missing `If-Range` always matches. Entity tags never match since no
/// ETag is issued; a date matches only the exact modification second.
fn if_range_matches(headers: &HeaderMap, modified: u64) -> bool {
    let Some(raw) = headers.get(header::IF_RANGE) else {
        return true;
    };
    raw.to_str()
        .ok()
        .and_then(|raw| httpdate::parse_http_date(raw.trim()).ok())
        .is_some_and(|date| unix_seconds(date) == modified)
}
