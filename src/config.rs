use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::constants;

#[derive(Debug, Deserialize, Default)]
pub struct Bootstrap {
    #[serde(default)]
    pub strict: bool,
    #[serde(default)]
    pub logger: Logger,
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub backend: Backend,
    #[serde(default)]
    pub cache: Cache,
}

impl Bootstrap {
    /// Applies the environment variables the gateway has always honored on
    /// top of whatever the config file provided.
    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| std::env::var(key).ok());
    }

    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(val) = get("MINIO_ENDPOINT") {
            self.backend.endpoint = val;
        }
        if let Some(val) = get("MINIO_ACCESS_KEY") {
            self.backend.access_key = val;
        }
        if let Some(val) = get("MINIO_SECRET_KEY") {
            self.backend.secret_key = val;
        }
        if let Some(val) = get("MINIO_BUCKET") {
            self.backend.bucket = val;
        }
        if let Some(port) = get("PORT") {
            self.server.addr = format!(":{}", port.trim());
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.addr.trim().is_empty() {
            return Err(anyhow!("server.addr is required"));
        }
        let backend = &self.backend;
        if backend.endpoint.trim().is_empty()
            || backend.access_key.is_empty()
            || backend.secret_key.is_empty()
            || backend.bucket.trim().is_empty()
        {
            return Err(anyhow!(
                "missing backend settings: endpoint, access_key, secret_key and bucket are required \
                 (MINIO_ENDPOINT, MINIO_ACCESS_KEY, MINIO_SECRET_KEY, MINIO_BUCKET)"
            ));
        }
        self.cache.validate()
    }
}

#[derive(Debug, Deserialize)]
pub struct Logger {
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub caller: bool,
    #[serde(default = "default_true")]
    pub traceid: bool,
    #[serde(default)]
    pub max_size: u64,
    #[serde(default)]
    pub max_backups: u64,
    #[serde(default)]
    pub nopid: bool,
}

impl Default for Logger {
    fn default() -> Self {
        Self {
            level: String::new(),
            path: String::new(),
            caller: false,
            traceid: true,
            max_size: 0,
            max_backups: 0,
            nopid: false,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Server {
    #[serde(default = "default_addr")]
    pub addr: String,
    #[serde(default)]
    pub admin_addr: String,
    #[serde(default = "default_read_header_timeout", with = "humantime_serde")]
    pub read_header_timeout: Duration,
    #[serde(default = "default_cache_control")]
    pub cache_control: String,
    #[serde(default = "default_powered_by")]
    pub powered_by: String,
    #[serde(default)]
    pub cors: Cors,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            admin_addr: String::new(),
            read_header_timeout: default_read_header_timeout(),
            cache_control: default_cache_control(),
            powered_by: default_powered_by(),
            cors: Cors::default(),
        }
    }
}

#[derive(Debug, Deserialize, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CorsMode {
    #[default]
    Reflect,
    AllowList,
    Disabled,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct Cors {
    #[serde(default)]
    pub mode: CorsMode,
    #[serde(default)]
    pub allow_origins: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct Backend {
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub secret_key: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_true")]
    pub secure: bool,
    #[serde(default = "default_true")]
    pub verify_bucket: bool,
}

impl Default for Backend {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            access_key: String::new(),
            secret_key: String::new(),
            bucket: String::new(),
            region: default_region(),
            secure: true,
            verify_bucket: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Cache {
    #[serde(default = "default_ttl", with = "humantime_serde")]
    pub ttl: Duration,
    #[serde(default = "default_capacity")]
    pub capacity_bytes: u64,
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,
    #[serde(default = "default_fetch_timeout", with = "humantime_serde")]
    pub fetch_timeout: Duration,
    #[serde(default = "default_true")]
    pub stale_fallback: bool,
}

impl Cache {
    pub fn validate(&self) -> Result<()> {
        if self.ttl.is_zero() {
            return Err(anyhow!("cache.ttl must be greater than zero"));
        }
        if self.capacity_bytes == 0 {
            return Err(anyhow!("cache.capacity_bytes must be greater than zero"));
        }
        if self.fetch_timeout.is_zero() {
            return Err(anyhow!("cache.fetch_timeout must be greater than zero"));
        }
        Ok(())
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self {
            ttl: default_ttl(),
            capacity_bytes: default_capacity(),
            sweep_interval: default_sweep_interval(),
            fetch_timeout: default_fetch_timeout(),
            stale_fallback: true,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_addr() -> String {
    constants::DEFAULT_ADDR.to_string()
}

fn default_read_header_timeout() -> Duration {
    constants::DEFAULT_READ_HEADER_TIMEOUT
}

fn default_cache_control() -> String {
    constants::DEFAULT_CACHE_CONTROL.to_string()
}

fn default_powered_by() -> String {
    constants::DEFAULT_POWERED_BY.to_string()
}

fn default_region() -> String {
    constants::DEFAULT_REGION.to_string()
}

fn default_ttl() -> Duration {
    constants::DEFAULT_CACHE_TTL
}

fn default_capacity() -> u64 {
    constants::DEFAULT_CACHE_CAPACITY
}

fn default_sweep_interval() -> Duration {
    constants::DEFAULT_SWEEP_INTERVAL
}

fn default_fetch_timeout() -> Duration {
    constants::DEFAULT_FETCH_TIMEOUT
}

/// Reads the YAML config at `path`. A missing file yields the defaults so the
/// gateway can run from environment variables alone.
pub fn load(path: &Path) -> Result<(Bootstrap, Vec<String>)> {
    if !path.exists() {
        return Ok((Bootstrap::default(), Vec::new()));
    }
    let raw = fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
    parse(&raw).with_context(|| format!("parse config {}", path.display()))
}

pub fn parse(raw: &str) -> Result<(Bootstrap, Vec<String>)> {
    let mut ignored = Vec::new();
    let de = serde_yaml::Deserializer::from_str(raw);
    let cfg: Bootstrap = serde_ignored::deserialize(de, |path| {
        ignored.push(path.to_string());
    })?;
    Ok((cfg, ignored))
}
