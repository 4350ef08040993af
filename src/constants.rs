use std::time::Duration;

pub const PROTOCOL_CACHE_STATUS_KEY: &str = "X-Cache";
pub const PROTOCOL_REQUEST_ID_KEY: &str = "X-Request-ID";
pub const POWERED_BY_KEY: &str = "X-Powered-By";

pub const DEFAULT_ADDR: &str = ":8080";
pub const DEFAULT_POWERED_BY: &str = "S3-WEB";
pub const DEFAULT_CACHE_CONTROL: &str = "public, max-age=31536000";
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";
pub const DEFAULT_REGION: &str = "us-east-1";

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_CACHE_CAPACITY: u64 = 256 * 1024 * 1024;
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_READ_HEADER_TIMEOUT: Duration = Duration::from_secs(15);
