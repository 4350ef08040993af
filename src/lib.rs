pub mod cache;
pub mod config;
pub mod constants;
pub mod fetch;
pub mod gateway;
pub mod http_range;
pub mod logging;
pub mod metrics;
pub mod resolver;
pub mod responder;
pub mod server;
pub mod store;
