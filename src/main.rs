use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::Parser;

use s3web::config;
use s3web::logging;
use s3web::server;
use s3web::store::s3::S3Store;
use s3web::store::ObjectStore;

#[derive(Parser, Debug)]
#[command(name = "s3web", about = "Serve an S3 bucket over HTTP with an edge cache", version)]
struct Cli {
    /// Config file path
    #[arg(short = 'c', default_value = "config.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut cfg, ignored) = config::load(&cli.config)?;
    cfg.apply_env();

    logging::init(&cfg.logger, cli.verbose)?;

    if cfg.strict && !ignored.is_empty() {
        return Err(anyhow!("unknown config fields: {}", ignored.join(", ")));
    }

    if !ignored.is_empty() {
        log::warn!("ignoring unknown config fields: {}", ignored.join(", "));
    }

    cfg.validate()?;

    let store = S3Store::new(&cfg.backend)?;
    if cfg.backend.verify_bucket {
        store.verify_bucket().await?;
    }
    log::info!(
        "s3web starting with bucket {} at {}",
        cfg.backend.bucket,
        cfg.backend.endpoint
    );

    let store: Arc<dyn ObjectStore> = Arc::new(store);
    server::run(Arc::new(cfg), store).await
}
