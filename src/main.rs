//! # Main — Entry Point
//!
//! Loads `.env`, parses [`sigma::config::Config`], sets up logging and runs
//! the server on a multi-threaded tokio runtime.
//!
//! `RUST_LOG` overrides the default level (`info`, or `warn` in production).
//! `LOG_FORMAT=json` switches to JSON log lines.

use anyhow::Result;
use clap::Parser;
use sigma::config::Config;
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let config = Config::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_log_level()));
    if config.log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(sigma::server::run(config))
}
