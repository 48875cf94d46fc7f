//! `karl` binary entrypoint.
//!
//! Loads configuration from `KARL_*` environment variables and starts the
//! keepalive aggregation service.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use anyhow::Result;

use karl_api::config::Config;
use karl_api::Karl;
use karl_core::{init_logging, LogFormat};

fn choose_log_format(config: &Config) -> LogFormat {
    if config.debug {
        LogFormat::Pretty
    } else {
        LogFormat::Json
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_logging(choose_log_format(&config));

    if !config.debug && (config.stream_file.is_none() || config.storage_file.is_none()) {
        anyhow::bail!("KARL_STREAM_FILE and KARL_STORAGE_FILE are required when KARL_DEBUG=false");
    }
    if config.stream_file.is_none() {
        tracing::warn!("KARL_STREAM_FILE not set; keepalives will not survive a restart");
    }

    let karl = Karl::builder(config).build().await?;
    karl.serve().await?;
    Ok(())
}
