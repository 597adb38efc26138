//! odb-server binary
//!
//! Usage: `odb-server [config.json]`. Settings not in the file come from
//! `ODB_*` environment variables or defaults; `RUST_LOG` sets the filter.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use odb_core::OdbResult;
use odb_server::{ServerConfig, TcpServer};
use odb_store::{KvPersistence, MemoryPersistence, Persistence, RedisBackend};

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_thread_names(true);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn open_store(config: &ServerConfig) -> OdbResult<Arc<dyn Persistence>> {
    match &config.redis_url {
        Some(url) => {
            tracing::info!("using redis store at {}", url);
            Ok(Arc::new(KvPersistence::new(RedisBackend::connect(url)?)))
        }
        None => {
            tracing::warn!("no redis_url configured; data lives in memory only");
            Ok(Arc::new(MemoryPersistence::new()))
        }
    }
}

async fn serve(config: ServerConfig) -> OdbResult<()> {
    let store = open_store(&config)?;
    let server = TcpServer::start(&config, store)?;

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("cannot wait for ctrl-c: {}", e);
    }
    tracing::info!("shutting down");
    server.stop();
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = match ServerConfig::load(path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("odb-server: {}", e);
            return ExitCode::FAILURE;
        }
    };
    init_logging(config.log_json);

    match serve(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("odb-server failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
