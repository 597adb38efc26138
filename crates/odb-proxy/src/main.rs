//! odb-proxy binary
//!
//! Usage: `odb-proxy [config.json]`. Settings not in the file come from
//! `ODB_PROXY_*` environment variables or defaults; `RUST_LOG` sets the filter.

use std::path::PathBuf;
use std::process::ExitCode;

use tracing_subscriber::EnvFilter;

use odb_core::OdbResult;
use odb_proxy::{ProxyServerConfig, TcpProxyServer};

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_thread_names(true);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn serve(config: ProxyServerConfig) -> OdbResult<()> {
    let proxy = TcpProxyServer::start(&config)?;

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("cannot wait for ctrl-c: {}", e);
    }
    tracing::info!("shutting down");
    proxy.stop();
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = match ProxyServerConfig::load(path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("odb-proxy: {}", e);
            return ExitCode::FAILURE;
        }
    };
    init_logging(config.log_json);

    match serve(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("odb-proxy failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
