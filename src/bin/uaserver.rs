//! Minimal OPC UA server: answers discovery requests and logs everything
//! else.
//!
//! ```text
//! uaserver [--endpoint opc.tcp://0.0.0.0:4840] [--config server.toml]
//! ```

use opcua_protocol::service::DiscoveryHandler;
use opcua_protocol::utils::logging;
use opcua_protocol::{Server, ServerConfig};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

fn parse_args(config: &mut ServerConfig) -> Result<(), String> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--endpoint" => {
                config.endpoint_url = args
                    .next()
                    .ok_or_else(|| "--endpoint requires a value".to_string())?;
            }
            "--config" => {
                let path = args
                    .next()
                    .ok_or_else(|| "--config requires a value".to_string())?;
                *config = ServerConfig::from_file(&path).map_err(|e| e.to_string())?;
            }
            "--help" | "-h" => {
                println!("usage: uaserver [--endpoint URL] [--config FILE]");
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument: {other}")),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    // Environment first, then flags on top.
    let mut config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("uaserver: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = parse_args(&mut config) {
        eprintln!("uaserver: {e}");
        return ExitCode::FAILURE;
    }

    if let Err(e) = logging::init(&config.logging) {
        eprintln!("uaserver: {e}");
        return ExitCode::FAILURE;
    }

    let server = match Server::new(config) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let handler = Arc::new(DiscoveryHandler::new(Arc::clone(server.config())));
    info!(endpoint = %server.config().endpoint_url, "starting server");

    let cancel = server.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            cancel.cancel();
        }
    });

    match server.listen_and_serve(handler).await {
        Err(e) if e.is_clean_shutdown() => {
            server.metrics().log_summary();
            info!("server stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "server terminated");
            ExitCode::FAILURE
        }
        Ok(()) => ExitCode::SUCCESS,
    }
}
