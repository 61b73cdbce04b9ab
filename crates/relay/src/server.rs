//! The gateway HTTP/WebSocket server.

use std::{process::ExitCode, sync::Arc};

use relay_log::log;
use tokio::signal;

use crate::{cli::Opts, config::EngineConfig, gateway, session::Session};

/// Exit code for a configuration error (e.g. the transcoder binary could not
/// be resolved), per §6.
const EXIT_CONFIG_ERROR: u8 = 1;

/// Exit code for a listen-port conflict, per §6.
const EXIT_PORT_CONFLICT: u8 = 2;

/// Runs the gateway server until an OS termination signal is received, then
/// shuts every room down before returning.
///
/// Returns the process [`ExitCode`] documented in §6: `0` on a clean
/// shutdown, `1` if the transcoder binary could not be resolved, `2` if the
/// client gateway's listen address is already in use.
pub async fn run(cfg: Opts) -> ExitCode {
    let transcoder_path =
        match tokio::fs::canonicalize(&cfg.transcoder_path).await {
            Ok(path) => path,
            Err(e) => {
                log::error!(
                    "Failed to resolve transcoder binary '{}': {}",
                    cfg.transcoder_path.display(),
                    e,
                );
                return ExitCode::from(EXIT_CONFIG_ERROR);
            }
        };

    let mut engine_cfg = EngineConfig::from(&cfg);
    engine_cfg.transcoder_path = transcoder_path;
    let engine_cfg = Arc::new(engine_cfg);

    let session = Session::new(Arc::clone(&engine_cfg));
    let app = gateway::router(Arc::clone(&session), Arc::clone(&engine_cfg));

    let addr = (cfg.client_ip, cfg.client_port);
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            log::error!(
                "Failed to bind client gateway on {}:{}: {}",
                cfg.client_ip,
                cfg.client_port,
                e,
            );
            return ExitCode::from(EXIT_PORT_CONFLICT);
        }
    };
    log::info!(
        "Ingest relay listening on {}:{}",
        cfg.client_ip,
        cfg.client_port,
    );

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        log::error!("Gateway server failed: {}", e);
    }

    log::info!("Shutting down all rooms...");
    session.shutdown_all().await;

    ExitCode::SUCCESS
}

/// Resolves once either `SIGINT` or `SIGTERM` is received, per the server
/// shutdown orchestration of §5.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .unwrap_or_else(|e| log::error!("Failed to listen for Ctrl+C: {}", e));
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                log::error!("Failed to listen for SIGTERM: {}", e);
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
