//! todo-sync server binary.
//!
//! Configured from the environment, see [`todo_sync::config`].
//! Log verbosity follows `RUST_LOG`.

use std::process::ExitCode;

use todo_sync::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("Invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let server = match SyncServer::build(config).await {
        Ok(server) => server,
        Err(e) => {
            log::error!("Failed to start server: {e}");
            return ExitCode::FAILURE;
        }
    };

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                log::error!("Server stopped: {e}");
                return ExitCode::FAILURE;
            }
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("Shutting down");
        }
    }

    ExitCode::SUCCESS
}
