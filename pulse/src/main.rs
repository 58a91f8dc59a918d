//! Pulse server entry point.

use std::path::Path;
use std::process::ExitCode;
use std::sync::LazyLock;

use pulse::config::{CONFIG_PATH, ServerConfig};
use pulse::{PulseServer, Shutdown, logger};

static RUNTIME: LazyLock<tokio::runtime::Runtime> = LazyLock::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("pulse-worker")
        .build()
        .expect("Failed to build tokio runtime")
});

fn main() -> ExitCode {
    let config = match ServerConfig::load_or_create(Path::new(CONFIG_PATH)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load {CONFIG_PATH}: {e}");
            return ExitCode::FAILURE;
        }
    };

    RUNTIME.block_on(async {
        let logger = match logger::init(config.log_options()) {
            Ok(logger) => logger,
            Err(e) => {
                eprintln!("Failed to initialize logging: {e}");
                return ExitCode::FAILURE;
            }
        };

        let code = match serve(&config).await {
            Ok(Shutdown::Clean) => ExitCode::SUCCESS,
            Ok(Shutdown::Fatal(fault)) => {
                log::error!("Server stopped: {fault}");
                ExitCode::FAILURE
            }
            Ok(Shutdown::Hung(_)) => {
                // The server thread is stuck and cannot be joined.
                logger.shutdown().await;
                std::process::exit(1);
            }
            Err(e) => {
                log::error!("{e:#}");
                ExitCode::FAILURE
            }
        };

        logger.shutdown().await;
        code
    })
}

async fn serve(config: &ServerConfig) -> anyhow::Result<Shutdown> {
    let mut server = PulseServer::new(config)?;
    server.start()?;
    server.run().await
}
