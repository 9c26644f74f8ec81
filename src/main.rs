//! skipperd, the control-plane daemon.

use std::path::PathBuf;
use std::process::ExitCode;

use skipper::boot::{ProcessState, default_data_dir};
use skipper::config::Config;
use skipper::gateway::build_router;

fn main() -> ExitCode {
    let data_dir = default_data_dir();
    let _log_guard = skipper::logging::init(&data_dir);

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("skipperd: invalid configuration: {e}");
            return ExitCode::from(1);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("skipperd: runtime init failed: {e}");
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(run(config, data_dir)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("skipperd: fatal: {e}");
            ExitCode::from(1)
        }
    }
}

async fn run(config: Config, data_dir: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let state = ProcessState::boot(config, &data_dir).await?;

    let app = build_router(state.app_state());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:8787").await?;
    log::info!("gateway listening on {}", listener.local_addr()?);

    // The worker ignores signals; shutdown is coordinated here.
    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        log::info!("signal received, shutting down");
    };
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    state.shutdown().await;
    Ok(())
}
