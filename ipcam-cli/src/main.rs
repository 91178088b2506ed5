mod cli;
mod config;
mod logging;
mod panic_hook;

use std::{process, sync::Arc};

use anyhow::Result;
use clap::Parser;
use ipcam_engine::{Capture, FfmpegMerger};
use mimalloc::MiMalloc;
use tracing::{error, info};

use crate::{cli::Args, config::StreamRequest};

/// Exit status when a second signal cuts the final merge short.
const EXIT_INTERRUPTED: i32 = 130;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let request = StreamRequest::resolve(&args);

    let log_file = request.as_ref().ok().and_then(|r| r.log.clone());
    let guard = match logging::init_logging(args.verbose, args.quiet, log_file.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {e:#}");
            process::exit(1);
        }
    };
    panic_hook::install();

    let code = match run(args, request).await {
        Ok(()) => 0,
        Err(e) => {
            error!("Application error: {e:#}");
            1
        }
    };

    // Flush the file writer; `process::exit` skips destructors.
    drop(guard);
    process::exit(code);
}

async fn run(args: Args, request: Result<StreamRequest>) -> Result<()> {
    let config = request?.into_capture_config(args.exit_on_source_failure)?;
    let merger = FfmpegMerger::new(args.ffmpeg);
    info!(ffmpeg = merger.binary(), "using encoder");
    let capture = Arc::new(Capture::new(config, Arc::new(merger))?);

    let signals = tokio::spawn({
        let capture = capture.clone();
        async move {
            wait_for_signal().await;
            tokio::select! {
                _ = capture.shutdown() => {}
                _ = wait_for_signal() => {
                    error!("second signal received, exiting without waiting for the merge");
                    process::exit(EXIT_INTERRUPTED);
                }
            }
        }
    });

    match capture.run().await {
        Ok(()) => {
            // The loop has stopped; wait for the final merge to land.
            signals.await?;
            info!("capture stopped");
            Ok(())
        }
        Err(e) => {
            signals.abort();
            capture.shutdown().await;
            Err(e.into())
        }
    }
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = terminate => info!("received SIGTERM"),
    }
}
