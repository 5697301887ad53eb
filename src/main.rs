//! # qperf - Main Entry Point
//!
//! Wires the pieces together: parse the command line, initialize layered
//! logging (colorized stderr diagnostics plus an optional rolling log file),
//! derive the run mode, and hand off to the server accept loop or the
//! client test driver.
//!
//! Exit status is 0 only when every requested test completed successfully;
//! user errors and test failures exit 1, matching what scripted callers
//! expect from a measurement tool.

use anyhow::Result;
use clap::Parser;
use qperf::{
    cli::{self, Args, Mode},
    control,
    params::{Params, ReqPair},
};
use tracing::error;
use tracing_subscriber::{filter::LevelFilter, prelude::*, EnvFilter, Layer};

mod logging;
use logging::DiagnosticFormatter;

// One test runs per process at a time and every blocking wait is bounded,
// so the single-threaded runtime is enough. It also makes CPU pinning
// meaningful: the affinity parameter pins the one thread the measurement
// loops run on.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Diagnostics default to INFO; -D raises them to DEBUG and RUST_LOG
    // can override either way.
    let log_level = if args.debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let stderr_filter = EnvFilter::builder()
        .with_default_directive(log_level.into())
        .from_env_lossy();

    // Optional detailed file layer. The guard must stay alive for the
    // lifetime of the program or file logging silently stops.
    let guard;
    let file_layer = match args.log_file.as_deref() {
        Some(path_str) => {
            let log_path = std::path::Path::new(path_str);
            let log_dir = log_path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| std::path::Path::new("."));
            let log_filename = log_path
                .file_name()
                .unwrap_or_else(|| std::ffi::OsStr::new("qperf.log"));
            let appender = tracing_appender::rolling::daily(log_dir, log_filename);
            let (writer, file_guard) = tracing_appender::non_blocking(appender);
            guard = Some(file_guard);
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_filter(log_level)
                    .boxed(),
            )
        }
        None => {
            guard = None;
            None
        }
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .event_format(DiagnosticFormatter)
        .with_filter(stderr_filter);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .init();
    let _log_guard = guard;

    let mut params = Params::new();
    let mut reqs = ReqPair::default();
    let mode = match cli::configure(&args, &mut params, &mut reqs) {
        Ok(mode) => mode,
        Err(e) => {
            eprintln!("qperf: {:#}", e);
            std::process::exit(1);
        }
    };

    let outcome = match mode {
        Mode::Server(cfg) => control::run_server(cfg).await.map(|_| true),
        Mode::Client { cfg, tests } => {
            control::run_client(&cfg, &tests, &mut params, &mut reqs).await
        }
    };

    match outcome {
        Ok(true) => Ok(()),
        Ok(false) => std::process::exit(1),
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    }
}
