use anyhow::Result;
use clap::Parser;
use qperf::cli::{self, Args, Mode};
use qperf::control::{self, ServerConfig};
use qperf::params::{Params, ReqPair};
use std::time::Duration;
use tokio::time::sleep;

/// Start a server on an ephemeral port and run the named client invocation
/// against it, returning whether every test succeeded.
async fn run_against_server(client_argv: &[&str]) -> Result<bool> {
    let listener = control::bind_listener(0)?;
    let port = listener.local_addr()?.port();
    let server_cfg = ServerConfig::default();
    tokio::spawn(async move {
        let _ = control::serve(listener, &server_cfg).await;
    });
    // Give the accept loop a moment to come up before connecting.
    sleep(Duration::from_millis(100)).await;

    let mut argv: Vec<String> = client_argv.iter().map(|s| s.to_string()).collect();
    argv.extend(["--listen-port".to_string(), port.to_string()]);
    let args = Args::try_parse_from(&argv)?;

    let mut params = Params::new();
    let mut reqs = ReqPair::default();
    let mode = cli::configure(&args, &mut params, &mut reqs)?;
    match mode {
        Mode::Client { cfg, tests } => control::run_client(&cfg, &tests, &mut params, &mut reqs).await,
        Mode::Server(_) => unreachable!("test invocations are always client mode"),
    }
}

/// TCP bandwidth and latency with a message budget: the whole run is bounded
/// by the byte stream, no timers involved.
#[tokio::test]
async fn tcp_tests_with_message_budget() -> Result<()> {
    let ok = run_against_server(&[
        "qperf", "127.0.0.1", "tcp_bw", "tcp_lat", "-n", "256", "-m", "4K",
    ])
    .await?;
    assert!(ok, "tcp tests did not complete successfully");
    Ok(())
}

/// UDP bandwidth and latency bounded by a one-second clock. Loss on
/// loopback is unlikely but legal; success only requires a clean exchange.
#[tokio::test]
async fn udp_tests_with_time_bound() -> Result<()> {
    let ok = run_against_server(&[
        "qperf", "127.0.0.1", "udp_bw", "udp_lat", "-t", "1", "-m", "1K",
    ])
    .await?;
    assert!(ok, "udp tests did not complete successfully");
    Ok(())
}

/// The conf test moves no data, only node descriptions.
#[tokio::test]
async fn conf_exchanges_node_descriptions() -> Result<()> {
    let ok = run_against_server(&["qperf", "127.0.0.1", "conf"]).await?;
    assert!(ok, "conf did not complete successfully");
    Ok(())
}

/// Unknown test names are a user error before anything touches the wire.
#[tokio::test]
async fn unknown_test_name_is_rejected() {
    let err = run_against_server(&["qperf", "127.0.0.1", "no_such_test"])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("unknown test"));
}

/// The version banner is the compatibility contract users check first.
#[test]
fn version_banner() {
    let output = std::process::Command::new(env!("CARGO_BIN_EXE_qperf"))
        .arg("--version")
        .output()
        .expect("run qperf --version");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("qperf 0.2.0"), "got: {}", stdout);
}
