use anyhow::Result;
use clap::Parser;
use qperf::cli::{self, Args, Mode};
use qperf::control::{self, ServerConfig};
use qperf::params::{Params, ReqPair};
use std::time::Duration;
use tokio::time::sleep;

/// A full run with --output-json must leave a parseable report with one
/// record per test and plausible derived numbers.
#[tokio::test]
async fn json_report_is_written_and_parseable() -> Result<()> {
    let listener = control::bind_listener(0)?;
    let port = listener.local_addr()?.port();
    let server_cfg = ServerConfig::default();
    tokio::spawn(async move {
        let _ = control::serve(listener, &server_cfg).await;
    });
    sleep(Duration::from_millis(100)).await;

    let dir = tempfile::tempdir()?;
    let report_path = dir.path().join("results.json");

    let args = Args::try_parse_from([
        "qperf",
        "127.0.0.1",
        "tcp_lat",
        "-t",
        "1",
        "--listen-port",
        &port.to_string(),
        "--output-json",
        report_path.to_str().unwrap(),
    ])?;
    let mut params = Params::new();
    let mut reqs = ReqPair::default();
    let Mode::Client { cfg, tests } = cli::configure(&args, &mut params, &mut reqs)? else {
        unreachable!();
    };
    let ok = control::run_client(&cfg, &tests, &mut params, &mut reqs).await?;
    assert!(ok);

    let report: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&report_path)?)?;
    assert_eq!(report["qperf"], qperf::VERSION);
    let results = report["results"].as_array().expect("results array");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["test"], "tcp_lat");
    // One second of loopback ping-pong produces a measurable rate and a
    // positive one-way latency.
    assert!(results[0]["msg_rate"].as_f64().unwrap() > 0.0);
    assert!(results[0]["latency_s"].as_f64().unwrap() > 0.0);
    assert!(results[0]["local"]["send"]["no_msgs"].as_u64().unwrap() > 0);
    Ok(())
}
