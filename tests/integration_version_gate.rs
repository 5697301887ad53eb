use anyhow::Result;
use clap::Parser;
use qperf::cli::{self, Args, Mode};
use qperf::control::{self, ServerConfig};
use qperf::params::{Params, ReqPair};
use qperf::wire::Req;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

async fn start_server() -> Result<u16> {
    let listener = control::bind_listener(0)?;
    let port = listener.local_addr()?.port();
    let cfg = ServerConfig::default();
    tokio::spawn(async move {
        let _ = control::serve(listener, &cfg).await;
    });
    sleep(Duration::from_millis(100)).await;
    Ok(port)
}

async fn send_raw_request(port: u16, req: &Req) -> Result<usize> {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await?;
    stream.write_all(&req.encode()).await?;

    // An unacceptable request gets no reply; the server just closes.
    let mut buf = [0u8; 16];
    let n = timeout(Duration::from_secs(5), stream.read(&mut buf)).await??;
    Ok(n)
}

/// A peer with a different minor version gets silence and a closed
/// connection, and the server keeps serving afterwards.
#[tokio::test]
async fn version_mismatch_closes_without_reply() -> Result<()> {
    let port = start_server().await?;

    let old = Req {
        ver_maj: 0,
        ver_min: 1,
        ver_inc: 0,
        req_index: 0,
        ..Req::default()
    };
    assert_eq!(send_raw_request(port, &old).await?, 0);

    // Incremental differences are tolerated; only maj/min gate.
    let inc_only = Req {
        ver_maj: qperf::VER_MAJ,
        ver_min: qperf::VER_MIN,
        ver_inc: qperf::VER_INC + 7,
        req_index: 99, // out of range, also answered with a close
        ..Req::default()
    };
    assert_eq!(send_raw_request(port, &inc_only).await?, 0);

    // The accept loop survived both rejections.
    let args = Args::try_parse_from([
        "qperf",
        "127.0.0.1",
        "conf",
        "--listen-port",
        &port.to_string(),
    ])?;
    let mut params = Params::new();
    let mut reqs = ReqPair::default();
    let Mode::Client { cfg, tests } = cli::configure(&args, &mut params, &mut reqs)? else {
        unreachable!();
    };
    let ok = control::run_client(&cfg, &tests, &mut params, &mut reqs).await?;
    assert!(ok, "server stopped accepting after a version mismatch");
    Ok(())
}
