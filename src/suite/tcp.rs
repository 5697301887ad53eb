//! TCP stream tests: one-directional bandwidth and ping-pong latency.
//!
//! Both tests run their traffic on a separate data connection. The server
//! binds an ephemeral listener and hands the port number to the client over
//! the control channel; measurement starts only after the sync exchange so
//! the connection setup never pollutes the numbers.

use anyhow::{bail, Context, Result};
use std::io::ErrorKind;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::debug;

use super::BoxFuture;
use crate::control::{tune_stream, TestContext};
use crate::defaults;
use crate::params::ParamId;

pub fn bw_client(ctx: &mut TestContext) -> BoxFuture<'_> {
    Box::pin(run_bw_client(ctx))
}

pub fn bw_server(ctx: &mut TestContext) -> BoxFuture<'_> {
    Box::pin(run_bw_server(ctx))
}

pub fn lat_client(ctx: &mut TestContext) -> BoxFuture<'_> {
    Box::pin(run_lat_client(ctx))
}

pub fn lat_server(ctx: &mut TestContext) -> BoxFuture<'_> {
    Box::pin(run_lat_server(ctx))
}

fn default_msg_size(ctx: &mut TestContext, size: u32) {
    if !ctx.params.is_set(ParamId::LocMsgSize) {
        ctx.params
            .set_value(&mut ctx.reqs, ParamId::LocMsgSize, size as u64);
    }
    if !ctx.params.is_set(ParamId::RemMsgSize) {
        ctx.params
            .set_value(&mut ctx.reqs, ParamId::RemMsgSize, size as u64);
    }
}

async fn connect_data(host: &str, port: u16, secs: u32) -> Result<TcpStream> {
    let deadline = Duration::from_secs(secs.max(1) as u64);
    match timeout(deadline, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(e).context("data connect"),
        Err(_) => bail!("data connect: timed out"),
    }
}

async fn accept_data(listener: &TcpListener, secs: u32) -> Result<TcpStream> {
    let deadline = Duration::from_secs(secs.max(1) as u64);
    match timeout(deadline, listener.accept()).await {
        Ok(Ok((stream, peer))) => {
            debug!("data connection from {}", peer);
            Ok(stream)
        }
        Ok(Err(e)) => Err(e).context("data accept"),
        Err(_) => bail!("data accept: timed out"),
    }
}

async fn run_bw_client(ctx: &mut TestContext) -> Result<()> {
    default_msg_size(ctx, defaults::TCP_BW_MSG_SIZE);
    ctx.client_send_request().await?;

    let port = ctx.recv_data_port().await?;
    let stream = connect_data(&ctx.peer_host, port, ctx.reqs.loc.timeout).await?;
    let mut stream = tune_stream(stream, ctx.reqs.loc.sock_buf_size, false)?;

    ctx.synchronize().await?;

    let msg_size = ctx.reqs.loc.msg_size.max(1) as usize;
    let payload = vec![0u8; msg_size];
    let gate = ctx.gate.clone();
    let mut sent: u64 = 0;
    while !gate.finished() {
        if let Some(0) = ctx.left_to_send(sent) {
            break;
        }
        tokio::select! {
            r = stream.write_all(&payload) => {
                r.context("data send")?;
                sent += 1;
                ctx.lstat.s.no_bytes += msg_size as u64;
                ctx.lstat.s.no_msgs += 1;
            }
            _ = gate.wait_finished() => break,
        }
    }
    // Closing the data stream is the end-of-traffic signal for the server.
    drop(stream);

    ctx.stop_timing();
    ctx.successful = true;
    ctx.exchange_results().await
}

async fn run_bw_server(ctx: &mut TestContext) -> Result<()> {
    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))
        .await
        .context("bind data socket")?;
    ctx.send_data_port(listener.local_addr()?.port()).await?;

    let stream = accept_data(&listener, ctx.reqs.loc.timeout).await?;
    let mut stream = tune_stream(stream, ctx.reqs.loc.sock_buf_size, false)?;

    ctx.synchronize().await?;

    let msg_size = ctx.reqs.loc.msg_size.max(1) as usize;
    let mut buf = vec![0u8; msg_size];
    let gate = ctx.gate.clone();
    loop {
        if gate.finished() {
            break;
        }
        tokio::select! {
            r = stream.read_exact(&mut buf) => {
                match r {
                    // Traffic arriving after the end snapshot is discarded.
                    Ok(_) => {
                        if !gate.finished() {
                            ctx.lstat.r.no_bytes += msg_size as u64;
                            ctx.lstat.r.no_msgs += 1;
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                    Err(e) => return Err(e).context("data receive"),
                }
            }
            _ = gate.wait_finished() => break,
        }
    }

    ctx.stop_timing();
    ctx.successful = true;
    ctx.exchange_results().await
}

async fn exchange(stream: &mut TcpStream, buf: &mut [u8]) -> std::io::Result<()> {
    stream.write_all(buf).await?;
    stream.read_exact(buf).await?;
    Ok(())
}

async fn run_lat_client(ctx: &mut TestContext) -> Result<()> {
    default_msg_size(ctx, defaults::LAT_MSG_SIZE);
    ctx.client_send_request().await?;

    let port = ctx.recv_data_port().await?;
    let stream = connect_data(&ctx.peer_host, port, ctx.reqs.loc.timeout).await?;
    let mut stream = tune_stream(stream, ctx.reqs.loc.sock_buf_size, true)?;

    ctx.synchronize().await?;

    let msg_size = ctx.reqs.loc.msg_size.max(1) as usize;
    let mut buf = vec![0u8; msg_size];
    let gate = ctx.gate.clone();
    let mut sent: u64 = 0;
    loop {
        if gate.finished() {
            break;
        }
        if let Some(0) = ctx.left_to_send(sent) {
            break;
        }
        tokio::select! {
            r = exchange(&mut stream, &mut buf) => {
                match r {
                    Ok(()) => {
                        sent += 1;
                        ctx.lstat.s.no_bytes += msg_size as u64;
                        ctx.lstat.s.no_msgs += 1;
                        if !gate.finished() {
                            ctx.lstat.r.no_bytes += msg_size as u64;
                            ctx.lstat.r.no_msgs += 1;
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                    Err(e) => return Err(e).context("echo exchange"),
                }
            }
            _ = gate.wait_finished() => break,
        }
    }
    drop(stream);

    ctx.stop_timing();
    ctx.successful = true;
    ctx.exchange_results().await
}

async fn run_lat_server(ctx: &mut TestContext) -> Result<()> {
    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))
        .await
        .context("bind data socket")?;
    ctx.send_data_port(listener.local_addr()?.port()).await?;

    let stream = accept_data(&listener, ctx.reqs.loc.timeout).await?;
    let mut stream = tune_stream(stream, ctx.reqs.loc.sock_buf_size, true)?;

    ctx.synchronize().await?;

    let msg_size = ctx.reqs.loc.msg_size.max(1) as usize;
    let mut buf = vec![0u8; msg_size];
    let gate = ctx.gate.clone();
    loop {
        if gate.finished() {
            break;
        }
        tokio::select! {
            r = stream.read_exact(&mut buf) => {
                match r {
                    Ok(_) => {
                        if gate.finished() {
                            break;
                        }
                        ctx.lstat.r.no_bytes += msg_size as u64;
                        ctx.lstat.r.no_msgs += 1;
                        stream.write_all(&buf).await.context("echo send")?;
                        ctx.lstat.s.no_bytes += msg_size as u64;
                        ctx.lstat.s.no_msgs += 1;
                    }
                    Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                    Err(e) => return Err(e).context("echo receive"),
                }
            }
            _ = gate.wait_finished() => break,
        }
    }

    ctx.stop_timing();
    ctx.successful = true;
    ctx.exchange_results().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn data_connect_times_out_when_nobody_listens() {
        // A listener with a backlog of 1 that is never accepted from will
        // still complete TCP handshakes, so point at a dead port instead.
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = connect_data("127.0.0.1", port, 1).await.unwrap_err();
        // Either outcome is acceptable: an immediate refusal or a deadline.
        let text = format!("{:#}", err);
        assert!(
            text.contains("data connect"),
            "unexpected error text: {}",
            text
        );
    }

    #[tokio::test]
    async fn data_accept_times_out_without_a_client() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let err = accept_data(&listener, 1).await.unwrap_err();
        assert!(format!("{}", err).contains("timed out"));
    }
}
