//! UDP datagram tests: lossy one-directional bandwidth and ping-pong
//! latency.
//!
//! Datagrams can vanish, so the two sides' counters legitimately disagree;
//! the statistics engine reports both directions. UDP also has no
//! end-of-stream, which is why the server's receive loops carry an idle
//! bound derived from the request timeout in addition to the finish gate.

use anyhow::{Context, Result};
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use super::BoxFuture;
use crate::control::TestContext;
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

/// Apply socket buffer sizes the async socket cannot set itself.
fn tune_socket(socket: UdpSocket, sock_buf_size: u32) -> Result<UdpSocket> {
    if sock_buf_size == 0 {
        return Ok(socket);
    }
    let std_socket = socket.into_std()?;
    {
        let sock = socket2::SockRef::from(&std_socket);
        sock.set_recv_buffer_size(sock_buf_size as usize)?;
        sock.set_send_buffer_size(sock_buf_size as usize)?;
    }
    Ok(UdpSocket::from_std(std_socket)?)
}

async fn run_bw_client(ctx: &mut TestContext) -> Result<()> {
    default_msg_size(ctx, defaults::UDP_BW_MSG_SIZE);
    ctx.client_send_request().await?;

    let port = ctx.recv_data_port().await?;
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .await
        .context("bind data socket")?;
    socket
        .connect((ctx.peer_host.as_str(), port))
        .await
        .context("connect data socket")?;
    let socket = tune_socket(socket, ctx.reqs.loc.sock_buf_size)?;

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
            r = socket.send(&payload) => {
                sent += 1;
                match r {
                    Ok(n) => {
                        ctx.lstat.s.no_bytes += n as u64;
                        ctx.lstat.s.no_msgs += 1;
                    }
                    // A refused or oversized datagram is a counted loss,
                    // not a test failure.
                    Err(_) => ctx.lstat.s.no_errs += 1,
                }
            }
            _ = gate.wait_finished() => break,
        }
    }

    ctx.stop_timing();
    ctx.successful = true;
    ctx.exchange_results().await
}

async fn run_bw_server(ctx: &mut TestContext) -> Result<()> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .await
        .context("bind data socket")?;
    let socket = tune_socket(socket, ctx.reqs.loc.sock_buf_size)?;
    ctx.send_data_port(socket.local_addr()?.port()).await?;

    ctx.synchronize().await?;

    let msg_size = ctx.reqs.loc.msg_size.max(1) as usize;
    let mut buf = vec![0u8; msg_size];
    let idle = Duration::from_secs(ctx.reqs.loc.timeout.max(1) as u64);
    let gate = ctx.gate.clone();
    loop {
        if gate.finished() {
            break;
        }
        tokio::select! {
            r = timeout(idle, socket.recv(&mut buf)) => {
                match r {
                    Ok(Ok(n)) => {
                        if !gate.finished() {
                            ctx.lstat.r.no_bytes += n as u64;
                            ctx.lstat.r.no_msgs += 1;
                        }
                    }
                    Ok(Err(e)) => return Err(e).context("data receive"),
                    // No end-of-stream on UDP; a silent wire means the
                    // sender is done or gone.
                    Err(_) => break,
                }
            }
            _ = gate.wait_finished() => break,
        }
    }

    ctx.stop_timing();
    ctx.successful = true;
    ctx.exchange_results().await
}

/// Outcome of one ping-pong round on the client.
enum Round {
    /// Request out, reply of this many bytes back
    Replied(usize),
    /// Request out, reply missing within the idle bound
    Lost,
    /// The send itself failed
    SendFailed,
}

async fn run_lat_client(ctx: &mut TestContext) -> Result<()> {
    default_msg_size(ctx, defaults::LAT_MSG_SIZE);
    ctx.client_send_request().await?;

    let port = ctx.recv_data_port().await?;
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .await
        .context("bind data socket")?;
    socket
        .connect((ctx.peer_host.as_str(), port))
        .await
        .context("connect data socket")?;
    let socket = tune_socket(socket, ctx.reqs.loc.sock_buf_size)?;

    ctx.synchronize().await?;

    let msg_size = ctx.reqs.loc.msg_size.max(1) as usize;
    let mut buf = vec![0u8; msg_size];
    let idle = Duration::from_secs(ctx.reqs.loc.timeout.max(1) as u64);
    let gate = ctx.gate.clone();
    let mut sent: u64 = 0;
    loop {
        if gate.finished() {
            break;
        }
        if let Some(0) = ctx.left_to_send(sent) {
            break;
        }
        let round = async {
            if socket.send(&buf).await.is_err() {
                return Round::SendFailed;
            }
            match timeout(idle, socket.recv(&mut buf)).await {
                Ok(Ok(n)) => Round::Replied(n),
                _ => Round::Lost,
            }
        };
        tokio::select! {
            r = round => {
                sent += 1;
                match r {
                    Round::Replied(n) => {
                        ctx.lstat.s.no_bytes += msg_size as u64;
                        ctx.lstat.s.no_msgs += 1;
                        if !gate.finished() {
                            ctx.lstat.r.no_bytes += n as u64;
                            ctx.lstat.r.no_msgs += 1;
                        }
                    }
                    Round::Lost => {
                        ctx.lstat.s.no_bytes += msg_size as u64;
                        ctx.lstat.s.no_msgs += 1;
                        ctx.lstat.r.no_errs += 1;
                    }
                    Round::SendFailed => ctx.lstat.s.no_errs += 1,
                }
            }
            _ = gate.wait_finished() => break,
        }
    }

    ctx.stop_timing();
    ctx.successful = true;
    ctx.exchange_results().await
}

async fn run_lat_server(ctx: &mut TestContext) -> Result<()> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .await
        .context("bind data socket")?;
    let socket = tune_socket(socket, ctx.reqs.loc.sock_buf_size)?;
    ctx.send_data_port(socket.local_addr()?.port()).await?;

    ctx.synchronize().await?;

    let msg_size = ctx.reqs.loc.msg_size.max(1) as usize;
    let mut buf = vec![0u8; msg_size];
    let idle = Duration::from_secs(ctx.reqs.loc.timeout.max(1) as u64);
    let gate = ctx.gate.clone();
    loop {
        if gate.finished() {
            break;
        }
        tokio::select! {
            r = timeout(idle, socket.recv_from(&mut buf)) => {
                match r {
                    Ok(Ok((n, src))) => {
                        if gate.finished() {
                            break;
                        }
                        ctx.lstat.r.no_bytes += n as u64;
                        ctx.lstat.r.no_msgs += 1;
                        match socket.send_to(&buf[..n], src).await {
                            Ok(m) => {
                                ctx.lstat.s.no_bytes += m as u64;
                                ctx.lstat.s.no_msgs += 1;
                            }
                            Err(_) => ctx.lstat.s.no_errs += 1,
                        }
                    }
                    Ok(Err(e)) => return Err(e).context("data receive"),
                    Err(_) => break,
                }
            }
            _ = gate.wait_finished() => break,
        }
    }

    ctx.stop_timing();
    ctx.successful = true;
    ctx.exchange_results().await
}
