//! # Control Protocol
//!
//! The control plane that makes a measurement happen. The server binds the
//! well-known port, accepts one connection per test, reads and validates the
//! versioned request, and runs the matching server-side test body with a
//! fresh context. The client resolves the server, sends its request, and
//! drives the client-side body; the two sides meet in [`TestContext`]'s
//! lifecycle services: request send, synchronize, bounded measurement, and
//! the results exchange.
//!
//! A per-test failure is confined to its context: the server logs it and
//! keeps accepting, the client marks the test unsuccessful and moves on to
//! the next one.

use anyhow::{anyhow, bail, Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tokio::time::sleep;
use tracing::{debug, error, info};

use crate::channel::Channel;
use crate::params::{ParamId, Params, ReqPair};
use crate::results::ResultsWriter;
use crate::show::{ShowOpts, ShowTable};
use crate::stats::{self, Res};
use crate::suite;
use crate::timing::{FinishGate, Timer};
use crate::wire::{Req, Stat, REQ_SIZE, STAT_SIZE, SYNC};
use crate::{defaults, VER_INC, VER_MAJ, VER_MIN};

/// Which end of the control connection this context is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Client-side settings that outlive a single test.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server hostname or address
    pub host: String,
    pub listen_port: u16,
    /// Keep retrying the connect sweep for this many seconds
    pub wait: Option<u32>,
    pub show: ShowOpts,
    pub output_json: Option<PathBuf>,
}

/// Server-side settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_port: u16,
    /// Deadline for reading the initial request, seconds
    pub server_timeout: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen_port: defaults::LISTEN_PORT,
            server_timeout: defaults::SERVER_TIMEOUT,
        }
    }
}

/// All state for one test on one side.
///
/// Built fresh per test so nothing leaks between runs: the local statistics
/// start from the process template, the finish gate is unlatched, and the
/// show queue is empty.
pub struct TestContext {
    pub role: Role,
    /// Server hostname, used by client test bodies for data connections
    pub peer_host: String,
    pub listen_port: u16,
    pub wait: Option<u32>,
    pub params: Params,
    pub reqs: ReqPair,
    pub lstat: Stat,
    pub rstat: Stat,
    pub res: Res,
    pub gate: Arc<FinishGate>,
    pub show: ShowTable,
    pub successful: bool,
    timer: Option<Timer>,
    ctrl: Option<Channel>,
}

/// The per-process statistics template a test's local snapshot starts from.
pub fn initial_stat() -> Stat {
    Stat {
        no_cpus: num_cpus::get() as u16,
        no_ticks: crate::timing::ticks_per_sec(),
        ..Stat::default()
    }
}

impl TestContext {
    fn client(cfg: &ClientConfig, params: Params, reqs: ReqPair) -> Result<Self> {
        Ok(TestContext {
            role: Role::Client,
            peer_host: cfg.host.clone(),
            listen_port: cfg.listen_port,
            wait: cfg.wait,
            params,
            reqs,
            lstat: initial_stat(),
            rstat: Stat::default(),
            res: Res::default(),
            gate: FinishGate::new()?,
            show: ShowTable::new(cfg.show.clone()),
            successful: false,
            timer: None,
            ctrl: None,
        })
    }

    fn server(ctrl: Channel, req: Req) -> Result<Self> {
        Ok(TestContext {
            role: Role::Server,
            peer_host: String::new(),
            listen_port: 0,
            wait: None,
            params: Params::new(),
            reqs: ReqPair {
                loc: req,
                rem: Req::default(),
            },
            lstat: initial_stat(),
            rstat: Stat::default(),
            res: Res::default(),
            gate: FinishGate::new()?,
            show: ShowTable::new(ShowOpts::default()),
            successful: false,
            timer: None,
            ctrl: Some(ctrl),
        })
    }

    fn ctrl(&mut self) -> Result<&mut Channel> {
        self.ctrl
            .as_mut()
            .ok_or_else(|| anyhow!("internal error: control channel not connected"))
    }

    /// Send on the control channel under this test's deadline.
    pub async fn ctrl_send(&mut self, buf: &[u8], item: &str) -> Result<()> {
        let secs = self.reqs.loc.timeout;
        self.ctrl()?.send(buf, secs, item).await
    }

    /// Receive on the control channel under this test's deadline.
    pub async fn ctrl_recv(&mut self, buf: &mut [u8], item: &str) -> Result<()> {
        let secs = self.reqs.loc.timeout;
        self.ctrl()?.recv(buf, secs, item).await
    }

    /// Connect to the server (retrying the whole address sweep once a second
    /// while a wait budget remains) and send the encoded request mirror.
    pub async fn client_send_request(&mut self) -> Result<()> {
        let stream = connect_with_retry(&self.peer_host, self.listen_port, self.wait).await?;
        let stream = tune_stream(stream, 0, true)?;
        self.ctrl = Some(Channel::new(stream, "server"));
        let buf = self.reqs.rem.encode();
        self.ctrl_send(&buf, "request").await
    }

    /// Exchange the sync literal (client sends first) and start timing.
    /// After both sides return from here the measurement windows overlap to
    /// within one one-way trip.
    pub async fn synchronize(&mut self) -> Result<()> {
        let mut echo = [0u8; 4];
        match self.role {
            Role::Client => {
                self.ctrl_send(&SYNC, "sync").await?;
                self.ctrl_recv(&mut echo, "sync").await?;
            }
            Role::Server => {
                self.ctrl_recv(&mut echo, "sync").await?;
                self.ctrl_send(&SYNC, "sync").await?;
            }
        }
        if echo != SYNC {
            bail!("sync mismatch: expected {:?}, got {:?}", SYNC, echo);
        }
        self.timer = Some(Timer::start(
            &self.gate,
            &mut self.lstat,
            self.reqs.loc.time,
        )?);
        Ok(())
    }

    /// Trip the gate and latch the end snapshot. Safe to call repeatedly.
    pub fn stop_timing(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.stop(&self.gate, &mut self.lstat);
        }
    }

    pub fn finished(&self) -> bool {
        self.gate.finished()
    }

    /// Remaining message budget, or `None` when the test is time-bounded.
    pub fn left_to_send(&self, sent: u64) -> Option<u64> {
        let budget = self.reqs.loc.no_msgs as u64;
        if budget == 0 {
            None
        } else {
            Some(budget.saturating_sub(sent))
        }
    }

    /// Post-test statistics exchange: the server sends its snapshot, the
    /// client acknowledges with a sync. Runs only for a successful
    /// measurement and leaves both snapshots cross-added.
    pub async fn exchange_results(&mut self) -> Result<()> {
        if !self.successful {
            return Ok(());
        }
        self.successful = false;
        match self.role {
            Role::Client => {
                let mut buf = vec![0u8; STAT_SIZE];
                self.ctrl_recv(&mut buf, "stats").await?;
                self.rstat =
                    Stat::decode(&buf).map_err(|e| anyhow!("bad stats from server: {}", e))?;
                self.ctrl_send(&SYNC, "sync").await?;
            }
            Role::Server => {
                let buf = self.lstat.encode();
                self.ctrl_send(&buf, "stats").await?;
                let mut echo = [0u8; 4];
                self.ctrl_recv(&mut echo, "sync").await?;
                if echo != SYNC {
                    bail!("sync mismatch after results");
                }
            }
        }
        stats::cross_add(&mut self.lstat, &mut self.rstat);
        self.successful = true;
        Ok(())
    }

    /// Tell the client which ephemeral port the data socket landed on.
    pub async fn send_data_port(&mut self, port: u16) -> Result<()> {
        let buf = (port as u32).to_le_bytes();
        self.ctrl_send(&buf, "data port").await
    }

    /// Learn the server's data port.
    pub async fn recv_data_port(&mut self) -> Result<u16> {
        let mut buf = [0u8; 4];
        self.ctrl_recv(&mut buf, "data port").await?;
        Ok(u32::from_le_bytes(buf) as u16)
    }
}

/// Apply socket options tokio does not expose, going through a std stream.
pub fn tune_stream(stream: TcpStream, sock_buf_size: u32, nodelay: bool) -> Result<TcpStream> {
    let std_stream = stream.into_std()?;
    {
        let sock = socket2::SockRef::from(&std_stream);
        if nodelay {
            sock.set_nodelay(true)?;
        }
        if sock_buf_size > 0 {
            sock.set_recv_buffer_size(sock_buf_size as usize)?;
            sock.set_send_buffer_size(sock_buf_size as usize)?;
        }
    }
    Ok(TcpStream::from_std(std_stream)?)
}

/// Pin the calling thread to a CPU. `cpu_index` is 0-based. On the
/// single-threaded runtime this is the thread every measurement loop runs
/// on, so the pin constrains the whole test.
pub fn set_affinity(cpu_index: usize) -> Result<()> {
    let ids = core_affinity::get_core_ids()
        .ok_or_else(|| anyhow!("cannot enumerate CPUs for affinity"))?;
    let id = ids.get(cpu_index).ok_or_else(|| {
        anyhow!(
            "affinity CPU {} does not exist, {} CPUs available",
            cpu_index + 1,
            ids.len()
        )
    })?;
    if !core_affinity::set_for_current(*id) {
        bail!("failed to pin to CPU {}", cpu_index + 1);
    }
    Ok(())
}

/// Bind the control listener: SO_REUSEADDR, backlog 5, nonblocking.
pub fn bind_listener(port: u16) -> Result<TcpListener> {
    let addr: SocketAddr = (Ipv4Addr::UNSPECIFIED, port).into();
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
        .context("create listen socket")?;
    socket
        .set_reuse_address(true)
        .context("set SO_REUSEADDR")?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("bind port {}", port))?;
    socket.listen(5).context("listen")?;
    socket.set_nonblocking(true)?;
    let std_listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(std_listener)?)
}

/// Run the server on the configured port. Never returns under normal
/// operation.
pub async fn run_server(cfg: ServerConfig) -> Result<()> {
    let listener = bind_listener(cfg.listen_port)?;
    info!(
        "qperf {} server listening on port {}",
        crate::VERSION,
        listener.local_addr()?.port()
    );
    serve(listener, &cfg).await
}

/// Accept loop: one request, one test, one fresh context at a time.
/// Failures of individual tests are logged and do not stop the loop.
pub async fn serve(listener: TcpListener, cfg: &ServerConfig) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await.context("accept")?;
        debug!("accepted control connection from {}", peer);
        if let Err(e) = serve_one(stream, cfg).await {
            error!("{:#}", e);
        }
    }
}

async fn serve_one(stream: TcpStream, cfg: &ServerConfig) -> Result<()> {
    let stream = tune_stream(stream, 0, true)?;
    let mut ctrl = Channel::new(stream, "client");

    let mut buf = [0u8; REQ_SIZE];
    ctrl.recv(&mut buf, cfg.server_timeout, "request").await?;
    let req = Req::decode(&buf).map_err(|e| anyhow!("bad request: {}", e))?;

    // An incompatible peer gets no reply; it will notice via its own
    // timeout. The accept loop keeps going either way.
    if let Some(upgrade) = version_gate(req.ver_maj, req.ver_min, req.ver_inc) {
        error!("{}", upgrade);
        return Ok(());
    }
    let test = suite::by_index(req.req_index)
        .ok_or_else(|| anyhow!("request for unknown test index {}", req.req_index))?;

    info!("running test {}", test.name);
    let mut ctx = TestContext::server(ctrl, req)?;
    if ctx.reqs.loc.affinity != 0 {
        set_affinity((ctx.reqs.loc.affinity - 1) as usize)?;
    }
    let result = (test.server)(&mut ctx).await;
    ctx.stop_timing();
    result.with_context(|| format!("test {} failed", test.name))
}

/// Decide whether a peer version is acceptable; if not, produce the
/// one-line upgrade hint naming the side that is behind. Incremental
/// version differences are tolerated.
fn version_gate(maj: u16, min: u16, inc: u16) -> Option<String> {
    if (maj, min) == (VER_MAJ, VER_MIN) {
        return None;
    }
    let ours = format!("{}.{}.{}", VER_MAJ, VER_MIN, VER_INC);
    let theirs = format!("{}.{}.{}", maj, min, inc);
    Some(if (maj, min) < (VER_MAJ, VER_MIN) {
        format!("upgrade client from {} to {}", theirs, ours)
    } else {
        format!("upgrade server from {} to {}", ours, theirs)
    })
}

async fn connect_once(host: &str, port: u16) -> Result<TcpStream> {
    let addrs: Vec<SocketAddr> = lookup_host((host, port))
        .await
        .with_context(|| format!("cannot resolve {}", host))?
        .collect();
    if addrs.is_empty() {
        bail!("no addresses for {}", host);
    }
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(anyhow!(
        "cannot connect to {}:{}: {}",
        host,
        port,
        last_err.expect("at least one address was tried")
    ))
}

async fn connect_with_retry(host: &str, port: u16, wait: Option<u32>) -> Result<TcpStream> {
    let give_up = wait.map(|w| Instant::now() + Duration::from_secs(w as u64));
    loop {
        match connect_once(host, port).await {
            Ok(stream) => return Ok(stream),
            Err(e) => match give_up {
                Some(deadline) if Instant::now() < deadline => {
                    debug!("connect failed ({:#}), retrying", e);
                    sleep(Duration::from_secs(1)).await;
                }
                _ => return Err(e),
            },
        }
    }
}

/// Run every named test against the server. Returns whether all of them
/// completed successfully; individual failures are reported and skipped.
pub async fn run_client(
    cfg: &ClientConfig,
    tests: &[String],
    params: &mut Params,
    reqs: &mut ReqPair,
) -> Result<bool> {
    let mut writer = cfg.output_json.as_ref().map(|p| ResultsWriter::new(p.clone()));
    let mut all_ok = true;

    for name in tests {
        let (index, test) =
            suite::find(name).ok_or_else(|| anyhow!("unknown test '{}'", name))?;
        match run_one(cfg, index, test, params, reqs).await {
            Ok(ctx) => {
                if let Some(writer) = writer.as_mut() {
                    writer.add(test.name, &ctx.res, &ctx.lstat, &ctx.rstat);
                }
            }
            Err(e) => {
                error!("{:#}", e);
                all_ok = false;
            }
        }
    }

    if let Some(writer) = writer {
        writer.finalize()?;
    }
    Ok(all_ok)
}

async fn run_one(
    cfg: &ClientConfig,
    index: u16,
    test: &suite::TestCase,
    params: &mut Params,
    reqs: &mut ReqPair,
) -> Result<TestContext> {
    params.reset_inuse();

    // A message budget replaces the default time bound.
    let budgeted =
        params.is_set(ParamId::LocNoMsgs) || params.is_set(ParamId::RemNoMsgs);
    if !budgeted {
        if !params.is_set(ParamId::LocTime) {
            params.set_value(reqs, ParamId::LocTime, defaults::TEST_TIME as u64);
        }
        if !params.is_set(ParamId::RemTime) {
            params.set_value(reqs, ParamId::RemTime, defaults::TEST_TIME as u64);
        }
    }
    if !params.is_set(ParamId::LocTimeout) {
        params.set_value(reqs, ParamId::LocTimeout, defaults::TIMEOUT as u64);
    }
    if !params.is_set(ParamId::RemTimeout) {
        params.set_value(reqs, ParamId::RemTimeout, defaults::TIMEOUT as u64);
    }

    for id in test.uses {
        params.mark_used(*id);
    }
    for id in [
        ParamId::LocAffinity,
        ParamId::RemAffinity,
        ParamId::LocTime,
        ParamId::RemTime,
        ParamId::LocTimeout,
        ParamId::RemTimeout,
    ] {
        params.mark_used(id);
    }
    params.warn_unused(test.name);

    if reqs.loc.affinity != 0 {
        set_affinity((reqs.loc.affinity - 1) as usize)?;
    }

    reqs.loc.req_index = index;
    reqs.loc.ver_maj = VER_MAJ;
    reqs.loc.ver_min = VER_MIN;
    reqs.loc.ver_inc = VER_INC;
    reqs.rem.req_index = index;
    reqs.rem.ver_maj = VER_MAJ;
    reqs.rem.ver_min = VER_MIN;
    reqs.rem.ver_inc = VER_INC;

    println!("{}:", test.name);

    let mut ctx = TestContext::client(cfg, params.clone(), reqs.clone())?;
    let body = (test.client)(&mut ctx).await;
    ctx.stop_timing();

    // Keep flag evolution visible to the following tests.
    *params = ctx.params.clone();
    *reqs = ctx.reqs.clone();

    body.with_context(|| format!("test {} failed", test.name))?;
    if !ctx.successful {
        bail!("test {} did not complete", test.name);
    }

    ctx.res = stats::derive(&ctx.lstat, &ctx.rstat);
    stats::show_results(
        &mut ctx.show,
        &ctx.res,
        &ctx.lstat,
        &ctx.rstat,
        &ctx.params,
        &ctx.reqs,
    );
    ctx.show.place_show();
    Ok(ctx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_gate_names_the_lagging_side() {
        assert_eq!(version_gate(VER_MAJ, VER_MIN, 9), None);
        assert_eq!(
            version_gate(0, 1, 0).unwrap(),
            "upgrade client from 0.1.0 to 0.2.0"
        );
        assert_eq!(
            version_gate(1, 0, 0).unwrap(),
            "upgrade server from 0.2.0 to 1.0.0"
        );
    }

    #[test]
    fn initial_stat_reflects_this_host() {
        let stat = initial_stat();
        assert!(stat.no_cpus >= 1);
        assert!(stat.no_ticks >= 1);
        assert_eq!(stat.s.no_bytes, 0);
    }

    #[tokio::test]
    async fn listener_accepts_on_ephemeral_port() {
        let listener = bind_listener(0).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        let connect = TcpStream::connect(addr);
        let (accepted, connected) = tokio::join!(listener.accept(), connect);
        accepted.unwrap();
        connected.unwrap();
    }

    #[tokio::test]
    async fn message_budget_overrides_the_clock() {
        let cfg = ClientConfig {
            host: "localhost".to_string(),
            listen_port: 0,
            wait: None,
            show: ShowOpts::default(),
            output_json: None,
        };
        let mut reqs = ReqPair::default();
        reqs.loc.no_msgs = 10;
        let ctx = TestContext::client(&cfg, Params::new(), reqs).unwrap();

        assert_eq!(ctx.left_to_send(0), Some(10));
        assert_eq!(ctx.left_to_send(7), Some(3));
        assert_eq!(ctx.left_to_send(12), Some(0));

        let unbounded = TestContext::client(&cfg, Params::new(), ReqPair::default()).unwrap();
        assert_eq!(unbounded.left_to_send(1_000_000), None);
    }
}
