//! # Command-Line Interface
//!
//! Argument parsing and its application onto the parameter registry. Every
//! registry parameter is reachable three ways: a both-sides option that
//! writes the local and remote cells in one stroke, and `--loc-*`/`--rem-*`
//! overrides that target a single cell. Sizes take the k/K/kb/kib suffix
//! family (decimal single letters lowercase, binary uppercase, two-letter
//! forms case-insensitive); times take s/m/h/d.
//!
//! Mode falls out of the positionals: a server hostname followed by test
//! names runs the client, no positionals at all runs the server, and
//! anything in between is a user error.

use clap::{
    builder::styling::{AnsiColor, Styles},
    Parser,
};
use std::path::PathBuf;

use anyhow::{bail, Result};
use crate::control::{ClientConfig, ServerConfig};
use crate::params::{ParamId, Params, ReqPair};
use crate::show::ShowOpts;
use crate::{defaults, suite};

/// Defines the styles for the help message to replicate clap v3's appearance.
fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Yellow.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// qperf - measure socket bandwidth and latency between two nodes
///
/// Run `qperf` with no arguments on one node to start the server, then
/// `qperf <host> <test>...` on another to run measurements against it.
#[derive(Parser, Debug, Clone, Default)]
#[command(author, version, about, long_about = None, styles = styles())]
pub struct Args {
    /// Server to run tests against; omit to run as the server
    #[arg(value_name = "HOST")]
    pub server_host: Option<String>,

    /// Tests to run, in order (conf, tcp_bw, tcp_lat, udp_bw, udp_lat)
    #[arg(value_name = "TEST")]
    pub tests: Vec<String>,

    /// Pin both sides to a CPU (1-based; 0 disables pinning)
    #[arg(short = 'a', long, help_heading = "Test Parameters")]
    pub affinity: Option<u32>,

    /// Message size in bytes (suffixes: k/m/g decimal, K/M/G binary)
    #[arg(short = 'm', long, value_parser = parse_size, help_heading = "Test Parameters")]
    pub msg_size: Option<u64>,

    /// MTU size hint for transports that honor one
    #[arg(short = 'M', long, value_parser = parse_size, help_heading = "Test Parameters")]
    pub mtu_size: Option<u64>,

    /// Stop after this many messages instead of after a time limit
    #[arg(short = 'n', long, help_heading = "Test Parameters")]
    pub no_msgs: Option<u32>,

    /// Fixed port for test data sockets (0 picks an ephemeral port)
    #[arg(short = 'p', long, help_heading = "Test Parameters")]
    pub port: Option<u32>,

    /// Socket send/receive buffer size
    #[arg(short = 'S', long, value_parser = parse_size, help_heading = "Test Parameters")]
    pub sock_buf_size: Option<u64>,

    /// Measurement time (suffixes: s, m, h, d)
    #[arg(short = 't', long, value_parser = parse_time, help_heading = "Test Parameters")]
    pub time: Option<u32>,

    /// Deadline for individual control operations
    #[arg(short = 'T', long, value_parser = parse_time, help_heading = "Test Parameters")]
    pub timeout: Option<u32>,

    /// Short tag carried in the request, echoed in diagnostics
    #[arg(short = 'i', long, help_heading = "Test Parameters")]
    pub id: Option<String>,

    /// Swap the send and receive roles of the two sides
    #[arg(short = 'f', long, help_heading = "Test Parameters")]
    pub flip: bool,

    /// Ask the receiving side to use access semantics where supported
    #[arg(long, help_heading = "Test Parameters")]
    pub access_recv: bool,

    /// Busy-poll instead of sleeping in completion waits where supported
    #[arg(short = 'P', long, help_heading = "Test Parameters")]
    pub poll: bool,

    /// Outstanding RDMA reads and atomics per connection
    #[arg(short = 'R', long, help_heading = "Test Parameters")]
    pub rd_atomic: Option<u32>,

    // Single-cell overrides. Each mirrors a both-sides option above but
    // touches only the named side.
    #[arg(long, value_name = "N", help_heading = "Local/Remote Overrides")]
    pub loc_affinity: Option<u32>,
    #[arg(long, value_name = "N", help_heading = "Local/Remote Overrides")]
    pub rem_affinity: Option<u32>,
    #[arg(long, value_name = "SIZE", value_parser = parse_size, help_heading = "Local/Remote Overrides")]
    pub loc_msg_size: Option<u64>,
    #[arg(long, value_name = "SIZE", value_parser = parse_size, help_heading = "Local/Remote Overrides")]
    pub rem_msg_size: Option<u64>,
    #[arg(long, value_name = "SIZE", value_parser = parse_size, help_heading = "Local/Remote Overrides")]
    pub loc_mtu_size: Option<u64>,
    #[arg(long, value_name = "SIZE", value_parser = parse_size, help_heading = "Local/Remote Overrides")]
    pub rem_mtu_size: Option<u64>,
    #[arg(long, value_name = "N", help_heading = "Local/Remote Overrides")]
    pub loc_no_msgs: Option<u32>,
    #[arg(long, value_name = "N", help_heading = "Local/Remote Overrides")]
    pub rem_no_msgs: Option<u32>,
    #[arg(long, value_name = "PORT", help_heading = "Local/Remote Overrides")]
    pub loc_port: Option<u32>,
    #[arg(long, value_name = "PORT", help_heading = "Local/Remote Overrides")]
    pub rem_port: Option<u32>,
    #[arg(long, value_name = "SIZE", value_parser = parse_size, help_heading = "Local/Remote Overrides")]
    pub loc_sock_buf_size: Option<u64>,
    #[arg(long, value_name = "SIZE", value_parser = parse_size, help_heading = "Local/Remote Overrides")]
    pub rem_sock_buf_size: Option<u64>,
    #[arg(long, value_name = "TIME", value_parser = parse_time, help_heading = "Local/Remote Overrides")]
    pub loc_time: Option<u32>,
    #[arg(long, value_name = "TIME", value_parser = parse_time, help_heading = "Local/Remote Overrides")]
    pub rem_time: Option<u32>,
    #[arg(long, value_name = "TIME", value_parser = parse_time, help_heading = "Local/Remote Overrides")]
    pub loc_timeout: Option<u32>,
    #[arg(long, value_name = "TIME", value_parser = parse_time, help_heading = "Local/Remote Overrides")]
    pub rem_timeout: Option<u32>,
    #[arg(long, value_name = "TAG", help_heading = "Local/Remote Overrides")]
    pub loc_id: Option<String>,
    #[arg(long, value_name = "TAG", help_heading = "Local/Remote Overrides")]
    pub rem_id: Option<String>,
    #[arg(long, help_heading = "Local/Remote Overrides")]
    pub loc_flip: bool,
    #[arg(long, help_heading = "Local/Remote Overrides")]
    pub rem_flip: bool,
    #[arg(long, help_heading = "Local/Remote Overrides")]
    pub loc_access_recv: bool,
    #[arg(long, help_heading = "Local/Remote Overrides")]
    pub rem_access_recv: bool,
    #[arg(long, help_heading = "Local/Remote Overrides")]
    pub loc_poll: bool,
    #[arg(long, help_heading = "Local/Remote Overrides")]
    pub rem_poll: bool,
    #[arg(long, value_name = "N", help_heading = "Local/Remote Overrides")]
    pub loc_rd_atomic: Option<u32>,
    #[arg(long, value_name = "N", help_heading = "Local/Remote Overrides")]
    pub rem_rd_atomic: Option<u32>,

    /// Significant digits in rendered results
    #[arg(short = 'e', long, default_value_t = defaults::PRECISION, help_heading = "Output and Formatting")]
    pub precision: usize,

    /// No unit ladders and no thousands separators (machine-friendly)
    #[arg(short = 'u', long, help_heading = "Output and Formatting")]
    pub unify_units: bool,

    /// Collapse the loc/rem split when traffic is one-directional
    #[arg(short = 'U', long, help_heading = "Output and Formatting")]
    pub unify_nodes: bool,

    /// Raise every verbosity category; repeat for the detailed level
    #[arg(short = 'v', long, action = clap::ArgAction::Count, help_heading = "Output and Formatting")]
    pub verbose: u8,

    /// Show configuration values; repeat for more
    #[arg(long, action = clap::ArgAction::Count, help_heading = "Output and Formatting")]
    pub verbose_conf: u8,

    /// Show statistics and counters; repeat for more
    #[arg(long, action = clap::ArgAction::Count, help_heading = "Output and Formatting")]
    pub verbose_stat: u8,

    /// Show timing details; repeat for more
    #[arg(long, action = clap::ArgAction::Count, help_heading = "Output and Formatting")]
    pub verbose_time: u8,

    /// Show the parameters each test consumed; repeat for more
    #[arg(long, action = clap::ArgAction::Count, help_heading = "Output and Formatting")]
    pub verbose_used: u8,

    /// Enable debug diagnostics
    #[arg(short = 'D', long, help_heading = "Output and Formatting")]
    pub debug: bool,

    /// Write machine-readable per-test results to this file
    #[arg(long, value_name = "FILE", help_heading = "Output and Formatting")]
    pub output_json: Option<PathBuf>,

    /// Mirror diagnostics into a daily-rolling log file
    #[arg(long, value_name = "FILE", help_heading = "Output and Formatting")]
    pub log_file: Option<String>,

    /// Server hostname, as an alternative to the positional form
    #[arg(short = 'H', long, value_name = "HOST", help_heading = "Connection")]
    pub host: Option<String>,

    /// Control port the server listens on and the client connects to
    #[arg(long, default_value_t = defaults::LISTEN_PORT, value_name = "PORT", help_heading = "Connection")]
    pub listen_port: u16,

    /// Server-side deadline for reading a request
    #[arg(long, value_parser = parse_time, default_value = "5", value_name = "TIME", help_heading = "Connection")]
    pub server_timeout: u32,

    /// Keep retrying the connect for this long while the server comes up
    #[arg(short = 'W', long, value_parser = parse_time, value_name = "TIME", help_heading = "Connection")]
    pub wait: Option<u32>,
}

/// What this invocation is.
#[derive(Debug)]
pub enum Mode {
    Server(ServerConfig),
    Client {
        cfg: ClientConfig,
        tests: Vec<String>,
    },
}

/// Parse a byte count with the size suffix grammar.
///
/// Single letters are case-sensitive (`k` decimal, `K` binary); two-letter
/// forms are case-insensitive (`kb` decimal, `kib` binary). A space between
/// number and suffix is tolerated.
pub fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let idx = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    let (num_str, suffix) = s.split_at(idx);
    let suffix = suffix.trim_start();
    let num: f64 = num_str
        .parse()
        .map_err(|_| format!("bad number in size: {:?}", s))?;
    let mult: f64 = match suffix {
        "" => 1.0,
        "k" => 1e3,
        "m" => 1e6,
        "g" => 1e9,
        "K" => 1024.0,
        "M" => (1u64 << 20) as f64,
        "G" => (1u64 << 30) as f64,
        _ => match suffix.to_ascii_lowercase().as_str() {
            "kb" => 1e3,
            "mb" => 1e6,
            "gb" => 1e9,
            "kib" => 1024.0,
            "mib" => (1u64 << 20) as f64,
            "gib" => (1u64 << 30) as f64,
            _ => return Err(format!("unknown size suffix: {:?}", suffix)),
        },
    };
    Ok((num * mult).round() as u64)
}

/// Parse a duration in seconds with the s/m/h/d suffix grammar.
pub fn parse_time(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let idx = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    let (num_str, suffix) = s.split_at(idx);
    let num: f64 = num_str
        .parse()
        .map_err(|_| format!("bad number in time: {:?}", s))?;
    let mult: f64 = match suffix.trim_start() {
        "" | "s" | "S" => 1.0,
        "m" | "M" => 60.0,
        "h" | "H" => 3600.0,
        "d" | "D" => 86400.0,
        other => return Err(format!("unknown time suffix: {:?}", other)),
    };
    Ok((num * mult).round() as u32)
}

fn set_num(
    params: &mut Params,
    reqs: &mut ReqPair,
    name: &'static str,
    loc: Option<ParamId>,
    rem: Option<ParamId>,
    value: Option<u64>,
) {
    if let Some(v) = value {
        params.set_param(reqs, name, loc, v);
        params.set_param(reqs, name, rem, v);
    }
}

fn set_flag(
    params: &mut Params,
    reqs: &mut ReqPair,
    name: &'static str,
    loc: Option<ParamId>,
    rem: Option<ParamId>,
    value: bool,
) {
    if value {
        params.set_param(reqs, name, loc, 1);
        params.set_param(reqs, name, rem, 1);
    }
}

/// Write every supplied option into the registry. Both-sides options hit
/// the local and remote cells with one shared display name; the single-cell
/// overrides pass the no-op sentinel for the side they leave alone.
fn apply(args: &Args, params: &mut Params, reqs: &mut ReqPair) -> Result<()> {
    use ParamId::*;

    let num = args.affinity.map(u64::from);
    set_num(params, reqs, "affinity", Some(LocAffinity), Some(RemAffinity), num);
    set_num(params, reqs, "loc_affinity", Some(LocAffinity), None, args.loc_affinity.map(u64::from));
    set_num(params, reqs, "rem_affinity", None, Some(RemAffinity), args.rem_affinity.map(u64::from));

    set_num(params, reqs, "msg_size", Some(LocMsgSize), Some(RemMsgSize), args.msg_size);
    set_num(params, reqs, "loc_msg_size", Some(LocMsgSize), None, args.loc_msg_size);
    set_num(params, reqs, "rem_msg_size", None, Some(RemMsgSize), args.rem_msg_size);

    set_num(params, reqs, "mtu_size", Some(LocMtuSize), Some(RemMtuSize), args.mtu_size);
    set_num(params, reqs, "loc_mtu_size", Some(LocMtuSize), None, args.loc_mtu_size);
    set_num(params, reqs, "rem_mtu_size", None, Some(RemMtuSize), args.rem_mtu_size);

    set_num(params, reqs, "no_msgs", Some(LocNoMsgs), Some(RemNoMsgs), args.no_msgs.map(u64::from));
    set_num(params, reqs, "loc_no_msgs", Some(LocNoMsgs), None, args.loc_no_msgs.map(u64::from));
    set_num(params, reqs, "rem_no_msgs", None, Some(RemNoMsgs), args.rem_no_msgs.map(u64::from));

    set_num(params, reqs, "port", Some(LocPort), Some(RemPort), args.port.map(u64::from));
    set_num(params, reqs, "loc_port", Some(LocPort), None, args.loc_port.map(u64::from));
    set_num(params, reqs, "rem_port", None, Some(RemPort), args.rem_port.map(u64::from));

    set_num(params, reqs, "rd_atomic", Some(LocRdAtomic), Some(RemRdAtomic), args.rd_atomic.map(u64::from));
    set_num(params, reqs, "loc_rd_atomic", Some(LocRdAtomic), None, args.loc_rd_atomic.map(u64::from));
    set_num(params, reqs, "rem_rd_atomic", None, Some(RemRdAtomic), args.rem_rd_atomic.map(u64::from));

    set_num(params, reqs, "sock_buf_size", Some(LocSockBufSize), Some(RemSockBufSize), args.sock_buf_size);
    set_num(params, reqs, "loc_sock_buf_size", Some(LocSockBufSize), None, args.loc_sock_buf_size);
    set_num(params, reqs, "rem_sock_buf_size", None, Some(RemSockBufSize), args.rem_sock_buf_size);

    set_num(params, reqs, "time", Some(LocTime), Some(RemTime), args.time.map(u64::from));
    set_num(params, reqs, "loc_time", Some(LocTime), None, args.loc_time.map(u64::from));
    set_num(params, reqs, "rem_time", None, Some(RemTime), args.rem_time.map(u64::from));

    set_num(params, reqs, "timeout", Some(LocTimeout), Some(RemTimeout), args.timeout.map(u64::from));
    set_num(params, reqs, "loc_timeout", Some(LocTimeout), None, args.loc_timeout.map(u64::from));
    set_num(params, reqs, "rem_timeout", None, Some(RemTimeout), args.rem_timeout.map(u64::from));

    set_flag(params, reqs, "flip", Some(LocFlip), Some(RemFlip), args.flip);
    set_flag(params, reqs, "loc_flip", Some(LocFlip), None, args.loc_flip);
    set_flag(params, reqs, "rem_flip", None, Some(RemFlip), args.rem_flip);

    set_flag(params, reqs, "access_recv", Some(LocAccessRecv), Some(RemAccessRecv), args.access_recv);
    set_flag(params, reqs, "loc_access_recv", Some(LocAccessRecv), None, args.loc_access_recv);
    set_flag(params, reqs, "rem_access_recv", None, Some(RemAccessRecv), args.rem_access_recv);

    set_flag(params, reqs, "poll", Some(LocPollMode), Some(RemPollMode), args.poll);
    set_flag(params, reqs, "loc_poll", Some(LocPollMode), None, args.loc_poll);
    set_flag(params, reqs, "rem_poll", None, Some(RemPollMode), args.rem_poll);

    if let Some(ref id) = args.id {
        params.set_param_str(reqs, "id", Some(LocId), id)?;
        params.set_param_str(reqs, "id", Some(RemId), id)?;
    }
    if let Some(ref id) = args.loc_id {
        params.set_param_str(reqs, "loc_id", Some(LocId), id)?;
    }
    if let Some(ref id) = args.rem_id {
        params.set_param_str(reqs, "rem_id", Some(RemId), id)?;
    }

    Ok(())
}

fn show_opts(args: &Args) -> ShowOpts {
    let level = |specific: u8| specific.max(args.verbose).min(2);
    ShowOpts {
        precision: args.precision,
        unify_units: args.unify_units,
        unify_nodes: args.unify_nodes,
        debug: args.debug,
        verbose_conf: level(args.verbose_conf),
        verbose_stat: level(args.verbose_stat),
        verbose_time: level(args.verbose_time),
        verbose_used: level(args.verbose_used),
    }
}

/// Apply the options and derive the run mode.
pub fn configure(args: &Args, params: &mut Params, reqs: &mut ReqPair) -> Result<Mode> {
    apply(args, params, reqs)?;

    // An explicit -H frees the first positional to be a test name.
    let (host, tests) = match (&args.host, &args.server_host) {
        (Some(host), Some(first)) => {
            let mut tests = vec![first.clone()];
            tests.extend(args.tests.iter().cloned());
            (Some(host.clone()), tests)
        }
        (Some(host), None) => (Some(host.clone()), args.tests.clone()),
        (None, Some(first)) => (Some(first.clone()), args.tests.clone()),
        (None, None) => (None, args.tests.clone()),
    };

    match host {
        None => {
            if let Some(name) = params.first_set() {
                bail!("{} is only valid in client mode", name);
            }
            Ok(Mode::Server(ServerConfig {
                listen_port: args.listen_port,
                server_timeout: args.server_timeout,
            }))
        }
        Some(host) => {
            if tests.is_empty() {
                bail!(
                    "no test specified; known tests: {}",
                    suite::names().collect::<Vec<_>>().join(", ")
                );
            }
            Ok(Mode::Client {
                cfg: ClientConfig {
                    host,
                    listen_port: args.listen_port,
                    wait: args.wait,
                    show: show_opts(args),
                    output_json: args.output_json.clone(),
                },
                tests,
            })
        }
    }
}
