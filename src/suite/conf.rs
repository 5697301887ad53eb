//! The `conf` test: no traffic, just an exchange of node descriptions so
//! each end can see what hardware and OS the other side runs. The server
//! ships its block over the control connection as fixed-width NUL-padded
//! fields; the client renders both blocks side by side.

use anyhow::{Context, Result};
use nix::sys::utsname::uname;
use std::fs;

use super::BoxFuture;
use crate::control::TestContext;
use crate::show::Gate;
use crate::wire::WireError;

/// Width of one description field on the wire
const FIELD: usize = 128;

/// Number of fields in a block
const FIELDS: usize = 4;

const BLOCK: usize = FIELD * FIELDS;

/// One side's description.
#[derive(Debug, Clone, PartialEq, Eq)]
struct NodeInfo {
    node: String,
    cpu: String,
    os: String,
    version: String,
}

impl NodeInfo {
    fn gather() -> Result<Self> {
        let uts = uname().context("uname")?;
        let cpu = match fs::read_to_string("/proc/cpuinfo") {
            Ok(contents) => describe_cpus(&contents),
            Err(_) => "unknown".to_string(),
        };
        Ok(NodeInfo {
            node: uts.nodename().to_string_lossy().into_owned(),
            cpu,
            os: format!(
                "{} {} {}",
                uts.sysname().to_string_lossy(),
                uts.release().to_string_lossy(),
                uts.machine().to_string_lossy()
            ),
            version: crate::VERSION.to_string(),
        })
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(BLOCK);
        for field in [&self.node, &self.cpu, &self.os, &self.version] {
            let bytes = field.as_bytes();
            let n = bytes.len().min(FIELD - 1);
            buf.extend_from_slice(&bytes[..n]);
            buf.resize(buf.len() + (FIELD - n), 0);
        }
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < BLOCK {
            return Err(WireError::Truncated {
                need: BLOCK - buf.len(),
                have: buf.len(),
            });
        }
        if buf.len() > BLOCK {
            return Err(WireError::Trailing {
                extra: buf.len() - BLOCK,
            });
        }
        let field = |i: usize| -> String {
            let chunk = &buf[i * FIELD..(i + 1) * FIELD];
            let end = chunk.iter().position(|&b| b == 0).unwrap_or(FIELD);
            String::from_utf8_lossy(&chunk[..end]).into_owned()
        };
        Ok(NodeInfo {
            node: field(0),
            cpu: field(1),
            os: field(2),
            version: field(3),
        })
    }
}

/// Summarize the `cpu` entries of /proc/cpuinfo into one line.
fn describe_cpus(contents: &str) -> String {
    let mut cores = 0usize;
    let mut model: Option<&str> = None;
    let mut mhz: Option<&str> = None;
    for line in contents.lines() {
        let mut split = line.splitn(2, ':');
        let key = split.next().unwrap_or("").trim();
        let value = split.next().unwrap_or("").trim();
        match key {
            "processor" => cores += 1,
            "model name" if model.is_none() => model = Some(value),
            "cpu MHz" if mhz.is_none() => mhz = Some(value),
            _ => {}
        }
    }
    let cores = cores.max(1);
    let model = model.unwrap_or("unknown cpu");
    match mhz.and_then(|m| m.parse::<f64>().ok()) {
        Some(mhz) => format!("{} x {} ({:.0} MHz)", cores, model, mhz),
        None => format!("{} x {}", cores, model),
    }
}

pub fn client(ctx: &mut TestContext) -> BoxFuture<'_> {
    Box::pin(run_client(ctx))
}

pub fn server(ctx: &mut TestContext) -> BoxFuture<'_> {
    Box::pin(run_server(ctx))
}

async fn run_client(ctx: &mut TestContext) -> Result<()> {
    ctx.client_send_request().await?;

    let mut buf = vec![0u8; BLOCK];
    ctx.ctrl_recv(&mut buf, "configuration").await?;
    let rem = NodeInfo::decode(&buf).context("bad configuration block")?;
    let loc = NodeInfo::gather()?;

    for (prefix, info) in [("loc_", &loc), ("rem_", &rem)] {
        ctx.show.view_strn(Gate::Always, prefix, "node", &info.node);
        ctx.show.view_strn(Gate::Always, prefix, "cpu", &info.cpu);
        ctx.show.view_strn(Gate::Always, prefix, "os", &info.os);
        ctx.show.view_strn(Gate::Always, prefix, "qperf", &info.version);
    }

    ctx.successful = true;
    Ok(())
}

async fn run_server(ctx: &mut TestContext) -> Result<()> {
    let info = NodeInfo::gather()?;
    ctx.ctrl_send(&info.encode(), "configuration").await?;
    ctx.successful = true;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_round_trips() {
        let info = NodeInfo {
            node: "alpha".to_string(),
            cpu: "8 x Example CPU (3000 MHz)".to_string(),
            os: "Linux 6.1.0 x86_64".to_string(),
            version: "0.2.0".to_string(),
        };
        let buf = info.encode();
        assert_eq!(buf.len(), BLOCK);
        assert_eq!(NodeInfo::decode(&buf).unwrap(), info);
    }

    #[test]
    fn oversized_fields_are_clipped_not_fatal() {
        let info = NodeInfo {
            node: "n".repeat(4 * FIELD),
            cpu: String::new(),
            os: String::new(),
            version: String::new(),
        };
        let buf = info.encode();
        assert_eq!(buf.len(), BLOCK);
        let decoded = NodeInfo::decode(&buf).unwrap();
        assert_eq!(decoded.node.len(), FIELD - 1);
    }

    #[test]
    fn cpuinfo_summary_counts_processors() {
        let contents = "\
processor\t: 0
model name\t: Example CPU
cpu MHz\t\t: 2999.998
processor\t: 1
model name\t: Example CPU
cpu MHz\t\t: 3100.000
";
        assert_eq!(describe_cpus(contents), "2 x Example CPU (3000 MHz)");
    }

    #[test]
    fn cpuinfo_summary_survives_sparse_files() {
        assert_eq!(describe_cpus(""), "1 x unknown cpu");
        assert_eq!(
            describe_cpus("processor : 0\n"),
            "1 x unknown cpu"
        );
    }

    #[test]
    fn local_gather_works() {
        let info = NodeInfo::gather().unwrap();
        assert!(!info.node.is_empty());
        assert_eq!(info.version, crate::VERSION);
    }
}
