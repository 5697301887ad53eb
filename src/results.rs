//! # Machine-Readable Results
//!
//! Optional JSON output alongside the human-readable tables. One record per
//! completed test, collected during the run and written out once at client
//! exit so an interrupted run never leaves a half-written file behind.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use tracing::info;

use crate::stats::Res;
use crate::wire::{Stat, Ustat};

/// One side's contribution to a test record.
#[derive(Debug, Clone, Serialize)]
pub struct SideRecord {
    pub time_real_s: f64,
    pub time_cpu_s: f64,
    pub cpus_used: f64,
    pub send: Ustat,
    pub recv: Ustat,
}

/// Everything the run learned about one test.
#[derive(Debug, Clone, Serialize)]
pub struct TestRecord {
    pub test: String,
    pub timestamp: DateTime<Utc>,
    pub latency_s: f64,
    pub msg_rate: f64,
    pub send_bw: f64,
    pub recv_bw: f64,
    pub send_cost: f64,
    pub recv_cost: f64,
    pub local: SideRecord,
    pub remote: SideRecord,
}

#[derive(Debug, Serialize)]
struct Report<'a> {
    qperf: &'static str,
    generated: DateTime<Utc>,
    results: &'a [TestRecord],
}

/// Collects test records and writes the final report.
#[derive(Debug)]
pub struct ResultsWriter {
    path: PathBuf,
    records: Vec<TestRecord>,
}

fn side(res_time_real: f64, res_time_cpu: f64, cpus_used: f64, stat: &Stat) -> SideRecord {
    SideRecord {
        time_real_s: res_time_real,
        time_cpu_s: res_time_cpu,
        cpus_used,
        send: stat.s,
        recv: stat.r,
    }
}

impl ResultsWriter {
    pub fn new(path: PathBuf) -> Self {
        ResultsWriter {
            path,
            records: Vec::new(),
        }
    }

    /// Queue the record for one completed test.
    pub fn add(&mut self, test: &str, res: &Res, lstat: &Stat, rstat: &Stat) {
        self.records.push(TestRecord {
            test: test.to_string(),
            timestamp: Utc::now(),
            latency_s: res.latency,
            msg_rate: res.msg_rate,
            send_bw: res.send_bw,
            recv_bw: res.recv_bw,
            send_cost: res.send_cost,
            recv_cost: res.recv_cost,
            local: side(res.l.time_real, res.l.time_cpu, res.l.cpu_total, lstat),
            remote: side(res.r.time_real, res.r.time_cpu, res.r.cpu_total, rstat),
        });
    }

    /// Write the report. Consumes the writer; nothing is appended later.
    pub fn finalize(self) -> Result<()> {
        let report = Report {
            qperf: crate::VERSION,
            generated: Utc::now(),
            results: &self.records,
        };
        let json = serde_json::to_string_pretty(&report).context("serialize results")?;
        fs::write(&self.path, json)
            .with_context(|| format!("write results to {}", self.path.display()))?;
        info!("results written to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_serialize_with_both_sides() {
        let mut writer = ResultsWriter::new(PathBuf::from("/dev/null"));
        let mut lstat = Stat::default();
        lstat.s.no_bytes = 123;
        let res = Res {
            msg_rate: 10.0,
            ..Res::default()
        };
        writer.add("tcp_bw", &res, &lstat, &Stat::default());

        let json = serde_json::to_value(&writer.records).unwrap();
        assert_eq!(json[0]["test"], "tcp_bw");
        assert_eq!(json[0]["msg_rate"], 10.0);
        assert_eq!(json[0]["local"]["send"]["no_bytes"], 123);
        assert_eq!(json[0]["remote"]["recv"]["no_msgs"], 0);
    }
}
