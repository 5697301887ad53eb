//! # Timing and CPU Sampling
//!
//! Measurement windows are bracketed by CLOCK snapshots: a nine-column tick
//! vector whose first column is real time (monotonic clock scaled to the
//! kernel tick rate) and whose remaining columns are the cumulative CPU
//! counters from the first line of `/proc/stat`. The start snapshot is taken
//! when the peers synchronize; the end snapshot is latched exactly once when
//! the test finishes, no matter how many completion signals race in.
//!
//! Test runtime is bounded by [`Timer`], a deadline task that trips the
//! [`FinishGate`]. Measurement loops observe the gate either by polling
//! [`FinishGate::finished`] or by awaiting [`FinishGate::wait_finished`],
//! which lets a blocked socket operation be abandoned promptly.

use anyhow::{anyhow, Context, Result};
use nix::time::{clock_gettime, ClockId};
use nix::unistd::{sysconf, SysconfVar};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::wire::Stat;

/// Number of columns in a CLOCK vector
pub const T_N: usize = 9;

/// Cumulative tick counters for one point in time
pub type ClockVec = [u64; T_N];

/// Column labels of a CLOCK vector, in wire order.
///
/// `Real` is derived from the monotonic clock; the rest mirror the first
/// eight counters of the `cpu` line in `/proc/stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Tick {
    Real = 0,
    User = 1,
    Nice = 2,
    Kernel = 3,
    Idle = 4,
    IoWait = 5,
    Irq = 6,
    SoftIrq = 7,
    Steal = 8,
}

/// Kernel tick frequency (USER_HZ), falling back to the customary 100
/// when sysconf cannot answer.
pub fn ticks_per_sec() -> u16 {
    match sysconf(SysconfVar::CLK_TCK) {
        Ok(Some(hz)) if hz > 0 => hz as u16,
        _ => 100,
    }
}

/// Monotonic real time expressed in ticks of `tps` per second.
fn real_ticks(tps: u64) -> Result<u64> {
    let ts = clock_gettime(ClockId::CLOCK_MONOTONIC).context("clock_gettime(CLOCK_MONOTONIC)")?;
    Ok(ts.tv_sec() as u64 * tps + ts.tv_nsec() as u64 * tps / 1_000_000_000)
}

/// Parse the aggregate `cpu ` line of `/proc/stat` into columns 1..T_N of a
/// CLOCK vector. Missing trailing columns are zero-filled; anything that is
/// not the aggregate line is an error.
fn parse_cpu_line(line: &str) -> Result<[u64; T_N - 1]> {
    let rest = line
        .strip_prefix("cpu ")
        .ok_or_else(|| anyhow!("/proc/stat does not start with a cpu line"))?;
    let mut cols = [0u64; T_N - 1];
    for (slot, field) in cols.iter_mut().zip(rest.split_whitespace()) {
        *slot = field
            .parse()
            .with_context(|| format!("bad /proc/stat column {:?}", field))?;
    }
    Ok(cols)
}

/// Sampler for CLOCK vectors.
///
/// `/proc/stat` is opened once and kept open; each sample seeks back to the
/// start and rereads, which is the cheap way to poll proc files.
pub struct CpuSampler {
    file: File,
    contents: String,
    tps: u64,
}

impl CpuSampler {
    pub fn open() -> Result<Self> {
        let file = File::open("/proc/stat").context("open /proc/stat")?;
        Ok(Self {
            file,
            contents: String::with_capacity(4096),
            tps: ticks_per_sec() as u64,
        })
    }

    /// Take one CLOCK sample.
    pub fn sample(&mut self) -> Result<ClockVec> {
        self.file.seek(SeekFrom::Start(0)).context("seek /proc/stat")?;
        self.contents.clear();
        self.file
            .read_to_string(&mut self.contents)
            .context("read /proc/stat")?;
        let first = self
            .contents
            .lines()
            .next()
            .ok_or_else(|| anyhow!("/proc/stat is empty"))?;
        let cpu = parse_cpu_line(first)?;

        let mut out = [0u64; T_N];
        out[Tick::Real as usize] = real_ticks(self.tps)?;
        out[1..].copy_from_slice(&cpu);
        Ok(out)
    }
}

/// Completion gate for one test.
///
/// The hit counter is monotonic; only the first hit latches the end-time
/// CLOCK snapshot. Later hits (a deadline firing after a message budget ran
/// out, or the reverse) are counted and otherwise ignored.
pub struct FinishGate {
    hits: AtomicU32,
    end_times: OnceLock<ClockVec>,
    sampler: Mutex<CpuSampler>,
    done: watch::Sender<bool>,
}

impl FinishGate {
    pub fn new() -> Result<Arc<Self>> {
        let (done, _) = watch::channel(false);
        Ok(Arc::new(Self {
            hits: AtomicU32::new(0),
            end_times: OnceLock::new(),
            sampler: Mutex::new(CpuSampler::open()?),
            done,
        }))
    }

    /// Mark the test finished. Idempotent beyond the first call; the first
    /// call snapshots the end CLOCK vector and wakes every waiter.
    pub fn set_finished(&self) {
        if self.hits.fetch_add(1, Ordering::SeqCst) == 0 {
            let end = self
                .sample()
                .unwrap_or_else(|_| [0u64; T_N]);
            let _ = self.end_times.set(end);
            self.done.send_replace(true);
        }
    }

    pub fn finished(&self) -> bool {
        self.hits.load(Ordering::SeqCst) > 0
    }

    pub fn hits(&self) -> u32 {
        self.hits.load(Ordering::SeqCst)
    }

    /// The latched end snapshot, if the gate has tripped.
    pub fn end_times(&self) -> Option<ClockVec> {
        self.end_times.get().copied()
    }

    /// Take a CLOCK sample with the gate's sampler.
    pub fn sample(&self) -> Result<ClockVec> {
        let mut sampler = self
            .sampler
            .lock()
            .map_err(|_| anyhow!("cpu sampler lock poisoned"))?;
        sampler.sample()
    }

    /// Resolve once the gate has tripped. Completes immediately if it
    /// already has.
    pub async fn wait_finished(&self) {
        let mut rx = self.done.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }
}

/// Deadline task bounding one measurement.
pub struct Timer {
    task: Option<JoinHandle<()>>,
}

impl Timer {
    /// Snapshot the start CLOCK vector into `stat` and, when `secs` is
    /// nonzero, arm a deadline that trips the gate.
    pub fn start(gate: &Arc<FinishGate>, stat: &mut Stat, secs: u32) -> Result<Timer> {
        stat.time_s = gate.sample()?;
        let task = if secs > 0 {
            let gate = Arc::clone(gate);
            debug!("measurement bounded to {} s", secs);
            Some(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(secs as u64)).await;
                gate.set_finished();
            }))
        } else {
            None
        };
        Ok(Timer { task })
    }

    /// Trip the gate (latching the end snapshot if nothing else has),
    /// disarm the deadline, and copy the end snapshot into `stat`.
    pub fn stop(mut self, gate: &FinishGate, stat: &mut Stat) {
        gate.set_finished();
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Some(end) = gate.end_times() {
            stat.time_e = end;
        }
    }
}
