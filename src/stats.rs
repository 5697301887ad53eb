//! # Statistics Engine
//!
//! Converts the two sides' statistics snapshots into derived results: real
//! and CPU time from CLOCK tick deltas, CPU utilization fractions,
//! bandwidth, message rate, latency, and per-byte CPU cost. Counters are
//! first cross-added so each snapshot carries the combined view, then the
//! derivations read whichever side actually observed the traffic.

use serde::Serialize;

use crate::params::{ParamKind, Params, ReqPair};
use crate::show::{Gate, ShowTable};
use crate::timing::Tick;
use crate::wire::Stat;

/// Per-side derived results.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Resn {
    /// Wall time of the measurement, seconds
    pub time_real: f64,
    /// CPU time across all non-idle columns, seconds
    pub time_cpu: f64,
    pub cpu_user: f64,
    pub cpu_intr: f64,
    pub cpu_idle: f64,
    pub cpu_kernel: f64,
    pub cpu_io_wait: f64,
    pub cpu_total: f64,
}

/// Combined results for one test.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Res {
    pub l: Resn,
    pub r: Resn,
    /// One-way latency, seconds
    pub latency: f64,
    /// Delivered messages per second
    pub msg_rate: f64,
    pub send_bw: f64,
    pub recv_bw: f64,
    /// CPU seconds per gigabyte sent
    pub send_cost: f64,
    /// CPU seconds per gigabyte received
    pub recv_cost: f64,
}

/// Fold each side's record of the peer's traffic into the peer's own
/// counters so both snapshots end up with the combined totals.
pub fn cross_add(lstat: &mut Stat, rstat: &mut Stat) {
    lstat.s += rstat.rem_s;
    lstat.r += rstat.rem_r;
    rstat.s += lstat.rem_s;
    rstat.r += lstat.rem_r;
}

/// Derive per-side times and utilization from the CLOCK snapshots.
fn resn(stat: &Stat) -> Resn {
    let delta = |t: Tick| -> f64 {
        stat.time_e[t as usize].saturating_sub(stat.time_s[t as usize]) as f64
    };
    let real = delta(Tick::Real);
    if real == 0.0 || stat.no_ticks == 0 {
        return Resn::default();
    }
    let tps = stat.no_ticks as f64;

    let user = delta(Tick::User);
    let nice = delta(Tick::Nice);
    let kernel = delta(Tick::Kernel);
    let idle = delta(Tick::Idle);
    let io_wait = delta(Tick::IoWait);
    let irq = delta(Tick::Irq);
    let softirq = delta(Tick::SoftIrq);
    let steal = delta(Tick::Steal);

    let cpu_user = (user + nice) / real;
    let cpu_intr = (irq + softirq) / real;
    let cpu_kernel = (kernel + steal) / real;
    let cpu_io_wait = io_wait / real;

    Resn {
        time_real: real / tps,
        time_cpu: (user + nice + kernel + io_wait + irq + softirq + steal) / tps,
        cpu_user,
        cpu_intr,
        cpu_idle: idle / real,
        cpu_kernel,
        cpu_io_wait,
        cpu_total: cpu_user + cpu_intr + cpu_kernel + cpu_io_wait,
    }
}

/// Combine one counter across the two sides. When only one side observed
/// anything, its own time is the divisor; otherwise both counts are spread
/// over the midpoint of the two times.
fn combined_rate(loc_count: u64, loc_time: f64, rem_count: u64, rem_time: f64) -> f64 {
    if loc_count == 0 {
        if rem_time > 0.0 {
            rem_count as f64 / rem_time
        } else {
            0.0
        }
    } else if rem_count == 0 {
        if loc_time > 0.0 {
            loc_count as f64 / loc_time
        } else {
            0.0
        }
    } else {
        let mid = (loc_time + rem_time) / 2.0;
        if mid > 0.0 {
            (loc_count + rem_count) as f64 / mid
        } else {
            0.0
        }
    }
}

/// Derive the full result record from two cross-added snapshots.
pub fn derive(lstat: &Stat, rstat: &Stat) -> Res {
    let l = resn(lstat);
    let r = resn(rstat);
    let mut res = Res {
        l,
        r,
        ..Res::default()
    };

    let total_recv_msgs = lstat.r.no_msgs + rstat.r.no_msgs;
    if total_recv_msgs > 0 && l.time_real > 0.0 {
        res.latency = l.time_real / total_recv_msgs as f64;
    }

    res.msg_rate = combined_rate(lstat.r.no_msgs, l.time_real, rstat.r.no_msgs, r.time_real);
    res.send_bw = combined_rate(lstat.s.no_bytes, l.time_real, rstat.s.no_bytes, r.time_real);
    res.recv_bw = combined_rate(lstat.r.no_bytes, l.time_real, rstat.r.no_bytes, r.time_real);

    // Per-byte CPU cost is only meaningful for one-directional traffic.
    if lstat.s.no_bytes > 0 && rstat.s.no_bytes == 0 && lstat.r.no_bytes == 0 {
        res.send_cost = l.time_cpu * 1e9 / lstat.s.no_bytes as f64;
        if rstat.r.no_bytes > 0 {
            res.recv_cost = r.time_cpu * 1e9 / rstat.r.no_bytes as f64;
        }
    } else if rstat.s.no_bytes > 0 && lstat.s.no_bytes == 0 && rstat.r.no_bytes == 0 {
        res.send_cost = r.time_cpu * 1e9 / rstat.s.no_bytes as f64;
        if lstat.r.no_bytes > 0 {
            res.recv_cost = l.time_cpu * 1e9 / lstat.r.no_bytes as f64;
        }
    }

    res
}

/// Queue the result display for one test.
pub fn show_results(
    show: &mut ShowTable,
    res: &Res,
    lstat: &Stat,
    rstat: &Stat,
    params: &Params,
    reqs: &ReqPair,
) {
    // Headline metrics.
    let both_bw = res.send_bw > 0.0 && res.recv_bw > 0.0;
    if both_bw && !show.opts().unify_nodes {
        show.view_band(Gate::Always, "", "send_bw", res.send_bw);
        show.view_band(Gate::Always, "", "recv_bw", res.recv_bw);
    } else if res.send_bw > 0.0 || res.recv_bw > 0.0 {
        show.view_band(Gate::Always, "", "bw", res.recv_bw.max(res.send_bw));
    }
    if res.latency > 0.0 {
        show.view_time(Gate::Always, "", "latency", res.latency);
    }
    if res.msg_rate > 0.0 {
        show.view_rate(Gate::Always, "", "msg_rate", res.msg_rate);
    }
    if res.send_cost > 0.0 {
        show.view_cost(Gate::Stat, "", "send_cost", res.send_cost);
    }
    if res.recv_cost > 0.0 {
        show.view_cost(Gate::Stat, "", "recv_cost", res.recv_cost);
    }

    // Configuration the test ran with.
    for (prefix, req) in [("loc_", &reqs.loc), ("rem_", &reqs.rem)] {
        show.view_size(Gate::Conf, prefix, "msg_size", req.msg_size as u64);
        show.view_time(Gate::Conf, prefix, "time", req.time as f64);
        show.view_time(Gate::Conf, prefix, "timeout", req.timeout as f64);
        if req.no_msgs != 0 {
            show.view_long(Gate::Conf, prefix, "no_msgs", req.no_msgs as u64);
        }
        if req.sock_buf_size != 0 {
            show.view_size(Gate::Conf, prefix, "sock_buf_size", req.sock_buf_size as u64);
        }
        if req.affinity != 0 {
            show.view_long(Gate::Conf, prefix, "affinity", req.affinity as u64);
        }
        if req.port != 0 {
            show.view_long(Gate::ConfPlus, prefix, "port", req.port as u64);
        }
    }

    // CPU accounting and raw counters.
    for (prefix, n, stat) in [("loc_", &res.l, lstat), ("rem_", &res.r, rstat)] {
        show.view_cpus(Gate::Stat, prefix, "cpus_used", n.cpu_total);
        show.view_cpus(Gate::StatPlus, prefix, "cpus_user", n.cpu_user);
        show.view_cpus(Gate::StatPlus, prefix, "cpus_intr", n.cpu_intr);
        show.view_cpus(Gate::StatPlus, prefix, "cpus_kernel", n.cpu_kernel);
        show.view_cpus(Gate::StatPlus, prefix, "cpus_iowait", n.cpu_io_wait);
        show.view_cpus(Gate::StatPlus, prefix, "cpus_idle", n.cpu_idle);
        show.view_size(Gate::Stat, prefix, "send_bytes", stat.s.no_bytes);
        show.view_long(Gate::Stat, prefix, "send_msgs", stat.s.no_msgs);
        show.view_size(Gate::Stat, prefix, "recv_bytes", stat.r.no_bytes);
        show.view_long(Gate::Stat, prefix, "recv_msgs", stat.r.no_msgs);
        if stat.s.no_errs != 0 {
            show.view_long(Gate::Stat, prefix, "send_errs", stat.s.no_errs);
        }
        if stat.r.no_errs != 0 {
            show.view_long(Gate::Stat, prefix, "recv_errs", stat.r.no_errs);
        }
        show.view_time(Gate::Time, prefix, "time_real", n.time_real);
        show.view_time(Gate::Time, prefix, "time_cpu", n.time_cpu);
        show.view_long(Gate::Debug, prefix, "cpus", stat.no_cpus as u64);
        show.view_long(Gate::Debug, prefix, "ticks_per_sec", stat.no_ticks as u64);
    }

    // Parameters the test consumed.
    for (name, kind, value, req) in params.inuse_entries(reqs) {
        match kind {
            ParamKind::Size => show.view_size(Gate::Used, "", name, value),
            ParamKind::Time => show.view_time(Gate::Used, "", name, value as f64),
            ParamKind::Long => show.view_long(Gate::Used, "", name, value),
            ParamKind::Str => show.view_strn(Gate::Used, "", name, req.id_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::show::ShowOpts;
    use crate::wire::Ustat;

    fn close(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-9, "{} != {}", a, b);
    }

    fn stat_with(deltas: [u64; 9]) -> Stat {
        let mut stat = Stat {
            no_cpus: 4,
            no_ticks: 100,
            ..Stat::default()
        };
        for i in 0..9 {
            stat.time_s[i] = 10_000;
            stat.time_e[i] = 10_000 + deltas[i];
        }
        stat
    }

    #[test]
    fn cross_add_combines_peer_counters() {
        let mut lstat = Stat::default();
        let mut rstat = Stat::default();
        lstat.s = Ustat {
            no_bytes: 1000,
            no_msgs: 10,
            no_errs: 0,
        };
        rstat.rem_s = Ustat {
            no_bytes: 1000,
            no_msgs: 10,
            no_errs: 0,
        };

        cross_add(&mut lstat, &mut rstat);
        assert_eq!(lstat.s.no_bytes, 2000);
        assert_eq!(lstat.s.no_msgs, 20);
    }

    #[test]
    fn resn_derives_times_and_fractions() {
        // real user nice kernel idle iowait irq softirq steal
        let stat = stat_with([200, 50, 10, 20, 100, 4, 2, 2, 0]);
        let n = resn(&stat);

        close(n.time_real, 2.0);
        close(n.time_cpu, 0.88);
        close(n.cpu_user, 0.3);
        close(n.cpu_intr, 0.02);
        close(n.cpu_kernel, 0.1);
        close(n.cpu_io_wait, 0.02);
        close(n.cpu_idle, 0.5);
        close(n.cpu_total, 0.44);
    }

    #[test]
    fn resn_is_zero_without_ticks() {
        let mut stat = stat_with([200, 50, 10, 20, 100, 4, 2, 2, 0]);
        stat.no_ticks = 0;
        assert_eq!(resn(&stat).time_real, 0.0);

        let frozen = stat_with([0, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(resn(&frozen).time_real, 0.0);
    }

    #[test]
    fn one_sided_counters_use_that_sides_time() {
        // Local side sent nothing; the remote observed 1000 messages in 2 s.
        let mut lstat = stat_with([200, 0, 0, 0, 200, 0, 0, 0, 0]);
        let mut rstat = stat_with([200, 0, 0, 0, 200, 0, 0, 0, 0]);
        rstat.r = Ustat {
            no_bytes: 64_000,
            no_msgs: 1000,
            no_errs: 0,
        };
        lstat.s = Ustat {
            no_bytes: 64_000,
            no_msgs: 1000,
            no_errs: 0,
        };

        let res = derive(&lstat, &rstat);
        close(res.msg_rate, 500.0);
        close(res.send_bw, 32_000.0);
        close(res.recv_bw, 32_000.0);
    }

    #[test]
    fn bidirectional_counters_use_the_midpoint() {
        let mut lstat = stat_with([100, 0, 0, 0, 100, 0, 0, 0, 0]);
        let mut rstat = stat_with([300, 0, 0, 0, 300, 0, 0, 0, 0]);
        lstat.r.no_msgs = 500;
        rstat.r.no_msgs = 500;

        // midT = (1 + 3) / 2 = 2 s.
        let res = derive(&lstat, &rstat);
        close(res.msg_rate, 500.0);
    }

    #[test]
    fn latency_divides_real_time_by_total_receives() {
        let mut lstat = stat_with([200, 0, 0, 0, 200, 0, 0, 0, 0]);
        let mut rstat = stat_with([200, 0, 0, 0, 200, 0, 0, 0, 0]);
        lstat.r.no_msgs = 1000;
        rstat.r.no_msgs = 1000;

        let res = derive(&lstat, &rstat);
        close(res.latency, 0.001);
    }

    #[test]
    fn costs_only_for_one_directional_traffic() {
        let mut lstat = stat_with([200, 100, 0, 0, 100, 0, 0, 0, 0]);
        let mut rstat = stat_with([200, 50, 0, 0, 150, 0, 0, 0, 0]);
        lstat.s.no_bytes = 1_000_000_000;
        rstat.r.no_bytes = 1_000_000_000;

        let res = derive(&lstat, &rstat);
        close(res.send_cost, 1.0);
        close(res.recv_cost, 0.5);

        // Echo traffic has no unambiguous direction.
        lstat.r.no_bytes = 500;
        let echoed = derive(&lstat, &rstat);
        assert_eq!(echoed.send_cost, 0.0);
        assert_eq!(echoed.recv_cost, 0.0);
    }

    #[test]
    fn show_results_emits_headline_entries() {
        let mut lstat = stat_with([200, 0, 0, 0, 200, 0, 0, 0, 0]);
        let rstat = stat_with([200, 0, 0, 0, 200, 0, 0, 0, 0]);
        lstat.s.no_bytes = 2_000_000;
        lstat.s.no_msgs = 1000;

        let res = derive(&lstat, &rstat);
        let mut show = ShowTable::new(ShowOpts::default());
        let params = Params::new();
        let reqs = ReqPair::default();
        show_results(&mut show, &res, &lstat, &rstat, &params, &reqs);

        let out = show.render();
        assert!(out.contains("bw"));
        assert!(out.contains("MB/sec"));
    }
}
