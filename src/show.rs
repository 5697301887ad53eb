//! # Result Renderer
//!
//! Results are not printed as they are produced. Each `view_*` call appends
//! an entry to a queue, gated by a verbosity class; after a test the queue
//! is laid out as an aligned two-column table and flushed to stdout in one
//! piece. Values pass through engineering unit ladders (and, for sizes, an
//! exact power-of-1024 rendering with the raw count as an alternate) unless
//! unified units were requested, in which case everything stays at the base
//! unit with no thousands separators so the output stays machine friendly.

/// Verbosity class of one queued entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// Shown unconditionally
    Always,
    /// Shown when debug output is enabled
    Debug,
    Conf,
    ConfPlus,
    Stat,
    StatPlus,
    Time,
    TimePlus,
    Used,
    UsedPlus,
}

/// Rendering options, assembled from the command line.
#[derive(Debug, Clone)]
pub struct ShowOpts {
    /// Significant digits in numeric renderings
    pub precision: usize,
    /// Disable unit ladders and thousands separators
    pub unify_units: bool,
    /// Collapse the loc/rem axes when traffic is one-directional
    pub unify_nodes: bool,
    pub debug: bool,
    pub verbose_conf: u8,
    pub verbose_stat: u8,
    pub verbose_time: u8,
    pub verbose_used: u8,
}

impl Default for ShowOpts {
    fn default() -> Self {
        ShowOpts {
            precision: crate::defaults::PRECISION,
            unify_units: false,
            unify_nodes: false,
            debug: false,
            verbose_conf: 0,
            verbose_stat: 0,
            verbose_time: 0,
            verbose_used: 0,
        }
    }
}

impl ShowOpts {
    fn enabled(&self, gate: Gate) -> bool {
        match gate {
            Gate::Always => true,
            Gate::Debug => self.debug,
            Gate::Conf => self.verbose_conf >= 1,
            Gate::ConfPlus => self.verbose_conf >= 2,
            Gate::Stat => self.verbose_stat >= 1,
            Gate::StatPlus => self.verbose_stat >= 2,
            Gate::Time => self.verbose_time >= 1,
            Gate::TimePlus => self.verbose_time >= 2,
            Gate::Used => self.verbose_used >= 1,
            Gate::UsedPlus => self.verbose_used >= 2,
        }
    }
}

#[derive(Debug, Clone)]
struct ShowEntry {
    prefix: String,
    name: String,
    data: String,
    unit: String,
    altn: Option<String>,
}

/// Queue of formatted output entries for one test.
#[derive(Debug, Clone, Default)]
pub struct ShowTable {
    opts: ShowOpts,
    entries: Vec<ShowEntry>,
}

const TIME_UNITS: [&str; 4] = ["ns", "µs", "ms", "sec"];
const BAND_UNITS: [&str; 5] = ["bytes/sec", "KB/sec", "MB/sec", "GB/sec", "TB/sec"];
const RATE_UNITS: [&str; 5] = ["/sec", "K/sec", "M/sec", "G/sec", "T/sec"];
const COST_UNITS: [&str; 4] = ["ns/GB", "µs/GB", "ms/GB", "sec/GB"];
const SIZE_UNITS: [&str; 5] = ["bytes", "KB", "MB", "GB", "TB"];
const SIZE_1024_UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];
const LONG_UNITS: [&str; 5] = ["", "thousand", "million", "billion", "trillion"];

impl ShowTable {
    pub fn new(opts: ShowOpts) -> Self {
        ShowTable {
            opts,
            entries: Vec::new(),
        }
    }

    pub fn opts(&self) -> &ShowOpts {
        &self.opts
    }

    fn push(&mut self, gate: Gate, prefix: &str, name: &str, data: String, unit: &str) {
        self.push_alt(gate, prefix, name, data, unit, None);
    }

    fn push_alt(
        &mut self,
        gate: Gate,
        prefix: &str,
        name: &str,
        data: String,
        unit: &str,
        altn: Option<String>,
    ) {
        if !self.opts.enabled(gate) {
            return;
        }
        self.entries.push(ShowEntry {
            prefix: prefix.to_string(),
            name: name.to_string(),
            data,
            unit: unit.to_string(),
            altn,
        });
    }

    /// Step a value down an engineering ladder until it fits below 1000.
    fn ladder<'u>(&self, mut value: f64, units: &[&'u str]) -> (f64, &'u str) {
        let mut idx = 0;
        if !self.opts.unify_units {
            while value >= 1000.0 && idx < units.len() - 1 {
                value /= 1000.0;
                idx += 1;
            }
        }
        (value, units[idx])
    }

    fn number(&self, value: f64) -> String {
        let s = significant(value, self.opts.precision);
        if self.opts.unify_units {
            s
        } else {
            commafy(&s)
        }
    }

    /// A duration in seconds, rendered from nanoseconds upward.
    pub fn view_time(&mut self, gate: Gate, prefix: &str, name: &str, secs: f64) {
        let (v, unit) = self.ladder(secs * 1e9, &TIME_UNITS);
        let data = self.number(v);
        self.push(gate, prefix, name, data, unit);
    }

    /// A byte rate in bytes per second.
    pub fn view_band(&mut self, gate: Gate, prefix: &str, name: &str, bytes_per_sec: f64) {
        let (v, unit) = self.ladder(bytes_per_sec, &BAND_UNITS);
        let data = self.number(v);
        self.push(gate, prefix, name, data, unit);
    }

    /// An event rate per second.
    pub fn view_rate(&mut self, gate: Gate, prefix: &str, name: &str, per_sec: f64) {
        let (v, unit) = self.ladder(per_sec, &RATE_UNITS);
        let data = self.number(v);
        self.push(gate, prefix, name, data, unit);
    }

    /// CPU seconds spent per gigabyte transferred.
    pub fn view_cost(&mut self, gate: Gate, prefix: &str, name: &str, secs_per_gb: f64) {
        let (v, unit) = self.ladder(secs_per_gb * 1e9, &COST_UNITS);
        let data = self.number(v);
        self.push(gate, prefix, name, data, unit);
    }

    /// A CPU utilization fraction, shown as a percentage of one CPU.
    pub fn view_cpus(&mut self, gate: Gate, prefix: &str, name: &str, fraction: f64) {
        let data = self.number(fraction * 100.0);
        self.push(gate, prefix, name, data, "% cpus");
    }

    /// A byte count. Exact multiples of 1024 render in binary units with
    /// the raw count as the alternate; everything else uses the decimal
    /// ladder.
    pub fn view_size(&mut self, gate: Gate, prefix: &str, name: &str, bytes: u64) {
        if !self.opts.unify_units && bytes >= 1024 {
            for i in (0..SIZE_1024_UNITS.len()).rev() {
                let mult = 1u64 << (10 * (i as u32 + 1));
                if bytes >= mult && bytes % mult == 0 {
                    let data = commafy(&(bytes / mult).to_string());
                    let altn = Some(commafy(&bytes.to_string()));
                    self.push_alt(gate, prefix, name, data, SIZE_1024_UNITS[i], altn);
                    return;
                }
            }
        }
        if self.opts.unify_units {
            self.push(gate, prefix, name, bytes.to_string(), SIZE_UNITS[0]);
        } else {
            let (v, unit) = self.ladder(bytes as f64, &SIZE_UNITS);
            let data = self.number(v);
            self.push(gate, prefix, name, data, unit);
        }
    }

    /// A plain count. Values below a million print in full; above, the
    /// word ladder takes over.
    pub fn view_long(&mut self, gate: Gate, prefix: &str, name: &str, value: u64) {
        if self.opts.unify_units || value < 1_000_000 {
            let data = if self.opts.unify_units {
                value.to_string()
            } else {
                commafy(&value.to_string())
            };
            self.push(gate, prefix, name, data, "");
        } else {
            let (v, unit) = self.ladder(value as f64, &LONG_UNITS);
            let data = self.number(v);
            self.push(gate, prefix, name, data, unit);
        }
    }

    /// A verbatim string with no unit.
    pub fn view_strn(&mut self, gate: Gate, prefix: &str, name: &str, value: &str) {
        self.push(gate, prefix, name, value.to_string(), "");
    }

    /// Lay the queue out as an aligned table.
    pub fn render(&self) -> String {
        let name_w = self
            .entries
            .iter()
            .map(|e| e.prefix.len() + e.name.len())
            .max()
            .unwrap_or(0);
        let data_w = self.entries.iter().map(|e| e.data.len()).max().unwrap_or(0);

        let mut out = String::new();
        for e in &self.entries {
            let label = format!("{}{}", e.prefix, e.name);
            out.push_str(&format!(
                "    {:<nw$}  =  {:>dw$}",
                label,
                e.data,
                nw = name_w,
                dw = data_w
            ));
            if !e.unit.is_empty() {
                out.push(' ');
                out.push_str(&e.unit);
            }
            if let Some(ref altn) = e.altn {
                out.push_str(&format!(" ({})", altn));
            }
            out.push('\n');
        }
        out
    }

    /// Print the queue and clear it for the next test.
    pub fn place_show(&mut self) {
        if !self.entries.is_empty() {
            print!("{}", self.render());
        }
        self.entries.clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Render `value` to `prec` significant digits, stripping trailing zeros
/// and a dangling decimal point.
fn significant(value: f64, prec: usize) -> String {
    if value == 0.0 {
        return "0".to_string();
    }
    let digits = value.abs().log10().floor() as i32 + 1;
    let decimals = (prec as i32 - digits).max(0) as usize;
    let mut s = format!("{:.*}", decimals, value);
    if s.contains('.') {
        s = s.trim_end_matches('0').trim_end_matches('.').to_string();
    }
    s
}

/// Insert comma separators into the integer portion of a numeric string.
fn commafy(s: &str) -> String {
    let (int_part, rest) = match s.find('.') {
        Some(i) => s.split_at(i),
        None => (s, ""),
    };
    let (sign, digits) = match int_part.strip_prefix('-') {
        Some(d) => ("-", d),
        None => ("", int_part),
    };
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    format!("{}{}{}", sign, grouped, rest)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> ShowTable {
        ShowTable::new(ShowOpts::default())
    }

    #[test]
    fn significant_digits_and_stripping() {
        assert_eq!(significant(1.0, 3), "1");
        assert_eq!(significant(1.5, 3), "1.5");
        assert_eq!(significant(123.456, 3), "123");
        assert_eq!(significant(0.0456, 3), "0.0456");
        assert_eq!(significant(0.0, 3), "0");
        assert_eq!(significant(2.5, 5), "2.5");
    }

    #[test]
    fn commafy_groups_integer_digits_only() {
        assert_eq!(commafy("1048576"), "1,048,576");
        assert_eq!(commafy("123"), "123");
        assert_eq!(commafy("1234.56"), "1,234.56");
        assert_eq!(commafy("-45678"), "-45,678");
    }

    #[test]
    fn size_renders_exact_1024_multiples_with_alternate() {
        let mut t = table();
        t.view_size(Gate::Always, "", "x", 1_048_576);
        assert_eq!(t.render(), "    x  =  1 MiB (1,048,576)\n");
    }

    #[test]
    fn size_unify_stays_in_bytes() {
        let mut t = ShowTable::new(ShowOpts {
            unify_units: true,
            ..ShowOpts::default()
        });
        t.view_size(Gate::Always, "", "x", 1_048_576);
        assert_eq!(t.render(), "    x  =  1048576 bytes\n");
    }

    #[test]
    fn size_unit_tracks_1024_power() {
        let mut t = table();
        t.view_size(Gate::Always, "", "a", 1024);
        t.view_size(Gate::Always, "", "b", 1 << 30);
        let out = t.render();
        assert!(out.contains("1 KiB (1,024)"));
        assert!(out.contains("1 GiB (1,073,741,824)"));
    }

    #[test]
    fn size_falls_back_to_decimal_ladder() {
        let mut t = table();
        t.view_size(Gate::Always, "", "x", 1536);
        assert_eq!(t.render(), "    x  =  1.54 KB\n");
    }

    #[test]
    fn time_steps_from_nanoseconds() {
        let mut t = table();
        t.view_time(Gate::Always, "", "latency", 0.000000123);
        assert_eq!(t.render(), "    latency  =  123 ns\n");
    }

    #[test]
    fn band_and_rate_ladders() {
        let mut t = table();
        t.view_band(Gate::Always, "", "bw", 1.25e9);
        t.view_rate(Gate::Always, "", "msg_rate", 85_300.0);
        let out = t.render();
        assert!(out.contains("1.25 GB/sec"));
        assert!(out.contains("85.3 K/sec"));
    }

    #[test]
    fn long_uses_words_only_above_a_million() {
        let mut t = table();
        t.view_long(Gate::Always, "", "small", 250_000);
        t.view_long(Gate::Always, "", "big", 2_500_000);
        let out = t.render();
        assert!(out.contains("250,000\n"));
        assert!(out.contains("2.5 million\n"));
    }

    #[test]
    fn verbosity_gates_entries() {
        let mut quiet = table();
        quiet.view_strn(Gate::Conf, "", "hidden", "x");
        quiet.view_strn(Gate::Always, "", "shown", "y");
        assert_eq!(quiet.len(), 1);

        let mut verbose = ShowTable::new(ShowOpts {
            verbose_conf: 1,
            ..ShowOpts::default()
        });
        verbose.view_strn(Gate::Conf, "", "conf", "x");
        verbose.view_strn(Gate::ConfPlus, "", "conf_plus", "x");
        assert_eq!(verbose.len(), 1);
    }

    #[test]
    fn table_is_aligned_and_indented() {
        let mut t = table();
        t.view_band(Gate::Always, "", "send_bw", 2.0e6);
        t.view_band(Gate::Always, "", "bw", 125.0);
        let out = t.render();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "    send_bw  =    2 MB/sec");
        assert_eq!(lines[1], "    bw       =  125 bytes/sec");
    }

    #[test]
    fn place_show_clears_the_queue() {
        let mut t = table();
        t.view_strn(Gate::Always, "", "x", "y");
        t.place_show();
        assert_eq!(t.len(), 0);
    }
}
