//! Statistics over repeated exchanges and formatted output.
//!
//! Provides interval statistics (percentiles, jitter, standard deviation),
//! the echo reflector shutdown summary, and the output formats (text, JSON, CSV).

use std::fmt::Write as _;

/// Output format for results and statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for machine consumption.
    Json,
    /// CSV output for spreadsheet import.
    Csv,
}

/// Collects elapsed intervals and computes derived statistics.
pub struct ElapsedCollector {
    samples: Vec<u64>,
    failures: u32,
    min_ns: Option<u64>,
    max_ns: Option<u64>,
    sum_ns: u128,
    sum_sq_ns: u128,
    jitter_sum_ns: u128,
    jitter_count: u64,
    last_ns: Option<u64>,
}

impl ElapsedCollector {
    /// Creates a new empty collector.
    pub fn new() -> Self {
        ElapsedCollector {
            samples: Vec::new(),
            failures: 0,
            min_ns: None,
            max_ns: None,
            sum_ns: 0,
            sum_sq_ns: 0,
            jitter_sum_ns: 0,
            jitter_count: 0,
            last_ns: None,
        }
    }

    /// Records the interval of a successful exchange.
    pub fn record(&mut self, elapsed_ns: u64) {
        self.min_ns = Some(self.min_ns.map_or(elapsed_ns, |m| m.min(elapsed_ns)));
        self.max_ns = Some(self.max_ns.map_or(elapsed_ns, |m| m.max(elapsed_ns)));
        self.sum_ns += elapsed_ns as u128;
        self.sum_sq_ns += (elapsed_ns as u128) * (elapsed_ns as u128);

        // Mean absolute difference between consecutive samples
        if let Some(prev) = self.last_ns {
            self.jitter_sum_ns += elapsed_ns.abs_diff(prev) as u128;
            self.jitter_count += 1;
        }
        self.last_ns = Some(elapsed_ns);

        self.samples.push(elapsed_ns);
    }

    /// Counts a failed exchange. Failures never contribute a sample.
    pub fn record_failure(&mut self) {
        self.failures += 1;
    }

    pub fn successes(&self) -> u32 {
        self.samples.len() as u32
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Returns the p-th percentile in nanoseconds (0.0..=100.0).
    pub fn percentile_ns(&self, p: f64) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_unstable();
        let idx = ((p / 100.0) * (sorted.len() - 1) as f64).round() as usize;
        Some(sorted[idx.min(sorted.len() - 1)])
    }

    pub fn jitter_ns(&self) -> Option<u64> {
        if self.jitter_count == 0 {
            return None;
        }
        Some((self.jitter_sum_ns / self.jitter_count as u128) as u64)
    }

    /// Returns the population standard deviation in nanoseconds.
    pub fn std_dev_ns(&self) -> Option<f64> {
        let n = self.samples.len();
        if n < 2 {
            return None;
        }
        let mean = self.sum_ns as f64 / n as f64;
        let mean_sq = self.sum_sq_ns as f64 / n as f64;
        let variance = mean_sq - mean * mean;
        if variance < 0.0 {
            // Floating-point rounding
            return Some(0.0);
        }
        Some(variance.sqrt())
    }

    /// Builds a snapshot of the current statistics.
    pub fn snapshot(&self) -> StatsSnapshot {
        let succeeded = self.successes();
        StatsSnapshot {
            exchanges: succeeded + self.failures,
            succeeded,
            failed: self.failures,
            min_ns: self.min_ns,
            max_ns: self.max_ns,
            mean_ns: if succeeded > 0 {
                Some(self.sum_ns as f64 / succeeded as f64)
            } else {
                None
            },
            median_ns: self.percentile_ns(50.0),
            p95_ns: self.percentile_ns(95.0),
            p99_ns: self.percentile_ns(99.0),
            jitter_ns: self.jitter_ns(),
            std_dev_ns: self.std_dev_ns(),
        }
    }
}

impl Default for ElapsedCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable summary of repeated exchanges.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct StatsSnapshot {
    pub exchanges: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub min_ns: Option<u64>,
    pub max_ns: Option<u64>,
    pub mean_ns: Option<f64>,
    pub median_ns: Option<u64>,
    pub p95_ns: Option<u64>,
    pub p99_ns: Option<u64>,
    pub jitter_ns: Option<u64>,
    pub std_dev_ns: Option<f64>,
}

impl StatsSnapshot {
    /// Renders the summary in the given format.
    pub fn render(&self, format: OutputFormat) -> String {
        match format {
            OutputFormat::Text => self.render_text(),
            OutputFormat::Json => self.render_json(),
            OutputFormat::Csv => self.render_csv(),
        }
    }

    fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "\n--- Request-Response Statistics ---");
        let _ = writeln!(out, "Exchanges: {}", self.exchanges);
        let _ = writeln!(out, "Succeeded: {}", self.succeeded);
        let _ = writeln!(out, "Failed: {}", self.failed);
        let rows = [
            ("Min", self.min_ns.map(|v| v as f64)),
            ("Max", self.max_ns.map(|v| v as f64)),
            ("Mean", self.mean_ns),
            ("Median", self.median_ns.map(|v| v as f64)),
            ("P95", self.p95_ns.map(|v| v as f64)),
            ("P99", self.p99_ns.map(|v| v as f64)),
            ("Jitter", self.jitter_ns.map(|v| v as f64)),
            ("Std Dev", self.std_dev_ns),
        ];
        for (label, value) in rows {
            if let Some(v) = value {
                let _ = writeln!(out, "{}: {:.0} ns", label, v);
            }
        }
        out
    }

    fn render_json(&self) -> String {
        #[derive(serde::Serialize)]
        struct JsonOutput<'a> {
            #[serde(rename = "type")]
            report_type: &'a str,
            #[serde(flatten)]
            stats: &'a StatsSnapshot,
        }
        let output = JsonOutput {
            report_type: "summary",
            stats: self,
        };
        match serde_json::to_string(&output) {
            Ok(json) => format!("{}\n", json),
            Err(e) => {
                log::warn!("Cannot serialize statistics: {}", e);
                String::new()
            }
        }
    }

    fn render_csv(&self) -> String {
        format!(
            "exchanges,succeeded,failed,min_ns,max_ns,mean_ns,median_ns,p95_ns,p99_ns,jitter_ns,std_dev_ns\n\
             {},{},{},{},{},{},{},{},{},{},{}\n",
            self.exchanges,
            self.succeeded,
            self.failed,
            fmt_opt(self.min_ns),
            fmt_opt(self.max_ns),
            fmt_opt_f64(self.mean_ns),
            fmt_opt(self.median_ns),
            fmt_opt(self.p95_ns),
            fmt_opt(self.p99_ns),
            fmt_opt(self.jitter_ns),
            fmt_opt_f64(self.std_dev_ns),
        )
    }
}

pub(crate) fn fmt_opt(v: Option<u64>) -> String {
    v.map_or_else(String::new, |x| x.to_string())
}

pub(crate) fn fmt_opt_f64(v: Option<f64>) -> String {
    v.map_or_else(String::new, |x| format!("{:.1}", x))
}

/// Serializable echo reflector summary.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ReflectorStats {
    pub connections_accepted: u64,
    pub connections_failed: u64,
    pub bytes_echoed: u64,
    pub uptime_seconds: f64,
}

impl ReflectorStats {
    /// Prints the reflector summary in the given format.
    pub fn print(&self, format: OutputFormat) {
        match format {
            OutputFormat::Text => {
                println!("\n--- Echo Reflector Statistics ---");
                println!("Uptime: {:.1} seconds", self.uptime_seconds);
                println!("Connections accepted: {}", self.connections_accepted);
                println!("Connections failed: {}", self.connections_failed);
                println!("Bytes echoed: {}", self.bytes_echoed);
            }
            OutputFormat::Json => {
                if let Ok(json) = serde_json::to_string(self) {
                    println!("{}", json);
                }
            }
            OutputFormat::Csv => {
                println!("connections_accepted,connections_failed,bytes_echoed,uptime_seconds");
                println!(
                    "{},{},{},{:.1}",
                    self.connections_accepted,
                    self.connections_failed,
                    self.bytes_echoed,
                    self.uptime_seconds,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_snapshot() -> StatsSnapshot {
        StatsSnapshot {
            exchanges: 10,
            succeeded: 8,
            failed: 2,
            min_ns: Some(10_000),
            max_ns: Some(50_000),
            mean_ns: Some(30_000.0),
            median_ns: Some(30_000),
            p95_ns: Some(45_000),
            p99_ns: Some(49_000),
            jitter_ns: Some(5_000),
            std_dev_ns: Some(12_000.5),
        }
    }

    #[test]
    fn test_empty_collector() {
        let c = ElapsedCollector::new();
        assert!(c.percentile_ns(50.0).is_none());
        assert!(c.jitter_ns().is_none());
        assert!(c.std_dev_ns().is_none());

        let snap = c.snapshot();
        assert_eq!(snap.exchanges, 0);
        assert_eq!(snap.succeeded, 0);
        assert!(snap.min_ns.is_none());
        assert!(snap.mean_ns.is_none());
    }

    #[test]
    fn test_single_sample() {
        let mut c = ElapsedCollector::new();
        c.record(42_000);

        assert_eq!(c.min_ns, Some(42_000));
        assert_eq!(c.max_ns, Some(42_000));
        assert!(c.jitter_ns().is_none()); // need at least 2 samples
        assert!(c.std_dev_ns().is_none());
        assert_eq!(c.percentile_ns(50.0), Some(42_000));
    }

    #[test]
    fn test_multi_samples() {
        let mut c = ElapsedCollector::new();
        for i in 1..=5u64 {
            c.record(i * 1_000);
        }
        c.record_failure();

        assert_eq!(c.min_ns, Some(1_000));
        assert_eq!(c.max_ns, Some(5_000));
        // |2-1|, |3-2|, |4-3|, |5-4|
        assert_eq!(c.jitter_ns(), Some(1_000));
        assert_eq!(c.percentile_ns(50.0), Some(3_000));
        let sd = c.std_dev_ns().unwrap();
        assert!((sd - 1414.2).abs() < 0.1);

        let snap = c.snapshot();
        assert_eq!(snap.exchanges, 6);
        assert_eq!(snap.succeeded, 5);
        assert_eq!(snap.failed, 1);
        assert!((snap.mean_ns.unwrap() - 3_000.0).abs() < 0.001);
    }

    #[test]
    fn test_percentiles() {
        let mut c = ElapsedCollector::new();
        for i in (1..=100u64).rev() {
            c.record(i * 10);
        }
        assert_eq!(c.percentile_ns(0.0), Some(10));
        assert_eq!(c.percentile_ns(100.0), Some(1_000));
    }

    #[test]
    fn test_text_render() {
        let text = full_snapshot().render(OutputFormat::Text);
        assert!(text.contains("Exchanges: 10"));
        assert!(text.contains("Failed: 2"));
        assert!(text.contains("Min: 10000 ns"));
        assert!(text.contains("P99: 49000 ns"));
    }

    #[test]
    fn test_json_render() {
        let json = full_snapshot().render(OutputFormat::Json);
        let value: serde_json::Value = serde_json::from_str(json.trim()).unwrap();
        assert_eq!(value["type"], "summary");
        assert_eq!(value["succeeded"], 8);
        assert_eq!(value["median_ns"], 30_000);
    }

    #[test]
    fn test_json_render_none_fields() {
        let snap = ElapsedCollector::new().snapshot();
        let json = snap.render(OutputFormat::Json);
        let value: serde_json::Value = serde_json::from_str(json.trim()).unwrap();
        assert!(value["min_ns"].is_null());
    }

    #[test]
    fn test_csv_render() {
        let csv = full_snapshot().render(OutputFormat::Csv);
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("exchanges,succeeded,failed"));
        assert_eq!(
            lines[1],
            "10,8,2,10000,50000,30000.0,30000,45000,49000,5000,12000.5"
        );
    }

    #[test]
    fn test_reflector_stats_print() {
        let stats = ReflectorStats {
            connections_accepted: 3,
            connections_failed: 0,
            bytes_echoed: 15,
            uptime_seconds: 1.5,
        };
        // Should not panic
        stats.print(OutputFormat::Text);
        stats.print(OutputFormat::Json);
        stats.print(OutputFormat::Csv);
    }
}
