//! Payload length sweep.
//!
//! Times payloads made of 1 up to N fill bytes, each wrapped in a fixed
//! prefix and suffix, and reports the mean interval per length. A server
//! whose response time depends on the request length shows up as a step in
//! the means.

use std::fmt::Write as _;

use crate::{
    endpoint::Endpoint,
    exchange::Exchange,
    stats::{fmt_opt, fmt_opt_f64, ElapsedCollector, OutputFormat},
};

/// Payloads of a length sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepPlan {
    prefix: Vec<u8>,
    suffix: Vec<u8>,
    fill: u8,
    max_length: usize,
}

impl SweepPlan {
    pub fn new(prefix: &[u8], suffix: &[u8], fill: u8, max_length: usize) -> Self {
        SweepPlan {
            prefix: prefix.to_vec(),
            suffix: suffix.to_vec(),
            fill,
            max_length,
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Request payload for a body of `length` fill bytes.
    pub fn payload(&self, length: usize) -> Vec<u8> {
        let mut payload = Vec::with_capacity(self.prefix.len() + length + self.suffix.len());
        payload.extend_from_slice(&self.prefix);
        payload.resize(self.prefix.len() + length, self.fill);
        payload.extend_from_slice(&self.suffix);
        payload
    }
}

/// Timing of all exchanges made with one body length.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct CandidateTiming {
    pub length: usize,
    pub succeeded: u32,
    pub failed: u32,
    pub mean_ns: Option<f64>,
    pub min_ns: Option<u64>,
    pub max_ns: Option<u64>,
}

impl CandidateTiming {
    fn from_collector(length: usize, collector: &ElapsedCollector) -> Self {
        let snapshot = collector.snapshot();
        CandidateTiming {
            length,
            succeeded: snapshot.succeeded,
            failed: snapshot.failed,
            mean_ns: snapshot.mean_ns,
            min_ns: snapshot.min_ns,
            max_ns: snapshot.max_ns,
        }
    }
}

/// Per-length results of a sweep, in increasing length order.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct SweepReport {
    pub candidates: Vec<CandidateTiming>,
}

/// Runs `batch` independent exchanges for every length of `plan`.
///
/// Failed exchanges are logged and counted; they never stop the sweep.
pub fn run_sweep(
    exchange: &mut Exchange,
    endpoint: &Endpoint,
    plan: &SweepPlan,
    batch: u32,
) -> SweepReport {
    let mut candidates = Vec::with_capacity(plan.max_length);

    for length in 1..=plan.max_length {
        let payload = plan.payload(length);
        let mut collector = ElapsedCollector::new();
        for _ in 0..batch {
            match exchange.run(endpoint, &payload) {
                Ok(result) => {
                    collector.record(u64::try_from(result.elapsed_nanos()).unwrap_or(u64::MAX))
                }
                Err(e) => {
                    log::warn!("length {}: exchange failed: {}", length, e);
                    collector.record_failure();
                }
            }
        }

        let timing = CandidateTiming::from_collector(length, &collector);
        log::debug!("length {}: mean {:?} ns", length, timing.mean_ns);
        candidates.push(timing);
    }

    SweepReport { candidates }
}

impl SweepReport {
    /// Candidate with the highest mean interval.
    pub fn slowest(&self) -> Option<&CandidateTiming> {
        self.candidates
            .iter()
            .filter_map(|c| c.mean_ns.map(|mean| (c, mean)))
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
            .map(|(c, _)| c)
    }

    /// Number of successful exchanges over all lengths.
    pub fn succeeded(&self) -> u32 {
        self.candidates.iter().map(|c| c.succeeded).sum()
    }

    /// Number of exchanges attempted over all lengths.
    pub fn exchanges(&self) -> u32 {
        self.candidates.iter().map(|c| c.succeeded + c.failed).sum()
    }

    /// Renders the sweep in the given format.
    pub fn render(&self, format: OutputFormat) -> String {
        match format {
            OutputFormat::Text => self.render_text(),
            OutputFormat::Json => self.render_json(),
            OutputFormat::Csv => self.render_csv(),
        }
    }

    fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "\n--- Payload Length Sweep ---");
        for c in &self.candidates {
            match (c.mean_ns, c.min_ns, c.max_ns) {
                (Some(mean), Some(min), Some(max)) => {
                    let _ = writeln!(
                        out,
                        "Length {}: mean {:.0} ns (min {} ns, max {} ns, {} failed)",
                        c.length, mean, min, max, c.failed
                    );
                }
                _ => {
                    let _ = writeln!(out, "Length {}: all {} exchanges failed", c.length, c.failed);
                }
            }
        }
        if let Some(slowest) = self.slowest() {
            let _ = writeln!(
                out,
                "Slowest length: {} ({:.0} ns)",
                slowest.length,
                slowest.mean_ns.unwrap_or_default()
            );
        }
        out
    }

    fn render_json(&self) -> String {
        #[derive(serde::Serialize)]
        struct JsonOutput<'a> {
            #[serde(rename = "type")]
            report_type: &'a str,
            slowest_length: Option<usize>,
            #[serde(flatten)]
            report: &'a SweepReport,
        }
        let output = JsonOutput {
            report_type: "sweep",
            slowest_length: self.slowest().map(|c| c.length),
            report: self,
        };
        match serde_json::to_string(&output) {
            Ok(json) => format!("{}\n", json),
            Err(e) => {
                log::warn!("Cannot serialize sweep results: {}", e);
                String::new()
            }
        }
    }

    fn render_csv(&self) -> String {
        let mut out = String::from("length,succeeded,failed,mean_ns,min_ns,max_ns\n");
        for c in &self.candidates {
            let _ = writeln!(
                out,
                "{},{},{},{},{},{}",
                c.length,
                c.succeeded,
                c.failed,
                fmt_opt_f64(c.mean_ns),
                fmt_opt(c.min_ns),
                fmt_opt(c.max_ns),
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timing(length: usize, mean_ns: Option<f64>) -> CandidateTiming {
        CandidateTiming {
            length,
            succeeded: if mean_ns.is_some() { 2 } else { 0 },
            failed: if mean_ns.is_some() { 0 } else { 2 },
            mean_ns,
            min_ns: mean_ns.map(|m| m as u64 - 10),
            max_ns: mean_ns.map(|m| m as u64 + 10),
        }
    }

    fn report() -> SweepReport {
        SweepReport {
            candidates: vec![
                timing(1, Some(1_000.0)),
                timing(2, Some(3_000.0)),
                timing(3, None),
            ],
        }
    }

    #[test]
    fn test_payloads() {
        let plan = SweepPlan::new(b"flag{", b"}", b'A', 3);
        assert_eq!(plan.payload(1), b"flag{A}");
        assert_eq!(plan.payload(3), b"flag{AAA}");

        let bare = SweepPlan::new(b"", b"", b'.', 2);
        assert_eq!(bare.payload(2), b"..");
    }

    #[test]
    fn test_slowest_ignores_failed_lengths() {
        let report = report();
        assert_eq!(report.slowest().map(|c| c.length), Some(2));
        assert_eq!(report.succeeded(), 4);
        assert_eq!(report.exchanges(), 6);

        let empty = SweepReport {
            candidates: vec![timing(1, None)],
        };
        assert!(empty.slowest().is_none());
    }

    #[test]
    fn test_text_render() {
        let text = report().render(OutputFormat::Text);
        assert!(text.contains("Length 2: mean 3000 ns (min 2990 ns, max 3010 ns, 0 failed)"));
        assert!(text.contains("Length 3: all 2 exchanges failed"));
        assert!(text.contains("Slowest length: 2 (3000 ns)"));
    }

    #[test]
    fn test_json_render() {
        let json = report().render(OutputFormat::Json);
        let value: serde_json::Value = serde_json::from_str(json.trim()).unwrap();
        assert_eq!(value["type"], "sweep");
        assert_eq!(value["slowest_length"], 2);
        assert_eq!(value["candidates"].as_array().unwrap().len(), 3);
        assert!(value["candidates"][2]["mean_ns"].is_null());
    }

    #[test]
    fn test_csv_render() {
        let csv = report().render(OutputFormat::Csv);
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "length,succeeded,failed,mean_ns,min_ns,max_ns");
        assert_eq!(lines[1], "1,2,0,1000.0,990,1010");
        assert_eq!(lines[3], "3,0,2,,,");
    }
}
