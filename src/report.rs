//! Output of a single exchange result.
//!
//! Text output prints the echoed payload followed by the interval: kernel
//! timestamps as an integer nanosecond count, process clock readings as
//! fractional seconds.

use std::io::{self, Write};

use crate::{exchange::ExchangeResult, stats::OutputFormat, timestamp::TimestampKind};

/// Line printed after a successful kernel-timestamped exchange.
pub const SUCCESS_LINE: &str = "Raw TCP request fulfilled successfully.";

#[derive(serde::Serialize)]
struct JsonResult<'a> {
    #[serde(rename = "type")]
    report_type: &'a str,
    /// Response rendered as UTF-8; invalid sequences become U+FFFD.
    payload: String,
    /// Exact response length, unaffected by the lossy rendering.
    payload_bytes: usize,
    elapsed_ns: u128,
    source: TimestampKind,
}

/// Writes `result` to `out` in the given format.
pub fn write_result<W: Write>(
    out: &mut W,
    result: &ExchangeResult,
    format: OutputFormat,
) -> io::Result<()> {
    match format {
        OutputFormat::Text => write_text(out, result),
        OutputFormat::Json => {
            let json = JsonResult {
                report_type: "exchange",
                payload: String::from_utf8_lossy(result.payload_echoed()).into_owned(),
                payload_bytes: result.payload_echoed().len(),
                elapsed_ns: result.elapsed_nanos(),
                source: result.source(),
            };
            serde_json::to_writer(&mut *out, &json)?;
            writeln!(out)
        }
        OutputFormat::Csv => {
            writeln!(out, "payload_bytes,elapsed_ns,source")?;
            writeln!(
                out,
                "{},{},{}",
                result.payload_echoed().len(),
                result.elapsed_nanos(),
                result.source()
            )
        }
    }
}

fn write_text<W: Write>(out: &mut W, result: &ExchangeResult) -> io::Result<()> {
    let payload = result.payload_echoed();
    out.write_all(payload)?;
    if payload.last() != Some(&b'\n') {
        out.write_all(b"\n")?;
    }

    match result.source() {
        TimestampKind::ProcessClock => {
            writeln!(out, "{:.9}", result.elapsed().as_secs_f64())
        }
        TimestampKind::KernelSoftware | TimestampKind::KernelHardware => {
            writeln!(out, "Request-Response time: {} ns", result.elapsed_nanos())?;
            writeln!(out, "{}", SUCCESS_LINE)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(result: &ExchangeResult, format: OutputFormat) -> String {
        let mut out = Vec::new();
        write_result(&mut out, result, format).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_kernel_text_output() {
        let result = ExchangeResult::for_test(b"hello", 48_213, TimestampKind::KernelSoftware);
        assert_eq!(
            render(&result, OutputFormat::Text),
            "hello\nRequest-Response time: 48213 ns\nRaw TCP request fulfilled successfully.\n"
        );
    }

    #[test]
    fn test_clock_text_output() {
        let result = ExchangeResult::for_test(b"pong\n", 1_500_000, TimestampKind::ProcessClock);
        assert_eq!(render(&result, OutputFormat::Text), "pong\n0.001500000\n");
    }

    #[test]
    fn test_json_output() {
        let result = ExchangeResult::for_test(b"hi", 10, TimestampKind::KernelSoftware);
        let value: serde_json::Value =
            serde_json::from_str(render(&result, OutputFormat::Json).trim()).unwrap();
        assert_eq!(value["type"], "exchange");
        assert_eq!(value["payload"], "hi");
        assert_eq!(value["payload_bytes"], 2);
        assert_eq!(value["elapsed_ns"], 10);
        assert_eq!(value["source"], "kernel-software");
    }

    #[test]
    fn test_json_output_binary_payload_keeps_length() {
        let result = ExchangeResult::for_test(&[0x68, 0xff, 0xfe], 10, TimestampKind::ProcessClock);
        let value: serde_json::Value =
            serde_json::from_str(render(&result, OutputFormat::Json).trim()).unwrap();
        assert_eq!(value["payload"], "h\u{fffd}\u{fffd}");
        assert_eq!(value["payload_bytes"], 3);
    }

    #[test]
    fn test_csv_output() {
        let result = ExchangeResult::for_test(b"abc", 77, TimestampKind::ProcessClock);
        assert_eq!(
            render(&result, OutputFormat::Csv),
            "payload_bytes,elapsed_ns,source\n3,77,process-clock\n"
        );
    }
}
