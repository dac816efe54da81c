#[macro_use]
extern crate log;

use std::{
    io::{self, Write},
    process::ExitCode,
};

use tcp_rtt_probe::{
    configuration::{Configuration, Parser},
    exchange::Exchange,
    report,
    stats::ElapsedCollector,
    sweep, ProbeError,
};
use thiserror::Error;

#[derive(Error, Debug)]
enum ClientError {
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("All {0} exchanges failed")]
    AllFailed(u32),
}

fn main() -> ExitCode {
    env_logger::init();

    let conf = Configuration::parse();
    if let Err(e) = conf.validate() {
        eprintln!("Error: {}", e);
        return ExitCode::FAILURE;
    }

    info!("Configuration valid. Starting up...");

    match run(&conf) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(conf: &Configuration) -> Result<(), ClientError> {
    let endpoint = conf.endpoint().map_err(ProbeError::from)?;
    let mut exchange = Exchange::new(conf.exchange_config());

    let stdout = io::stdout();
    let mut out = stdout.lock();

    if let Some(plan) = conf.sweep_plan() {
        info!(
            "Sweeping payload lengths 1..={} against {} ({} exchanges each)",
            plan.max_length(),
            endpoint,
            conf.count
        );
        let report = sweep::run_sweep(&mut exchange, &endpoint, &plan, conf.count);
        write!(out, "{}", report.render(conf.output_format))?;
        out.flush()?;

        if report.succeeded() == 0 {
            return Err(ClientError::AllFailed(report.exchanges()));
        }
        return Ok(());
    }

    let payload = conf.read_payload(io::stdin().lock())?;

    if conf.count == 1 {
        let result = exchange.run(&endpoint, &payload)?;
        report::write_result(&mut out, &result, conf.output_format)?;
        out.flush()?;
        return Ok(());
    }

    info!(
        "Running {} exchanges against {} ({:?})",
        conf.count, endpoint, conf.strategy
    );
    let mut collector = ElapsedCollector::new();
    for i in 1..=conf.count {
        match exchange.run(&endpoint, &payload) {
            Ok(result) => {
                debug!("exchange {}: {} ns", i, result.elapsed_nanos());
                collector.record(u64::try_from(result.elapsed_nanos()).unwrap_or(u64::MAX));
            }
            Err(e) => {
                warn!("exchange {} failed: {}", i, e);
                collector.record_failure();
            }
        }
    }

    write!(out, "{}", collector.snapshot().render(conf.output_format))?;
    out.flush()?;

    if collector.successes() == 0 {
        return Err(ClientError::AllFailed(conf.count));
    }
    Ok(())
}
