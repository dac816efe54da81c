#[macro_use]
extern crate log;

use std::{net::IpAddr, process::ExitCode};

use clap::Parser;
use tcp_rtt_probe::{reflector, stats::OutputFormat};
use tokio::net::TcpListener;

/// TCP echo reflector for request/response timing
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Configuration {
    /// Local address to bind to
    #[arg(short, long, default_value = "0.0.0.0")]
    pub local_addr: IpAddr,
    /// TCP port to listen on
    #[arg(short = 'p', long, default_value_t = 12345)]
    pub local_port: u16,
    /// Stop after serving this many connections (0 = unlimited)
    #[arg(short, long, default_value_t = 0)]
    pub max_connections: u64,
    /// Format of the shutdown statistics
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    pub output_format: OutputFormat,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let conf = Configuration::parse();
    let listener = match TcpListener::bind((conf.local_addr, conf.local_port)).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!(
                "Cannot bind to address {}:{}: {}",
                conf.local_addr, conf.local_port, e
            );
            return ExitCode::FAILURE;
        }
    };

    match listener.local_addr() {
        Ok(addr) => println!("Echo reflector listening on {}", addr),
        Err(e) => warn!("Cannot read local address: {}", e),
    }

    let max_connections = (conf.max_connections > 0).then_some(conf.max_connections);
    let stats = reflector::serve(listener, max_connections, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    })
    .await;

    stats.print(conf.output_format);
    ExitCode::SUCCESS
}
