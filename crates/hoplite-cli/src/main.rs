//! Command-line front end: trace a set of targets and print the result as
//! JSON.

use clap::Parser;
use hoplite::{Client, Options, Protocol, RetryConfig, Target};
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Userland TCP/UDP traceroute.
#[derive(Parser, Debug)]
#[command(name = "hoplite")]
#[command(version)]
#[command(about = "Userland TCP/UDP traceroute")]
struct Args {
    /// Target addresses (hostname or IPv4 literal).
    #[arg(required = true)]
    targets: Vec<String>,

    /// Probe protocol (tcp or udp).
    #[arg(short = 'P', long, default_value = "tcp")]
    protocol: String,

    /// Destination port.
    #[arg(short, long, default_value = "33434")]
    port: u16,

    /// Maximum TTL to probe.
    #[arg(short = 'm', long = "max-ttl", default_value = "30")]
    max_ttl: u8,

    /// Per-hop timeout in milliseconds.
    #[arg(long, default_value = "3000")]
    timeout: u64,

    /// Retries per hop after the initial attempt.
    #[arg(long, default_value = "3")]
    retries: u32,

    /// Base backoff delay in milliseconds.
    #[arg(long = "retry-delay", default_value = "1000")]
    retry_delay: u64,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if args.verbose {
        tracing_subscriber::fmt().with_env_filter("debug").init();
    } else {
        tracing_subscriber::fmt().with_env_filter("info").init();
    }

    let protocol: Protocol = match args.protocol.parse() {
        Ok(protocol) => protocol,
        Err(err) => {
            eprintln!("Error: {err}");
            return ExitCode::FAILURE;
        }
    };

    let targets: Vec<Target> = args
        .targets
        .iter()
        .map(|address| Target::new(protocol, address.as_str(), args.port))
        .collect();
    let opts = Options {
        max_ttl: args.max_ttl,
        timeout: Duration::from_millis(args.timeout),
        retry: RetryConfig {
            count: args.retries,
            delay: Duration::from_millis(args.retry_delay),
        },
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupted, unwinding in-flight probes");
                cancel.cancel();
            }
        });
    }

    let client = Client::new();
    match client.run(&cancel, &targets, Some(opts)).await {
        Ok(result) => match serde_json::to_string_pretty(&result) {
            Ok(json) => {
                println!("{json}");
                ExitCode::SUCCESS
            }
            Err(err) => {
                eprintln!("Failed to serialize results: {err}");
                ExitCode::FAILURE
            }
        },
        Err(err) => {
            eprintln!("Traceroute failed: {err}");
            ExitCode::FAILURE
        }
    }
}
