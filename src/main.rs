//! Tidescan: stateless single-probe TCP SYN scanner.
//!
//! Usage:
//!   tidescan -p <PORT> <RANGE>... [--rate <PPS>] [--bandwidth <BPS>]
//!            [-b <BLACKLIST>] [-w <WHITELIST>] [-o <FILE>] [--summary json|pretty]

use clap::Parser;
use tidescan::cli::{self, Cli, SummaryFmt};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialise logging (RUST_LOG=debug etc.)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Cli::parse();

    match cli::run_scan(&args).await {
        Ok(summary) => {
            let text = match args.summary {
                SummaryFmt::Pretty => cli::format_pretty(&summary),
                SummaryFmt::Json => format!("{}\n", cli::format_json(&summary)),
            };
            // Stdout carries result records unless they go to a file.
            if args.output_file.is_some() {
                print!("{text}");
            } else {
                eprint!("{text}");
            }
        }
        Err(e) => {
            eprintln!("Scan failed: {e}");
            std::process::exit(1);
        }
    }
}
