//! Hosts the analysis engine behind the request/response protocol.
//!
//! Reads one JSON request per line from stdin and writes responses and
//! events as NDJSON to stdout. Events raised while a request runs are
//! written before its response.
//!
//! # Usage
//!
//! ```bash
//! heapsnap_worker < requests.ndjson > responses.ndjson
//! ```

use clap::Parser;
use heapsnap::dispatcher::{Dispatcher, Request};
use std::io::{BufRead, BufWriter, Write};
use std::process::ExitCode;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "heapsnap_worker")]
#[command(about = "Serve heap snapshot analyses over stdin/stdout")]
#[command(version)]
struct Args {}

fn run(_args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut dispatcher = Dispatcher::new();
    let stdin = std::io::stdin().lock();
    let mut out = BufWriter::new(std::io::stdout().lock());

    for line in stdin.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let request: Request = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                // No call id to answer to.
                warn!("dropping malformed request: {}", e);
                continue;
            }
        };
        let response = dispatcher.dispatch(request);
        for event in dispatcher.take_events() {
            writeln!(out, "{}", serde_json::to_string(&event)?)?;
        }
        writeln!(out, "{}", serde_json::to_string(&response)?)?;
        out.flush()?;
    }

    info!("input closed, {} objects alive", dispatcher.object_count());
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
