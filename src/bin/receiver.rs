use std::process::ExitCode;

use stp::receiver::{run, ReceiverConfig};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = match ReceiverConfig::from_args(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("receiver: {err}");
            return ExitCode::from(2);
        }
    };

    match run(config) {
        Ok(stats) => {
            tracing::info!(
                bytes = stats.data_bytes,
                segments = stats.data_segments,
                duplicates = stats.dup_data_segments,
                "transfer complete"
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("receiver: {err}");
            ExitCode::FAILURE
        }
    }
}
