use std::process::ExitCode;

use stp::sender::{run, SenderConfig};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = match SenderConfig::from_args(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("sender: {err}");
            return ExitCode::from(2);
        }
    };

    match run(config) {
        Ok(stats) => {
            tracing::info!(
                bytes = stats.data_bytes,
                segments = stats.data_segments,
                retransmissions = stats.retransmissions,
                dup_acks = stats.dup_acks,
                "transfer complete"
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("sender: {err}");
            ExitCode::FAILURE
        }
    }
}
