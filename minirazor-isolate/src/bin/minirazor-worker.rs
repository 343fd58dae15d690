use std::io;

use anyhow::{Context, Error};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Error> {
    // stdout is the protocol channel
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::try_from_env("MINIRAZOR_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let stdin = io::stdin();
    let stdout = io::stdout();
    minirazor_isolate::serve(stdin.lock(), stdout.lock())
        .context("worker lost the connection to its host")?;
    Ok(())
}
