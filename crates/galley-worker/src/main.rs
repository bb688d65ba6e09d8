//! Galley worker - entrypoint process for galley pools.
//!
//! Launched by a pool with its end of the worker socket as stdin. Announces
//! its pid, then answers jobs with the handler chosen on the command line
//! until the pool closes the connection or signals the process.

mod handlers;

use clap::{Parser, ValueEnum};
use galley::{BincodeCodec, JsonCodec};
use serde_json::Value;

use handlers::Handler;

#[derive(Parser)]
#[command(name = "galley-worker")]
#[command(about = "Worker process for galley pools")]
#[command(version)]
struct Cli {
    /// Handler to run for every job
    #[arg(long, value_enum, default_value_t = Handler::Identity)]
    handler: Handler,

    /// Payload codec; must match the pool's
    #[arg(long, value_enum, default_value_t = CodecKind::Json)]
    codec: CodecKind,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CodecKind {
    /// serde_json; payloads are arbitrary JSON values
    Json,
    /// bincode; payloads are strings
    Bincode,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    // stdout belongs to handlers; logs go to stderr, which the pool inherits.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let handler = cli.handler;
    let served = match cli.codec {
        CodecKind::Json => galley::serve_stdin(JsonCodec, |job: Value| handler.apply(job))?,
        CodecKind::Bincode => {
            galley::serve_stdin(BincodeCodec, |job: String| handler.apply_text(job))?
        }
    };

    tracing::debug!("Served {} jobs with {:?} handler", served, handler);
    Ok(())
}
