//! wal2kafka
//!
//! A lightweight CDC agent that tails a PostgreSQL logical replication
//! stream and publishes every committed row change as a JSON event onto
//! Kafka, with at-least-once delivery. One receive thread, one flush/commit
//! thread, fail-fast under a supervisor.

mod buffer;
mod config;
mod driver;
mod errors;
mod event;
mod kafka;
mod lsn;
mod pgoutput;
mod pipeline;
mod pq;
mod registry;
mod source;

use crate::config::Config;
use crate::errors::ReplicationResult;
use crate::pipeline::Processor;
use crate::source::StreamingSource;
use anyhow::Result;
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

/// Set by the signal handler; observed by the receive loop and the flush
/// worker. The only process-wide state besides the logger.
static STOP: AtomicBool = AtomicBool::new(false);

#[derive(Parser, Debug)]
#[command(
    name = "wal2kafka",
    about = "Stream PostgreSQL logical replication changes to Kafka",
    version
)]
struct Args {
    /// Path to the JSON stream-routes file (overrides STREAMS_FILE)
    #[arg(long)]
    streams_file: Option<String>,
}

extern "C" fn handle_signal(_signal: libc::c_int) {
    STOP.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    let handler: extern "C" fn(libc::c_int) = handle_signal;
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(false).init();

    let args = Args::parse();
    install_signal_handlers();

    let config = Config::from_env(args.streams_file.as_deref())?;
    info!(
        slot = %config.source.slot_name,
        publication = %config.source.publication_name,
        tables = config.source.tables.len(),
        streams = config.streams.len(),
        "starting wal2kafka"
    );

    match run(config) {
        Ok(()) => {
            info!("shut down cleanly");
            Ok(())
        }
        Err(err) => {
            error!("fatal: {err}");
            Err(err.into())
        }
    }
}

fn run(config: Config) -> ReplicationResult<()> {
    let mut source = StreamingSource::new(
        config.source.slot_name.clone(),
        config.source.publication_name.clone(),
    );
    source.connect(
        &config.source.connection_string,
        &config.source.tables,
        config.source.start_lsn,
    )?;

    let mut processor = Processor::new(source, config.streams, config.sink.brokers, config.tuning);
    processor.initialize()?;
    processor.run(&STOP)
}
