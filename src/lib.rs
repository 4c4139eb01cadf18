//! config-watcher - mirror a mounted config directory into a working directory
//!
//! A sidecar daemon that watches a source directory and copies changed
//! files into a destination directory, replacing each file atomically.
//! Works with plain directories and with configmap volumes that publish
//! updates by swapping a `..data` link.

pub mod config;
pub mod copy;
pub mod queue;
pub mod task;
pub mod trigger;
pub mod watcher;
pub mod worker;

pub use config::{Cli, Config, WatchFilter};
pub use copy::{CopyError, Copier};
pub use queue::DelayingQueue;
pub use task::CopyTask;
pub use trigger::Trigger;
pub use watcher::FsOp;
pub use worker::Worker;

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, info_span, Level};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::writer::MakeWriterExt;

/// Set up logging to stderr, and to a file when `log_dir` is given
pub fn setup_logging(log_dir: Option<&Path>, verbose: bool) -> Result<Option<WorkerGuard>> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };

    let builder = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_span_events(FmtSpan::NONE);

    let Some(log_dir) = log_dir else {
        builder.with_writer(std::io::stderr).init();
        return Ok(None);
    };

    fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory: {}", log_dir.display()))?;

    let file_appender = RollingFileAppender::new(Rotation::NEVER, log_dir, "config-watcher.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    builder
        .with_writer(std::io::stderr.and(non_blocking))
        .with_ansi(false)
        .init();

    Ok(Some(guard))
}

/// Queue the startup tasks, start the copy worker and watch until shutdown
pub fn run(config: Config) -> Result<()> {
    let _guard = setup_logging(config.log_dir.as_deref(), config.verbose)?;

    info!(
        source = %config.source.display(),
        destination = %config.destination.display(),
        files = ?config.files,
        configmap = config.is_configmap,
        copy_hidden = config.copy_hidden,
        "config-watcher starting"
    );

    let queue = Arc::new(DelayingQueue::new());

    let copier = Copier::new(config.copy_hidden, info_span!("copy"));
    let worker = Worker::new(Arc::clone(&queue), copier, info_span!("worker"))
        .spawn()
        .context("Failed to start copy worker")?;

    // Seeding happens before the watch is registered; a change landing in
    // between is only picked up by the next event.
    for task in config.seed_tasks() {
        queue.add(task);
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        info!("shutdown signal received");
        r.store(false, Ordering::SeqCst);
    })
    .context("Failed to set signal handler")?;

    let trigger = Trigger::new(&config, Arc::clone(&queue), info_span!("trigger"));
    let watched = watcher::watch_and_copy(&trigger, &config.source, running);

    queue.shutdown();
    if worker.join().is_err() {
        error!("copy worker panicked");
    }

    watched?;
    info!("config-watcher shutting down");
    Ok(())
}
