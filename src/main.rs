//! worker-loop: host binary for the worker event loops.
//!
//! Starts one event loop per worker, with the permission gate configured from
//! the `[security]` section, and reports each worker's scheduling delay
//! periodically. With `--run-for` it shuts the workers down after the given
//! number of seconds; otherwise it runs until killed.

use std::thread;
use std::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;
use worker_loop::config::Config;
use worker_loop::{Processor, SettingsHandle};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        workers = config.workers,
        task_queue_capacity = config.task_queue_capacity,
        priority_queues = config.enable_priority_queues,
        delay_check_ms = config.delay_check_interval.as_millis() as u64,
        enforced_types = ?config.require_permission_message_types,
        "Starting worker-loop"
    );

    // No ACL evaluator is wired into the standalone binary, so enforced
    // message types are rejected for everyone but cluster nodes.
    let processor = Processor::new(SettingsHandle::new(config.to_settings()), None)?;

    let started = Instant::now();
    let mut last_delay = vec![0u64; processor.worker_count()];
    loop {
        let sleep_for = match config.run_for {
            Some(limit) => match limit.checked_sub(started.elapsed()) {
                Some(left) if !left.is_zero() => left.min(config.stats_interval),
                _ => break,
            },
            None => config.stats_interval,
        };
        thread::sleep(sleep_for);

        for (worker, last) in processor.workers().iter().zip(last_delay.iter_mut()) {
            let delay = worker.delay_us();
            info!(
                worker = %worker.name(),
                tid = ?worker.tid(),
                delay_us = delay,
                delta_us = delay.saturating_sub(*last),
                pending = worker.pending_tasks(),
                "Worker stats"
            );
            *last = delay;
        }
    }

    info!(
        total_delay_us = processor.total_delay_us(),
        uptime_ms = started.elapsed().as_millis() as u64,
        "Shutting down"
    );
    processor.shutdown();
    Ok(())
}
