/*
 *  Copyright 2025 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Worker process entrypoint.
//!
//! The queue CLI spawns one of these per worker. It opens the shared job
//! store, wires OS signals to the worker's shutdown handle, and runs a
//! single [`Worker`] until it drains. Startup faults (unreadable store,
//! failed migration) exit nonzero; everything after startup is handled
//! inside the worker loop.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use queuectl::{init_logging, Database, QueueConfig, ShutdownHandle, Worker, WorkerId};

#[derive(Debug, Parser)]
#[command(name = "queuectl-worker", about = "Run a single job queue worker process")]
struct Args {
    /// Path to the job database (defaults to ~/.queuectl/queuectl.db).
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Worker identity; derived from the process id when omitted.
    #[arg(long)]
    worker_id: Option<String>,

    /// Seconds to sleep between empty claim attempts.
    #[arg(long)]
    poll_interval: Option<u64>,

    /// Wall-clock ceiling per job execution, in seconds.
    #[arg(long)]
    timeout: Option<u64>,

    /// Age in seconds beyond which a processing lock is reclaimed.
    #[arg(long)]
    stale_lock_threshold: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging(None);
    let args = Args::parse();

    let mut builder = QueueConfig::builder();
    if let Some(path) = args.db_path {
        builder = builder.db_path(path);
    }
    if let Some(secs) = args.poll_interval {
        builder = builder.poll_interval(Duration::from_secs(secs));
    }
    if let Some(secs) = args.timeout {
        builder = builder.worker_timeout(Duration::from_secs(secs));
    }
    if let Some(secs) = args.stale_lock_threshold {
        builder = builder.stale_lock_threshold(Duration::from_secs(secs));
    }
    let config = builder.build();

    let database = Database::new(config.db_path(), config.db_pool_size())
        .context("failed to open job database")?;
    database
        .run_migrations()
        .context("failed to migrate job database")?;

    let worker = match args.worker_id {
        Some(id) => Worker::with_id(&database, config, WorkerId::new(id)),
        None => Worker::new(&database, config),
    };

    let shutdown = worker.shutdown_handle();
    tokio::spawn(listen_for_signals(shutdown));

    worker.run().await.context("worker halted")?;
    Ok(())
}

/// Forwards SIGINT/SIGTERM to the worker's shutdown handle. Each signal
/// counts once, so a double Ctrl+C escalates to a kill.
async fn listen_for_signals(shutdown: ShutdownHandle) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                return;
            }
        };

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => shutdown.request(),
                _ = term.recv() => shutdown.request(),
            }
        }
    }

    #[cfg(not(unix))]
    {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            shutdown.request();
        }
    }
}
