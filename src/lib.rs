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

//! Durable background job queue for a single machine.
//!
//! Jobs are shell commands persisted in a SQLite-backed store and
//! executed by a pool of cooperating worker processes. Coordination
//! happens exclusively through the store: an atomic claim transition
//! guarantees at-most-one concurrent execution per job, failed jobs are
//! re-admitted on an exponential backoff schedule until an attempt
//! ceiling parks them in the dead letter queue, and stale locks left by
//! crashed workers are reclaimed by any live worker.
//!
//! The main entry points are:
//!
//! - [`JobQueue`]: the state machine and the administrative calls
//!   (enqueue, info, list, status, DLQ list/retry)
//! - [`Worker`]: the claim-execute-report runtime with graceful
//!   shutdown
//! - [`Database`]: pooled access to the durable store
//! - [`QueueConfig`]: immutable tunables
//!
//! # Example
//!
//! ```rust,ignore
//! let config = QueueConfig::default();
//! let database = Database::new(config.db_path(), config.db_pool_size())?;
//! database.run_migrations()?;
//!
//! let queue = JobQueue::new(&database, config.clone());
//! queue.enqueue(EnqueueRequest::new("nightly-report", "make report"))?;
//!
//! let worker = Worker::new(&database, config);
//! worker.run().await?;
//! ```

pub mod config;
pub mod dal;
pub mod database;
pub mod error;
pub mod models;
pub mod queue;
pub mod worker;

pub use config::{QueueConfig, QueueConfigBuilder};
pub use database::connection::Database;
pub use error::{QueueError, StorageError};
pub use models::job::{Job, JobState};
pub use queue::{EnqueueRequest, JobQueue, QueueStatus};
pub use worker::{ShutdownHandle, Worker, WorkerId};

/// Initializes the global tracing subscriber.
///
/// `filter` overrides the `RUST_LOG` environment filter. Safe to call
/// more than once; later calls are no-ops.
pub fn init_logging(filter: Option<&str>) {
    use tracing_subscriber::EnvFilter;

    let filter = match filter {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
