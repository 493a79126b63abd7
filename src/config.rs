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

//! Queue configuration.
//!
//! [`QueueConfig`] is an immutable value object: the embedding process
//! (the CLI owns file loading and persistence) resolves its settings up
//! front and hands the finished value to the queue and workers.
//!
//! # Construction
//!
//! Use [`QueueConfig::builder()`] to override individual settings:
//!
//! ```rust,ignore
//! let config = QueueConfig::builder()
//!     .default_max_retries(5)
//!     .poll_interval(Duration::from_millis(500))
//!     .build();
//! ```
//!
//! Or take the defaults with `QueueConfig::default()`.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Tunables consumed by the queue core and the worker runtime.
///
/// Read-only after construction; clones are cheap and share nothing
/// mutable.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    default_max_retries: u32,
    backoff_base: u32,
    poll_interval: Duration,
    worker_timeout: Option<Duration>,
    stale_lock_threshold: Duration,
    output_cap: usize,
    shutdown_grace: Duration,
    db_path: PathBuf,
    db_pool_size: u32,
}

impl QueueConfig {
    /// Creates a new configuration builder with default values.
    pub fn builder() -> QueueConfigBuilder {
        QueueConfigBuilder::default()
    }

    /// Attempt ceiling applied to enqueues that omit one.
    pub fn default_max_retries(&self) -> u32 {
        self.default_max_retries
    }

    /// Base of the exponential retry backoff, in seconds per attempt.
    pub fn backoff_base(&self) -> u32 {
        self.backoff_base
    }

    /// Worker idle sleep between empty claim attempts.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Optional wall-clock ceiling per job execution.
    pub fn worker_timeout(&self) -> Option<Duration> {
        self.worker_timeout
    }

    /// Age beyond which a processing lock is considered abandoned.
    pub fn stale_lock_threshold(&self) -> Duration {
        self.stale_lock_threshold
    }

    /// Per-stream capture limit for child stdout/stderr, in bytes.
    pub fn output_cap(&self) -> usize {
        self.output_cap
    }

    /// Window in which a second shutdown signal escalates to a kill.
    pub fn shutdown_grace(&self) -> Duration {
        self.shutdown_grace
    }

    /// Location of the SQLite job store.
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Number of connections in the database pool.
    pub fn db_pool_size(&self) -> u32 {
        self.db_pool_size
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_max_retries: 3,
            backoff_base: 2,
            poll_interval: Duration::from_secs(1),
            worker_timeout: None,
            stale_lock_threshold: Duration::from_secs(60),
            output_cap: 10 * 1024,
            shutdown_grace: Duration::from_secs(10),
            db_path: default_db_path(),
            db_pool_size: 5,
        }
    }
}

fn default_db_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".queuectl")
        .join("queuectl.db")
}

/// Builder for [`QueueConfig`].
#[derive(Debug, Clone)]
pub struct QueueConfigBuilder {
    config: QueueConfig,
}

impl Default for QueueConfigBuilder {
    fn default() -> Self {
        Self {
            config: QueueConfig::default(),
        }
    }
}

impl QueueConfigBuilder {
    /// Attempt ceiling for enqueues that omit one.
    pub fn default_max_retries(mut self, max_retries: u32) -> Self {
        self.config.default_max_retries = max_retries;
        self
    }

    /// Base of the exponential backoff formula. Bases below 2 are
    /// treated as 2.
    pub fn backoff_base(mut self, base: u32) -> Self {
        self.config.backoff_base = base.max(2);
        self
    }

    /// Worker idle sleep between empty claim attempts.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// Wall-clock ceiling per job execution.
    pub fn worker_timeout(mut self, timeout: Duration) -> Self {
        self.config.worker_timeout = Some(timeout);
        self
    }

    /// Age beyond which a processing lock becomes reclaimable.
    pub fn stale_lock_threshold(mut self, threshold: Duration) -> Self {
        self.config.stale_lock_threshold = threshold;
        self
    }

    /// Per-stream capture limit for child stdout/stderr, in bytes.
    pub fn output_cap(mut self, cap: usize) -> Self {
        self.config.output_cap = cap;
        self
    }

    /// Window in which a second shutdown signal escalates to a kill.
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.config.shutdown_grace = grace;
        self
    }

    /// Location of the SQLite job store.
    pub fn db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.db_path = path.into();
        self
    }

    /// Number of connections in the database pool.
    pub fn db_pool_size(mut self, size: u32) -> Self {
        self.config.db_pool_size = size;
        self
    }

    /// Finalizes the configuration.
    pub fn build(self) -> QueueConfig {
        self.config
    }
}
