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

//! Error types for the job queue.
//!
//! Storage faults are kept separate from queue-level outcomes so callers
//! can tell a broken database apart from an invalid request or a lost
//! claim. Execution failures of the commands themselves are never errors
//! here: they travel through the state machine as data on the job row.

use std::path::PathBuf;
use thiserror::Error;

/// Faults raised by the durable store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("connection pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),

    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("blocking database task failed: {0}")]
    BlockingTask(String),

    #[error("failed to run migrations: {0}")]
    Migration(String),

    #[error("failed to create database directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid stored timestamp {value:?}: {source}")]
    InvalidTimestamp {
        value: String,
        source: chrono::ParseError,
    },

    #[error("unknown job state {0:?}")]
    UnknownState(String),
}

/// Errors surfaced to control-plane callers and workers.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job id must not be empty")]
    EmptyId,

    #[error("command must not be empty")]
    EmptyCommand,

    #[error("job {0:?} already exists")]
    DuplicateId(String),

    #[error("job {0:?} not found")]
    NotFound(String),

    #[error("job {0:?} is not in the dead letter queue")]
    NotInDlq(String),

    /// The caller's claim was invalidated before its report landed,
    /// typically by the stale-lock reaper. The reported outcome must be
    /// discarded; whoever holds the row now owns the next transition.
    #[error("lock on job {0:?} is no longer held")]
    LockLost(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}
