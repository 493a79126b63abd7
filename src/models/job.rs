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

//! Job Model
//!
//! The job is the sole persistent entity of the queue. This module
//! defines the lifecycle state vocabulary, the domain-level [`Job`]
//! struct used throughout the crate, and the raw row types that map to
//! the SQLite `jobs` table. Timestamps are stored as TEXT and converted
//! to `DateTime<Utc>` at the DAL boundary.

use chrono::{DateTime, SecondsFormat, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::database::schema::jobs;
use crate::error::StorageError;

/// Lifecycle states of a job.
///
/// `Completed` and `Dead` are terminal: nothing but an explicit DLQ
/// retry ever mutates a row again once it reaches them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Waiting to be claimed for its first execution.
    Pending,
    /// Claimed by a worker that is currently executing the command.
    Processing,
    /// The command exited zero.
    Completed,
    /// The command failed; a retry deadline is scheduled.
    Failed,
    /// Retries exhausted; parked in the dead letter queue.
    Dead,
}

impl JobState {
    /// Returns the lowercase string stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
        }
    }

    /// Parses a stored state string.
    pub fn parse(value: &str) -> Result<Self, StorageError> {
        match value {
            "pending" => Ok(JobState::Pending),
            "processing" => Ok(JobState::Processing),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "dead" => Ok(JobState::Dead),
            other => Err(StorageError::UnknownState(other.to_string())),
        }
    }

    /// True for states no regular transition ever leaves.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Dead)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encodes a UTC timestamp in the fixed-width form stored in SQLite.
///
/// Microsecond precision with a literal `Z` suffix keeps every encoded
/// value the same length, so SQL string comparison matches chronological
/// order. The eligibility predicate depends on this.
pub fn encode_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parses a timestamp previously written by [`encode_timestamp`].
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|source| StorageError::InvalidTimestamp {
            value: value.to_string(),
            source,
        })
}

/// A persisted job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Client-supplied unique identity.
    pub id: String,
    /// Shell command executed verbatim by the worker.
    pub command: String,
    /// Current lifecycle state.
    pub state: JobState,
    /// Number of failed executions recorded so far.
    pub attempts: i32,
    /// Ceiling on `attempts` before the job is dead-lettered.
    pub max_retries: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Identity of the worker holding the row, while `processing`.
    pub locked_by: Option<String>,
    /// When the current lock was taken.
    pub locked_at: Option<DateTime<Utc>>,
    /// Earliest instant a failed job becomes claimable again.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Captured stderr (or a worker diagnostic) from the last failure.
    pub error: Option<String>,
    /// Captured stdout from the successful execution.
    pub output: Option<String>,
}

impl Job {
    /// True while the row is locked under `worker_id`.
    pub fn is_locked_by(&self, worker_id: &str) -> bool {
        self.locked_by.as_deref() == Some(worker_id)
    }
}

/// Raw row as stored in SQLite.
#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = jobs)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct JobRow {
    pub id: String,
    pub command: String,
    pub state: String,
    pub attempts: i32,
    pub max_retries: i32,
    pub created_at: String,
    pub updated_at: String,
    pub locked_by: Option<String>,
    pub locked_at: Option<String>,
    pub next_retry_at: Option<String>,
    pub error: Option<String>,
    pub output: Option<String>,
}

impl TryFrom<JobRow> for Job {
    type Error = StorageError;

    fn try_from(row: JobRow) -> Result<Self, StorageError> {
        Ok(Job {
            state: JobState::parse(&row.state)?,
            created_at: parse_timestamp(&row.created_at)?,
            updated_at: parse_timestamp(&row.updated_at)?,
            locked_at: row.locked_at.as_deref().map(parse_timestamp).transpose()?,
            next_retry_at: row
                .next_retry_at
                .as_deref()
                .map(parse_timestamp)
                .transpose()?,
            id: row.id,
            command: row.command,
            attempts: row.attempts,
            max_retries: row.max_retries,
            locked_by: row.locked_by,
            error: row.error,
            output: row.output,
        })
    }
}

/// Insertable row for a newly enqueued job. Lock and outcome columns
/// start out NULL.
#[derive(Debug, Insertable)]
#[diesel(table_name = jobs)]
pub struct NewJobRow {
    pub id: String,
    pub command: String,
    pub state: String,
    pub attempts: i32,
    pub max_retries: i32,
    pub created_at: String,
    pub updated_at: String,
}
