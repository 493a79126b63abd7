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

//! Job lifecycle management.
//!
//! [`JobQueue`] is the only component that transitions job state. It
//! enforces the state machine
//! (`pending → processing → completed | failed | dead`), computes retry
//! deadlines, and exposes the administrative calls the embedding CLI
//! invokes: enqueue, info, list, status, DLQ list, and DLQ retry.
//!
//! Every post-execution transition is guarded by a conditional update
//! keyed on the claiming worker's identity. A worker whose claim was
//! reclaimed in the meantime gets [`QueueError::LockLost`] and must
//! discard its outcome.

use chrono::Utc;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::dal::DAL;
use crate::database::connection::Database;
use crate::error::{QueueError, StorageError};
use crate::models::job::{Job, JobState};
use crate::worker::WorkerId;

/// A request to add a job to the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueRequest {
    /// Unique job identity, chosen by the caller.
    pub id: String,
    /// Shell command to execute.
    pub command: String,
    /// Attempt ceiling override; defaults from configuration when
    /// omitted.
    pub max_retries: Option<u32>,
}

impl EnqueueRequest {
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            max_retries: None,
        }
    }

    /// Builds a request with a generated v4 uuid id, for callers that
    /// don't care about the identity.
    pub fn with_generated_id(command: impl Into<String>) -> Self {
        Self::new(Uuid::new_v4().to_string(), command)
    }

    /// Overrides the attempt ceiling for this job.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// Aggregate queue counts returned by [`JobQueue::status`].
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub total: i64,
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub dead: i64,
    /// Distinct workers currently holding processing locks. There is no
    /// worker registry; this is derived from the rows alone.
    pub active_workers: i64,
}

/// Manages the job state machine over the durable store.
#[derive(Clone)]
pub struct JobQueue {
    dal: DAL,
    config: QueueConfig,
}

impl JobQueue {
    pub fn new(database: &Database, config: QueueConfig) -> Self {
        Self {
            dal: DAL::new(database.pool()),
            config,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Adds a new job in state `pending`.
    pub fn enqueue(&self, request: EnqueueRequest) -> Result<Job, QueueError> {
        if request.id.trim().is_empty() {
            return Err(QueueError::EmptyId);
        }
        if request.command.trim().is_empty() {
            return Err(QueueError::EmptyCommand);
        }

        let max_retries = request
            .max_retries
            .unwrap_or_else(|| self.config.default_max_retries());
        let max_retries = i32::try_from(max_retries).unwrap_or(i32::MAX);

        match self
            .dal
            .jobs()
            .create(&request.id, &request.command, max_retries, Utc::now())
        {
            Ok(job) => {
                info!(job_id = %job.id, "job enqueued");
                Ok(job)
            }
            Err(StorageError::Database(DieselError::DatabaseError(
                DatabaseErrorKind::UniqueViolation,
                _,
            ))) => Err(QueueError::DuplicateId(request.id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Fetches a job by id.
    pub fn job(&self, id: &str) -> Result<Job, QueueError> {
        self.dal
            .jobs()
            .get(id)?
            .ok_or_else(|| QueueError::NotFound(id.to_string()))
    }

    /// Lists jobs, newest first, optionally filtered by state.
    pub fn list(&self, state: Option<JobState>, limit: i64) -> Result<Vec<Job>, QueueError> {
        Ok(self.dal.jobs().list(state, limit)?)
    }

    /// Aggregate counts per state.
    pub fn status(&self) -> Result<QueueStatus, QueueError> {
        let counts = self.dal.jobs().counts()?;
        Ok(QueueStatus {
            total: counts.total(),
            pending: counts.pending,
            processing: counts.processing,
            completed: counts.completed,
            failed: counts.failed,
            dead: counts.dead,
            active_workers: counts.active_workers,
        })
    }

    /// Jobs in the dead letter queue.
    pub fn dlq_list(&self) -> Result<Vec<Job>, QueueError> {
        Ok(self.dal.jobs().list_dead()?)
    }

    /// Reschedules a dead job from scratch: back to `pending`, zero
    /// attempts, prior outcome cleared.
    pub fn dlq_retry(&self, id: &str) -> Result<Job, QueueError> {
        match self.dal.jobs().reset_for_retry(id, Utc::now())? {
            Some(job) => {
                info!(job_id = %job.id, "dead job rescheduled");
                Ok(job)
            }
            // Distinguish a missing row from one outside the DLQ.
            None => match self.dal.jobs().get(id)? {
                Some(_) => Err(QueueError::NotInDlq(id.to_string())),
                None => Err(QueueError::NotFound(id.to_string())),
            },
        }
    }

    /// Claims the next eligible job for `worker`, transitioning it to
    /// `processing` under that worker's lock.
    pub fn claim(&self, worker: &WorkerId) -> Result<Option<Job>, QueueError> {
        let now = Utc::now();
        let cutoff = now - self.stale_threshold();
        let claimed = self
            .dal
            .jobs()
            .claim_next_eligible(worker.as_str(), now, cutoff)?;
        Ok(claimed)
    }

    /// Records a successful execution: `completed`, lock cleared,
    /// captured stdout stored. Success never touches `attempts`.
    pub fn report_success(
        &self,
        job_id: &str,
        worker: &WorkerId,
        output: Option<String>,
    ) -> Result<Job, QueueError> {
        self.dal
            .jobs()
            .mark_completed(job_id, worker.as_str(), output.as_deref(), Utc::now())?
            .ok_or_else(|| QueueError::LockLost(job_id.to_string()))
    }

    /// Records a failed execution, scheduling a retry or dead-lettering
    /// the job once the attempt ceiling is passed.
    pub fn report_failure(
        &self,
        job_id: &str,
        worker: &WorkerId,
        error: String,
    ) -> Result<Job, QueueError> {
        let job = self.job(job_id)?;
        if job.state != JobState::Processing || !job.is_locked_by(worker.as_str()) {
            return Err(QueueError::LockLost(job_id.to_string()));
        }

        // Any competing mutation of `attempts` also rewrites the lock
        // fields, so the locked_by-keyed update below fails rather than
        // applying a decision computed from a stale read.
        let now = Utc::now();
        let new_attempts = job.attempts + 1;
        let (new_state, next_retry_at) = if new_attempts > job.max_retries {
            (JobState::Dead, None)
        } else {
            let delay = backoff_delay(self.config.backoff_base(), new_attempts);
            (JobState::Failed, Some(now + delay))
        };

        let updated = self
            .dal
            .jobs()
            .mark_failed(
                job_id,
                worker.as_str(),
                new_state,
                new_attempts,
                &error,
                next_retry_at,
                now,
            )?
            .ok_or_else(|| QueueError::LockLost(job_id.to_string()))?;

        match updated.state {
            JobState::Dead => {
                info!(job_id, attempts = updated.attempts, "job moved to dead letter queue")
            }
            _ => debug!(job_id, attempts = updated.attempts, "job scheduled for retry"),
        }
        Ok(updated)
    }

    /// Reclaims locks older than the configured threshold. Returns the
    /// ids of reclaimed jobs.
    pub fn reap_stale_locks(&self) -> Result<Vec<String>, QueueError> {
        let now = Utc::now();
        let cutoff = now - self.stale_threshold();
        let reaped = self.dal.jobs().reap_stale_locks(cutoff, now)?;
        if !reaped.is_empty() {
            info!(count = reaped.len(), "reclaimed stale job locks");
        }
        Ok(reaped)
    }

    fn stale_threshold(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.stale_lock_threshold())
            .unwrap_or_else(|_| chrono::Duration::seconds(MAX_BACKOFF_SECS))
    }
}

// Keeps computed deadlines representable even for absurd attempt counts.
const MAX_BACKOFF_SECS: i64 = 10 * 365 * 24 * 60 * 60;

/// Exponential retry delay: `base ^ attempts` seconds, where `attempts`
/// is the post-increment count of the failure being recorded.
pub(crate) fn backoff_delay(base: u32, attempts: i32) -> chrono::Duration {
    let base = i64::from(base.max(2));
    let exponent = u32::try_from(attempts).unwrap_or(0);
    let secs = base.saturating_pow(exponent);
    chrono::Duration::seconds(secs.min(MAX_BACKOFF_SECS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially() {
        assert_eq!(backoff_delay(2, 1), chrono::Duration::seconds(2));
        assert_eq!(backoff_delay(2, 2), chrono::Duration::seconds(4));
        assert_eq!(backoff_delay(2, 3), chrono::Duration::seconds(8));
        assert_eq!(backoff_delay(3, 2), chrono::Duration::seconds(9));
    }

    #[test]
    fn backoff_clamps_degenerate_inputs() {
        // Bases below the documented minimum behave as base 2.
        assert_eq!(backoff_delay(0, 1), chrono::Duration::seconds(2));
        // Huge attempt counts stay representable.
        assert_eq!(
            backoff_delay(2, i32::MAX),
            chrono::Duration::seconds(MAX_BACKOFF_SECS)
        );
        // A negative count (impossible through the state machine) does
        // not panic.
        assert_eq!(backoff_delay(2, -1), chrono::Duration::seconds(1));
    }

    #[test]
    fn enqueue_request_builders() {
        let request = EnqueueRequest::new("deploy", "make deploy").max_retries(5);
        assert_eq!(request.id, "deploy");
        assert_eq!(request.command, "make deploy");
        assert_eq!(request.max_retries, Some(5));

        let generated = EnqueueRequest::with_generated_id("true");
        assert!(!generated.id.is_empty());
        assert!(uuid::Uuid::parse_str(&generated.id).is_ok());
        assert_eq!(generated.max_retries, None);
    }
}
