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

//! Job row operations: insertion, lookup, the atomic claim primitive,
//! conditional post-execution updates, and stale-lock reaping.
//!
//! SQLite has no `FOR UPDATE SKIP LOCKED`, so every read-then-write
//! operation here runs inside an IMMEDIATE transaction: the write lock
//! is taken up front and concurrent claimers serialize instead of racing
//! between SELECT and UPDATE.

use chrono::{DateTime, Utc};
use diesel::dsl::{count_distinct, count_star};
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use tracing::debug;

use super::DAL;
use crate::database::connection::PooledConn;
use crate::database::schema::jobs;
use crate::error::StorageError;
use crate::models::job::{encode_timestamp, Job, JobRow, JobState, NewJobRow};

/// Job-row accessor borrowed from [`DAL`].
pub struct JobDAL<'a> {
    pub(crate) dal: &'a DAL,
}

/// Per-state totals for the status call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct JobCounts {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub dead: i64,
    /// Distinct worker identities currently holding processing locks.
    pub active_workers: i64,
}

impl JobCounts {
    pub fn total(&self) -> i64 {
        self.pending + self.processing + self.completed + self.failed + self.dead
    }
}

impl<'a> JobDAL<'a> {
    fn conn(&self) -> Result<PooledConn, StorageError> {
        Ok(self.dal.pool.get()?)
    }

    fn load(conn: &mut SqliteConnection, id: &str) -> Result<Option<Job>, StorageError> {
        let row: Option<JobRow> = jobs::table.find(id).first(conn).optional()?;
        row.map(Job::try_from).transpose()
    }

    /// Inserts a newly enqueued job in state `pending`.
    ///
    /// A duplicate id surfaces as a unique-key violation in the returned
    /// error.
    pub fn create(
        &self,
        id: &str,
        command: &str,
        max_retries: i32,
        now: DateTime<Utc>,
    ) -> Result<Job, StorageError> {
        let mut conn = self.conn()?;
        let now_s = encode_timestamp(now);
        let row = NewJobRow {
            id: id.to_string(),
            command: command.to_string(),
            state: JobState::Pending.as_str().to_string(),
            attempts: 0,
            max_retries,
            created_at: now_s.clone(),
            updated_at: now_s,
        };

        diesel::insert_into(jobs::table)
            .values(&row)
            .execute(&mut conn)?;

        Self::load(&mut conn, id)?
            .ok_or_else(|| StorageError::Database(diesel::result::Error::NotFound))
    }

    /// Looks up a job by id.
    pub fn get(&self, id: &str) -> Result<Option<Job>, StorageError> {
        let mut conn = self.conn()?;
        Self::load(&mut conn, id)
    }

    /// Lists jobs, newest first, optionally filtered by state.
    pub fn list(&self, state: Option<JobState>, limit: i64) -> Result<Vec<Job>, StorageError> {
        let mut conn = self.conn()?;
        let mut query = jobs::table.into_boxed();
        if let Some(state) = state {
            query = query.filter(jobs::state.eq(state.as_str()));
        }
        let rows: Vec<JobRow> = query
            .order((jobs::created_at.desc(), jobs::id.desc()))
            .limit(limit)
            .load(&mut conn)?;
        rows.into_iter().map(Job::try_from).collect()
    }

    /// Jobs currently in the dead letter queue, newest first.
    pub fn list_dead(&self) -> Result<Vec<Job>, StorageError> {
        self.list(Some(JobState::Dead), i64::MAX)
    }

    /// Per-state counts plus the number of distinct workers holding
    /// processing rows. The core keeps no worker registry; the lock
    /// column is the only evidence of activity it has.
    pub fn counts(&self) -> Result<JobCounts, StorageError> {
        let mut conn = self.conn()?;
        let rows: Vec<(String, i64)> = jobs::table
            .group_by(jobs::state)
            .select((jobs::state, count_star()))
            .load(&mut conn)?;

        let mut counts = JobCounts::default();
        for (state, n) in rows {
            match JobState::parse(&state)? {
                JobState::Pending => counts.pending = n,
                JobState::Processing => counts.processing = n,
                JobState::Completed => counts.completed = n,
                JobState::Failed => counts.failed = n,
                JobState::Dead => counts.dead = n,
            }
        }

        counts.active_workers = jobs::table
            .filter(jobs::state.eq(JobState::Processing.as_str()))
            .select(count_distinct(jobs::locked_by))
            .first(&mut conn)?;

        Ok(counts)
    }

    /// Atomically claims the oldest eligible job for `worker_id`.
    ///
    /// Eligible rows are `pending` or `failed`, past their retry
    /// deadline, and either unlocked or carrying a lock older than
    /// `stale_cutoff`. At most one concurrent caller can win a given
    /// row; losers simply see `None` and poll again.
    pub fn claim_next_eligible(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        stale_cutoff: DateTime<Utc>,
    ) -> Result<Option<Job>, StorageError> {
        let mut conn = self.conn()?;
        let now_s = encode_timestamp(now);
        let cutoff_s = encode_timestamp(stale_cutoff);

        conn.immediate_transaction(|conn| {
            let candidate: Option<String> = jobs::table
                .filter(
                    jobs::state.eq_any([JobState::Pending.as_str(), JobState::Failed.as_str()]),
                )
                .filter(
                    jobs::next_retry_at
                        .is_null()
                        .or(jobs::next_retry_at.le(&now_s)),
                )
                .filter(jobs::locked_by.is_null().or(jobs::locked_at.lt(&cutoff_s)))
                .order((jobs::created_at.asc(), jobs::id.asc()))
                .select(jobs::id)
                .first(conn)
                .optional()?;

            let Some(id) = candidate else {
                return Ok(None);
            };

            // The deadline has served its purpose once the row is
            // claimed; only failed rows carry one.
            diesel::update(jobs::table.find(&id))
                .set((
                    jobs::state.eq(JobState::Processing.as_str()),
                    jobs::locked_by.eq(worker_id),
                    jobs::locked_at.eq(&now_s),
                    jobs::next_retry_at.eq(None::<String>),
                    jobs::updated_at.eq(&now_s),
                ))
                .execute(conn)?;

            debug!(job_id = %id, worker_id, "claimed job");
            Self::load(conn, &id)
        })
    }

    /// Marks a claimed job completed, keyed on the claiming worker.
    ///
    /// Returns `None` when the lock is no longer held by
    /// `expected_locked_by`; the caller must discard its outcome.
    pub fn mark_completed(
        &self,
        id: &str,
        expected_locked_by: &str,
        output: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StorageError> {
        let mut conn = self.conn()?;
        let now_s = encode_timestamp(now);

        conn.immediate_transaction(|conn| {
            let updated = diesel::update(
                jobs::table
                    .find(id)
                    .filter(jobs::state.eq(JobState::Processing.as_str()))
                    .filter(jobs::locked_by.eq(expected_locked_by)),
            )
            .set((
                jobs::state.eq(JobState::Completed.as_str()),
                jobs::locked_by.eq(None::<String>),
                jobs::locked_at.eq(None::<String>),
                jobs::output.eq(output),
                jobs::updated_at.eq(&now_s),
            ))
            .execute(conn)?;

            if updated == 0 {
                return Ok(None);
            }
            Self::load(conn, id)
        })
    }

    /// Records a failed execution, keyed on the claiming worker.
    ///
    /// The caller decides whether the job retries (`failed`, with a
    /// deadline) or is dead-lettered (`dead`, no deadline). Returns
    /// `None` when the lock is no longer held.
    #[allow(clippy::too_many_arguments)]
    pub fn mark_failed(
        &self,
        id: &str,
        expected_locked_by: &str,
        new_state: JobState,
        new_attempts: i32,
        error: &str,
        next_retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StorageError> {
        let mut conn = self.conn()?;
        let now_s = encode_timestamp(now);
        let retry_s = next_retry_at.map(encode_timestamp);

        conn.immediate_transaction(|conn| {
            let updated = diesel::update(
                jobs::table
                    .find(id)
                    .filter(jobs::state.eq(JobState::Processing.as_str()))
                    .filter(jobs::locked_by.eq(expected_locked_by)),
            )
            .set((
                jobs::state.eq(new_state.as_str()),
                jobs::attempts.eq(new_attempts),
                jobs::locked_by.eq(None::<String>),
                jobs::locked_at.eq(None::<String>),
                jobs::error.eq(error),
                jobs::next_retry_at.eq(retry_s.as_deref()),
                jobs::updated_at.eq(&now_s),
            ))
            .execute(conn)?;

            if updated == 0 {
                return Ok(None);
            }
            Self::load(conn, id)
        })
    }

    /// Reclaims processing locks older than `cutoff`.
    ///
    /// Each reclaimed row moves back to `failed` with an immediate retry
    /// deadline and its attempt count untouched; a crash is not the
    /// job's fault. The update is keyed on the observed `locked_by`, so
    /// a still-live worker whose report lands first wins the race.
    /// Returns the ids of reclaimed jobs.
    pub fn reap_stale_locks(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, StorageError> {
        let mut conn = self.conn()?;
        let cutoff_s = encode_timestamp(cutoff);
        let now_s = encode_timestamp(now);

        conn.immediate_transaction(|conn| {
            let stale: Vec<(String, Option<String>)> = jobs::table
                .filter(jobs::state.eq(JobState::Processing.as_str()))
                .filter(jobs::locked_at.lt(&cutoff_s))
                .select((jobs::id, jobs::locked_by))
                .load(conn)?;

            let mut reaped = Vec::new();
            for (id, locked_by) in stale {
                let Some(holder) = locked_by else { continue };
                let updated = diesel::update(
                    jobs::table
                        .find(&id)
                        .filter(jobs::state.eq(JobState::Processing.as_str()))
                        .filter(jobs::locked_by.eq(&holder)),
                )
                .set((
                    jobs::state.eq(JobState::Failed.as_str()),
                    jobs::locked_by.eq(None::<String>),
                    jobs::locked_at.eq(None::<String>),
                    jobs::error.eq("stale lock reclaimed"),
                    jobs::next_retry_at.eq(&now_s),
                    jobs::updated_at.eq(&now_s),
                ))
                .execute(conn)?;

                if updated > 0 {
                    debug!(job_id = %id, abandoned_by = %holder, "reclaimed stale lock");
                    reaped.push(id);
                }
            }
            Ok(reaped)
        })
    }

    /// Resets a dead job for a fresh run: back to `pending` with zero
    /// attempts and all lock, deadline, and outcome fields cleared.
    ///
    /// Returns `None` when the row is missing or not `dead`.
    pub fn reset_for_retry(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StorageError> {
        let mut conn = self.conn()?;
        let now_s = encode_timestamp(now);

        conn.immediate_transaction(|conn| {
            let updated = diesel::update(
                jobs::table
                    .find(id)
                    .filter(jobs::state.eq(JobState::Dead.as_str())),
            )
            .set((
                jobs::state.eq(JobState::Pending.as_str()),
                jobs::attempts.eq(0),
                jobs::locked_by.eq(None::<String>),
                jobs::locked_at.eq(None::<String>),
                jobs::next_retry_at.eq(None::<String>),
                jobs::error.eq(None::<String>),
                jobs::output.eq(None::<String>),
                jobs::updated_at.eq(&now_s),
            ))
            .execute(conn)?;

            if updated == 0 {
                return Ok(None);
            }
            Self::load(conn, id)
        })
    }
}
