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

//! Shared test fixture: a file-backed SQLite job store in a temp
//! directory, migrated and ready, with fast polling intervals so the
//! integration suites don't crawl.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Once;
use std::time::Duration;

use diesel::prelude::*;
use tempfile::TempDir;

use queuectl::config::QueueConfigBuilder;
use queuectl::database::schema::jobs;
use queuectl::models::job::encode_timestamp;
use queuectl::{Database, JobQueue, QueueConfig};

static INIT: Once = Once::new();

pub struct TestFixture {
    dir: TempDir,
    pub database: Database,
    pub config: QueueConfig,
}

/// Builder pre-tuned for tests: tight poll interval, everything else at
/// the documented defaults.
pub fn fast_builder() -> QueueConfigBuilder {
    QueueConfig::builder().poll_interval(Duration::from_millis(25))
}

pub fn fixture() -> TestFixture {
    fixture_with(fast_builder())
}

/// Builds a fixture from a partially configured builder. The database
/// path is always redirected into a fresh temp directory.
pub fn fixture_with(builder: QueueConfigBuilder) -> TestFixture {
    INIT.call_once(|| queuectl::init_logging(None));

    let dir = TempDir::new().expect("create temp dir");
    let config = builder.db_path(dir.path().join("queuectl.db")).build();

    let database =
        Database::new(config.db_path(), config.db_pool_size()).expect("open test database");
    database.run_migrations().expect("migrate test database");

    TestFixture {
        dir,
        database,
        config,
    }
}

impl TestFixture {
    pub fn queue(&self) -> JobQueue {
        JobQueue::new(&self.database, self.config.clone())
    }

    /// Scratch directory for marker files used by test commands.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Rewinds a job's lock timestamp, simulating a worker that went
    /// quiet `age` ago.
    pub fn backdate_lock(&self, id: &str, age: Duration) {
        let stamp = encode_timestamp(
            chrono::Utc::now() - chrono::Duration::from_std(age).expect("lock age"),
        );
        let mut conn = self.database.pool().get().expect("pooled connection");
        diesel::update(jobs::table.find(id))
            .set(jobs::locked_at.eq(stamp))
            .execute(&mut conn)
            .expect("backdate lock");
    }

    /// Moves a job's retry deadline relative to now (negative = past).
    pub fn shift_retry_deadline(&self, id: &str, offset_secs: i64) {
        let stamp = encode_timestamp(chrono::Utc::now() + chrono::Duration::seconds(offset_secs));
        let mut conn = self.database.pool().get().expect("pooled connection");
        diesel::update(jobs::table.find(id))
            .set(jobs::next_retry_at.eq(stamp))
            .execute(&mut conn)
            .expect("shift retry deadline");
    }

    /// Plants lock fields on a row without changing its state, for
    /// exercising the eligibility predicate's stray-lock clause.
    pub fn plant_lock(&self, id: &str, holder: &str, age: Duration) {
        let stamp = encode_timestamp(
            chrono::Utc::now() - chrono::Duration::from_std(age).expect("lock age"),
        );
        let mut conn = self.database.pool().get().expect("pooled connection");
        diesel::update(jobs::table.find(id))
            .set((jobs::locked_by.eq(holder), jobs::locked_at.eq(stamp)))
            .execute(&mut conn)
            .expect("plant lock");
    }
}
