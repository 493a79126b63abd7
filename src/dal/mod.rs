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

//! Data Access Layer
//!
//! The DAL owns every SQL statement in the crate. Callers above it work
//! with domain types; row encoding and the transactional boundaries of
//! the claim and conditional-update primitives live here.

use diesel::r2d2::{ConnectionManager, Pool};
use diesel::sqlite::SqliteConnection;

pub mod job;

pub use job::{JobCounts, JobDAL};

/// The main data access layer handle.
#[derive(Clone)]
pub struct DAL {
    /// A connection pool for the SQLite job store.
    pub pool: Pool<ConnectionManager<SqliteConnection>>,
}

impl DAL {
    /// Creates a new DAL instance over the provided connection pool.
    pub fn new(pool: Pool<ConnectionManager<SqliteConnection>>) -> Self {
        DAL { pool }
    }

    /// Returns a JobDAL instance for job-row operations.
    pub fn jobs(&self) -> JobDAL<'_> {
        JobDAL { dal: self }
    }
}
