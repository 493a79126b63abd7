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

//! Database connection management for the SQLite job store.
//!
//! Provides a pooled, thread-safe handle over a single on-disk database
//! shared by every worker process on the machine. Each checked-out
//! connection is tuned for multi-process access: WAL journaling lets
//! readers proceed alongside the single writer, and a busy timeout makes
//! concurrent claim transactions queue instead of failing immediately
//! with `SQLITE_BUSY`.

use std::path::{Path, PathBuf};

use diesel::connection::SimpleConnection;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool, PooledConnection};
use diesel::sqlite::SqliteConnection;
use tracing::info;

use crate::error::StorageError;

/// Type alias for a direct database connection.
pub type DbConnection = SqliteConnection;

/// Type alias for the connection pool.
pub type DbPool = Pool<ConnectionManager<SqliteConnection>>;

/// Type alias for a connection checked out of the pool.
pub type PooledConn = PooledConnection<ConnectionManager<SqliteConnection>>;

/// Per-connection SQLite tuning applied on every checkout.
#[derive(Debug, Clone, Copy)]
struct ConnectionTuning;

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for ConnectionTuning {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
        // The busy timeout must be in place before the WAL switch: on a
        // fresh database that switch itself needs the write lock.
        conn.batch_execute(
            "PRAGMA busy_timeout = 5000; \
             PRAGMA journal_mode = WAL; \
             PRAGMA synchronous = NORMAL; \
             PRAGMA foreign_keys = ON;",
        )
        .map_err(diesel::r2d2::Error::QueryError)
    }
}

/// A pool of connections to the durable job store.
///
/// `Database` is `Clone` and can be shared freely; clones reference the
/// same underlying pool.
#[derive(Clone)]
pub struct Database {
    pool: DbPool,
    path: PathBuf,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("path", &self.path).finish()
    }
}

impl Database {
    /// Opens the SQLite database at `path`, creating the parent
    /// directory if necessary.
    pub fn new(path: &Path, max_size: u32) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| StorageError::CreateDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        let manager = ConnectionManager::<SqliteConnection>::new(path.to_string_lossy());
        let pool = Pool::builder()
            .max_size(max_size)
            .connection_customizer(Box::new(ConnectionTuning))
            .build(manager)?;

        info!("SQLite connection pool initialized at {}", path.display());

        Ok(Self {
            pool,
            path: path.to_path_buf(),
        })
    }

    /// Returns a clone of the connection pool.
    pub fn pool(&self) -> DbPool {
        self.pool.clone()
    }

    /// Location of the underlying database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Applies pending schema migrations.
    ///
    /// Run once at startup before any queue or worker activity; a
    /// failure here means the store is unusable and the process should
    /// exit nonzero. The connection comes from the pool so it carries
    /// the busy-timeout tuning: workers starting concurrently against a
    /// fresh store queue behind the first migrator instead of failing
    /// with `SQLITE_BUSY`.
    pub fn run_migrations(&self) -> Result<(), StorageError> {
        let mut conn = self.pool.get()?;
        super::run_migrations(&mut conn)
    }
}
