//! Repository registry.
//!
//! Persists the set of known source repositories and which one is active.
//! Backed by a single `SQLite` file under `DB_DIR/DB_NAME`; every mutator
//! preserves the invariant that at most one row has `active = 1`.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::config::Config;

/// A registered source repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
    /// Generated unique id.
    pub id: String,

    /// URL-like flake reference, unique across the registry.
    pub url: String,

    /// Whether this is the active repository.
    pub active: bool,

    /// Row creation time.
    pub created_at: DateTime<Utc>,

    /// Last mutation time, maintained by an update trigger.
    pub updated_at: DateTime<Utc>,
}

/// Registry errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The database file or its directory could not be created.
    #[error("failed to open database at {path}")]
    Open {
        /// Path that failed to open.
        path: String,
        /// Underlying error.
        #[source]
        source: Box<RegistryError>,
    },

    /// A repository lookup came up empty.
    #[error("repository '{0}' not found")]
    NotFound(String),

    /// Underlying database error.
    #[error("database error")]
    Sql(#[from] rusqlite::Error),

    /// Database directory could not be created.
    #[error("failed to create database directory")]
    CreateDir(#[from] std::io::Error),
}

/// `SQLite`-backed repository registry.
///
/// The connection is serialized behind a mutex; all operations are short
/// synchronous transactions.
pub struct RepoRegistry {
    conn: Mutex<Connection>,
}

impl RepoRegistry {
    /// Open (creating if needed) the registry at the configured
    /// `DB_DIR/DB_NAME` path.
    pub fn open(config: &Config) -> Result<Self, RegistryError> {
        std::fs::create_dir_all(&config.db_dir)?;
        Self::open_at(&config.db_path())
    }

    /// Open a registry at an explicit path.
    pub fn open_at(path: &Path) -> Result<Self, RegistryError> {
        let conn = Connection::open(path).map_err(|e| RegistryError::Open {
            path: path.display().to_string(),
            source: Box::new(RegistryError::Sql(e)),
        })?;
        Self::from_connection(conn)
    }

    /// In-memory registry for tests.
    pub fn in_memory() -> Result<Self, RegistryError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, RegistryError> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Register `url`, making it the active repository.
    ///
    /// Idempotent on URL: adding an existing URL re-activates it without
    /// duplicating the row.
    pub fn add(&self, url: &str) -> Result<Repository, RegistryError> {
        let mut conn = self.conn.lock().expect("registry lock poisoned");
        let tx = conn.transaction()?;

        let existing = tx
            .query_row(
                "SELECT id, url, active, created_at, updated_at
                 FROM repositories WHERE url = ?1",
                params![url],
                row_to_repository,
            )
            .optional()?;

        let id = if let Some(repo) = existing {
            tx.execute(
                "UPDATE repositories SET active = CASE WHEN url = ?1 THEN 1 ELSE 0 END",
                params![url],
            )?;
            repo.id
        } else {
            let id = Uuid::new_v4().to_string();
            tx.execute("UPDATE repositories SET active = 0", [])?;
            tx.execute(
                "INSERT INTO repositories (id, url, active) VALUES (?1, ?2, 1)",
                params![id, url],
            )?;
            id
        };

        let repo = tx.query_row(
            "SELECT id, url, active, created_at, updated_at
             FROM repositories WHERE id = ?1",
            params![id],
            row_to_repository,
        )?;
        tx.commit()?;

        tracing::info!(url, id = %repo.id, "repository registered");
        Ok(repo)
    }

    /// Delete a repository by id. Removing the active repository leaves the
    /// registry with no active row.
    pub fn remove(&self, id: &str) -> Result<(), RegistryError> {
        let conn = self.conn.lock().expect("registry lock poisoned");
        let affected = conn.execute("DELETE FROM repositories WHERE id = ?1", params![id])?;
        if affected == 0 {
            return Err(RegistryError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// All repositories, newest first.
    pub fn list(&self) -> Result<Vec<Repository>, RegistryError> {
        let conn = self.conn.lock().expect("registry lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, url, active, created_at, updated_at
             FROM repositories ORDER BY created_at DESC, id",
        )?;
        let repos = stmt
            .query_map([], row_to_repository)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(repos)
    }

    /// The active repository, if one is set.
    pub fn get_active(&self) -> Result<Option<Repository>, RegistryError> {
        let conn = self.conn.lock().expect("registry lock poisoned");
        let repo = conn
            .query_row(
                "SELECT id, url, active, created_at, updated_at
                 FROM repositories WHERE active = 1 LIMIT 1",
                [],
                row_to_repository,
            )
            .optional()?;
        Ok(repo)
    }

    /// Make `url` the active repository.
    ///
    /// Atomic: clearing `active` on every row and setting it on the target
    /// happens in one transaction. Fails with [`RegistryError::NotFound`] if
    /// the URL is not registered.
    pub fn set_active(&self, url: &str) -> Result<(), RegistryError> {
        let mut conn = self.conn.lock().expect("registry lock poisoned");
        let tx = conn.transaction()?;

        tx.execute("UPDATE repositories SET active = 0", [])?;
        let affected = tx.execute(
            "UPDATE repositories SET active = 1 WHERE url = ?1",
            params![url],
        )?;
        if affected == 0 {
            return Err(RegistryError::NotFound(url.to_string()));
        }
        tx.commit()?;
        Ok(())
    }
}

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS repositories (
            id TEXT PRIMARY KEY,
            url TEXT NOT NULL UNIQUE,
            active BOOLEAN DEFAULT 0,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;
    conn.execute(
        "CREATE TRIGGER IF NOT EXISTS update_repos_timestamp
         AFTER UPDATE ON repositories
         BEGIN
             UPDATE repositories SET updated_at = CURRENT_TIMESTAMP
             WHERE id = NEW.id;
         END",
        [],
    )?;
    Ok(())
}

fn row_to_repository(row: &Row<'_>) -> rusqlite::Result<Repository> {
    Ok(Repository {
        id: row.get(0)?,
        url: row.get(1)?,
        active: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
    })
}
