// ABOUTME: SQLite-backed record store holding movies as JSON bodies behind a versioned schema.
// ABOUTME: Serializes writers, serves consistent in-memory reads, and publishes a change generation.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use marquee_core::{Movie, MovieId, QueryDescriptor, QueryError, Storage, StorageError};
use rusqlite::{Connection, params};
use thiserror::Error;
use tokio::sync::watch;
use ulid::Ulid;

use crate::migrate::{MigrationError, MigrationReport, Migrator};
use crate::schema::SchemaChain;

/// Errors that can occur during record store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(MovieId),

    #[error("record already exists: {0}")]
    DuplicateId(MovieId),

    #[error("store already open in this process: {}", .0.display())]
    AlreadyOpen(PathBuf),

    #[error("record {id} is corrupt: {reason}")]
    CorruptRecord { id: String, reason: String },

    #[error("invalid query: {0}")]
    Query(#[from] QueryError),

    #[error("migration error: {0}")]
    Migration(#[from] MigrationError),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl From<StoreError> for StorageError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => StorageError::NotFound(id),
            StoreError::DuplicateId(id) => StorageError::DuplicateId(id),
            StoreError::Query(q) => StorageError::Configuration(q),
            e @ (StoreError::Sqlite(_) | StoreError::Io(_)) => StorageError::Io(Box::new(e)),
            other => StorageError::Backend(Box::new(other)),
        }
    }
}

/// Canonical paths of every store currently open in this process.
static OPEN_STORES: LazyLock<Mutex<HashSet<PathBuf>>> =
    LazyLock::new(|| Mutex::new(HashSet::new()));

/// Registration of a path in `OPEN_STORES`, released on drop.
#[derive(Debug)]
struct PathClaim(PathBuf);

impl PathClaim {
    fn acquire(path: PathBuf) -> Result<Self, StoreError> {
        let mut open = OPEN_STORES.lock().unwrap_or_else(|p| p.into_inner());
        if !open.insert(path.clone()) {
            return Err(StoreError::AlreadyOpen(path));
        }
        Ok(Self(path))
    }
}

impl Drop for PathClaim {
    fn drop(&mut self) {
        let mut open = OPEN_STORES.lock().unwrap_or_else(|p| p.into_inner());
        open.remove(&self.0);
    }
}

/// Create the tables a store file needs. Safe to run on an existing file.
pub(crate) fn create_tables(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS movies (
            id TEXT PRIMARY KEY,
            body TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS migrations (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            from_version INTEGER NOT NULL,
            to_version INTEGER NOT NULL,
            kind TEXT NOT NULL,
            records INTEGER NOT NULL,
            applied_at TEXT NOT NULL
        );",
    )
}

#[derive(Debug, Default)]
struct Records {
    rows: BTreeMap<MovieId, Movie>,
    /// Ids changed by `update` and not yet saved.
    dirty: BTreeSet<MovieId>,
}

/// The catalog's durable record store.
///
/// Inserts and deletes are written through before they become visible.
/// Updates are visible at once but only durable after `save`. All writers
/// queue on the connection mutex; readers only touch the in-memory view and
/// never observe half of a write.
#[derive(Debug)]
pub struct RecordStore {
    claim: PathClaim,
    conn: Mutex<Connection>,
    records: RwLock<Records>,
    changes: watch::Sender<u64>,
    report: MigrationReport,
}

impl RecordStore {
    /// Open (or create) the store at `path`, migrating it to the latest
    /// version of `chain`. A path may be open only once per process.
    pub fn open(path: &Path, chain: &SchemaChain) -> Result<Self, StoreError> {
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        fs::create_dir_all(parent)?;
        let file_name = path.file_name().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "store path has no file name")
        })?;
        let canonical = fs::canonicalize(parent)?.join(file_name);

        let claim = PathClaim::acquire(canonical)?;

        let mut conn = Connection::open(&claim.0)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        create_tables(&conn)?;

        let report = Migrator::new(chain).run(&mut conn)?;
        let rows = load_rows(&conn)?;

        tracing::info!(
            "opened record store {} at schema v{} with {} records",
            claim.0.display(),
            report.current_version,
            rows.len()
        );

        let (changes, _) = watch::channel(0);
        Ok(Self {
            claim,
            conn: Mutex::new(conn),
            records: RwLock::new(Records {
                rows,
                dirty: BTreeSet::new(),
            }),
            changes,
            report,
        })
    }

    pub fn path(&self) -> &Path {
        &self.claim.0
    }

    pub fn schema_version(&self) -> u32 {
        self.report.current_version
    }

    /// What the migration pipeline did while opening.
    pub fn migration_report(&self) -> &MigrationReport {
        &self.report
    }

    pub fn len(&self) -> usize {
        self.read().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().rows.is_empty()
    }

    /// Number of updated records not yet saved.
    pub fn pending_count(&self) -> usize {
        self.read().dirty.len()
    }

    /// Insert a new record durably.
    pub fn insert(&self, movie: Movie) -> Result<MovieId, StoreError> {
        let conn = self.writer();
        let id = movie.id;
        if self.read().rows.contains_key(&id) {
            return Err(StoreError::DuplicateId(id));
        }

        let body = serde_json::to_string(&movie)?;
        conn.execute(
            "INSERT INTO movies (id, body) VALUES (?1, ?2)",
            params![id.to_string(), body],
        )?;
        self.write().rows.insert(id, movie);
        drop(conn);

        self.bump();
        Ok(id)
    }

    /// Delete a record durably. Missing ids report `NotFound`.
    pub fn delete(&self, id: MovieId) -> Result<(), StoreError> {
        let conn = self.writer();
        if !self.read().rows.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }

        conn.execute("DELETE FROM movies WHERE id = ?1", params![id.to_string()])?;
        {
            let mut records = self.write();
            records.rows.remove(&id);
            records.dirty.remove(&id);
        }
        drop(conn);

        self.bump();
        Ok(())
    }

    /// Apply `mutator` to a record and mark it pending. The id cannot be
    /// changed this way.
    pub fn update<F>(&self, id: MovieId, mutator: F) -> Result<Movie, StoreError>
    where
        F: FnOnce(&mut Movie),
    {
        let conn = self.writer();
        let mut next = self
            .read()
            .rows
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))?;
        mutator(&mut next);
        next.id = id;

        {
            let mut records = self.write();
            records.rows.insert(id, next.clone());
            records.dirty.insert(id);
        }
        drop(conn);

        self.bump();
        Ok(next)
    }

    /// Evaluate a descriptor over committed and pending state.
    pub fn query(&self, descriptor: &QueryDescriptor) -> Result<Vec<Movie>, StoreError> {
        let records = self.read();
        Ok(descriptor.evaluate(records.rows.values())?)
    }

    /// Flush pending updates in one transaction. On failure nothing is marked
    /// clean, so the call can be retried.
    pub fn save(&self) -> Result<(), StoreError> {
        let mut conn = self.writer();
        let pending: Vec<Movie> = {
            let records = self.read();
            records
                .dirty
                .iter()
                .filter_map(|id| records.rows.get(id).cloned())
                .collect()
        };
        if pending.is_empty() {
            return Ok(());
        }

        let tx = conn.transaction()?;
        for movie in &pending {
            let body = serde_json::to_string(movie)?;
            tx.execute(
                "UPDATE movies SET body = ?1 WHERE id = ?2",
                params![body, movie.id.to_string()],
            )?;
        }
        tx.commit()?;

        let mut records = self.write();
        for movie in &pending {
            records.dirty.remove(&movie.id);
        }
        tracing::debug!("saved {} pending records", pending.len());
        Ok(())
    }

    pub fn changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn bump(&self) {
        self.changes.send_modify(|generation| *generation += 1);
    }

    fn writer(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn read(&self) -> RwLockReadGuard<'_, Records> {
        self.records.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Records> {
        self.records.write().unwrap_or_else(|p| p.into_inner())
    }

    /// Switch the connection to read-only so every write fails.
    #[cfg(test)]
    fn set_read_only(&self, on: bool) {
        let pragma = if on {
            "PRAGMA query_only = ON;"
        } else {
            "PRAGMA query_only = OFF;"
        };
        self.writer().execute_batch(pragma).unwrap();
    }
}

fn load_rows(conn: &Connection) -> Result<BTreeMap<MovieId, Movie>, StoreError> {
    let mut stmt = conn.prepare("SELECT id, body FROM movies")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;

    let mut out = BTreeMap::new();
    for row in rows {
        let (raw_id, body) = row?;
        let id = Ulid::from_string(&raw_id).map_err(|e| StoreError::CorruptRecord {
            id: raw_id.clone(),
            reason: e.to_string(),
        })?;
        let movie: Movie = serde_json::from_str(&body).map_err(|e| StoreError::CorruptRecord {
            id: raw_id.clone(),
            reason: e.to_string(),
        })?;
        if movie.id != id {
            return Err(StoreError::CorruptRecord {
                id: raw_id,
                reason: format!("body carries id {}", movie.id),
            });
        }
        out.insert(id, movie);
    }
    Ok(out)
}

impl Storage for RecordStore {
    fn fetch(&self, descriptor: &QueryDescriptor) -> Result<Vec<Movie>, StorageError> {
        Ok(self.query(descriptor)?)
    }

    fn add(&self, movie: Movie) -> Result<MovieId, StorageError> {
        Ok(self.insert(movie)?)
    }

    fn delete(&self, id: MovieId) -> Result<(), StorageError> {
        Ok(RecordStore::delete(self, id)?)
    }

    fn update(&self, id: MovieId, mutator: &dyn Fn(&mut Movie)) -> Result<Movie, StorageError> {
        Ok(RecordStore::update(self, id, mutator)?)
    }

    fn save(&self) -> Result<(), StorageError> {
        Ok(RecordStore::save(self)?)
    }

    fn changes(&self) -> watch::Receiver<u64> {
        RecordStore::changes(self)
    }
}
