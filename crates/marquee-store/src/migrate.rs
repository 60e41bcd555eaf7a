// ABOUTME: Migration pipeline that walks a store file forward through the declared schema chain.
// ABOUTME: Each stage commits atomically with its version tag; a failing stage leaves the prior version.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use thiserror::Error;

use crate::schema::{MigrationChainError, SchemaChain};

const VERSION_KEY: &str = "schema_version";

/// Errors that abort opening a store. All of them are fatal.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("schema chain error: {0}")]
    Chain(#[from] MigrationChainError),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("version tag is corrupt: {0:?}")]
    CorruptVersionTag(String),

    #[error("store holds {rows} records but no version tag")]
    MissingVersionTag { rows: usize },

    #[error("stage v{from} -> v{to} failed on record {record_id}: {reason}")]
    StageFailed {
        from: u32,
        to: u32,
        record_id: String,
        reason: String,
    },
}

/// Where the pipeline is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationPhase {
    Unopened,
    /// Running stage `stage` (1-based) of `of`.
    Migrating { stage: usize, of: usize },
    Open,
    Failed,
}

/// What `run` found and did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    /// Version tag found on disk; `None` for a fresh file.
    pub found_version: Option<u32>,
    pub current_version: u32,
    pub stages_applied: usize,
    pub records_migrated: usize,
}

/// Drives one store file through the pending stages of a chain.
pub struct Migrator<'a> {
    chain: &'a SchemaChain,
    phase: MigrationPhase,
}

impl<'a> Migrator<'a> {
    pub fn new(chain: &'a SchemaChain) -> Self {
        Self {
            chain,
            phase: MigrationPhase::Unopened,
        }
    }

    pub fn phase(&self) -> MigrationPhase {
        self.phase
    }

    /// Bring the file behind `conn` to the latest declared version. Expects
    /// the movies, meta and migrations tables to exist.
    pub fn run(&mut self, conn: &mut Connection) -> Result<MigrationReport, MigrationError> {
        match self.run_inner(conn) {
            Ok(report) => {
                self.phase = MigrationPhase::Open;
                Ok(report)
            }
            Err(e) => {
                self.phase = MigrationPhase::Failed;
                tracing::error!("schema migration failed: {}", e);
                Err(e)
            }
        }
    }

    fn run_inner(&mut self, conn: &mut Connection) -> Result<MigrationReport, MigrationError> {
        let chain = self.chain;
        let latest = chain.latest().version;
        let found = read_version(conn)?;

        let Some(found) = found else {
            let rows: i64 = conn.query_row("SELECT COUNT(*) FROM movies", [], |row| row.get(0))?;
            if rows > 0 {
                return Err(MigrationError::MissingVersionTag {
                    rows: rows as usize,
                });
            }
            write_version(conn, latest)?;
            tracing::info!("initialized fresh store at schema v{}", latest);
            return Ok(MigrationReport {
                found_version: None,
                current_version: latest,
                stages_applied: 0,
                records_migrated: 0,
            });
        };

        let stages = chain.pending_stages(found)?;
        if stages.is_empty() {
            tracing::debug!("store already at schema v{}", found);
            return Ok(MigrationReport {
                found_version: Some(found),
                current_version: found,
                stages_applied: 0,
                records_migrated: 0,
            });
        }

        let total = stages.len();
        let mut records_migrated = 0;
        for (i, stage) in stages.iter().enumerate() {
            self.phase = MigrationPhase::Migrating {
                stage: i + 1,
                of: total,
            };
            let target = chain
                .schema(stage.to)
                .ok_or(MigrationChainError::UnknownVersion(stage.to))?;

            let tx = conn.transaction()?;
            let rows: Vec<(String, String)> = {
                let mut stmt = tx.prepare("SELECT id, body FROM movies ORDER BY id")?;
                let mapped = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
                mapped.collect::<Result<_, _>>()?
            };

            for (id, body) in &rows {
                let failed = |reason: String| MigrationError::StageFailed {
                    from: stage.from,
                    to: stage.to,
                    record_id: id.clone(),
                    reason,
                };
                let record: Value = serde_json::from_str(body).map_err(|e| failed(e.to_string()))?;
                let migrated = stage.apply(record, target).map_err(failed)?;
                let body = serde_json::to_string(&migrated).map_err(|e| failed(e.to_string()))?;
                tx.execute(
                    "UPDATE movies SET body = ?1 WHERE id = ?2",
                    params![body, id],
                )?;
            }

            write_version(&tx, stage.to)?;
            tx.execute(
                "INSERT INTO migrations (from_version, to_version, kind, records, applied_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    stage.from,
                    stage.to,
                    stage.kind.label(),
                    rows.len() as i64,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            // Dropping an uncommitted transaction rolls it back, so any early
            // return above leaves the previous version in place.
            tx.commit()?;

            records_migrated += rows.len();
            tracing::info!(
                "migrated {} records from schema v{} to v{} ({})",
                rows.len(),
                stage.from,
                stage.to,
                stage.kind.label()
            );
        }

        Ok(MigrationReport {
            found_version: Some(found),
            current_version: latest,
            stages_applied: total,
            records_migrated,
        })
    }
}

/// Read the version tag, `None` when absent.
pub fn read_version(conn: &Connection) -> Result<Option<u32>, MigrationError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = ?1",
            params![VERSION_KEY],
            |row| row.get(0),
        )
        .optional()?;

    match raw {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u32>()
            .map(Some)
            .map_err(|_| MigrationError::CorruptVersionTag(raw)),
    }
}

fn write_version(conn: &Connection, version: u32) -> Result<(), MigrationError> {
    conn.execute(
        "INSERT INTO meta (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![VERSION_KEY, version.to_string()],
    )?;
    Ok(())
}
