// ABOUTME: The Storage capability handed to the runner and live queries, plus its error type.
// ABOUTME: Includes NoopStorage, a stand-in that stores nothing, for previews and wiring tests.

use std::error::Error as StdError;

use thiserror::Error;
use tokio::sync::watch;

use crate::model::{Movie, MovieId};
use crate::query::{QueryDescriptor, QueryError};

/// Errors surfaced by any Storage implementation.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("record not found: {0}")]
    NotFound(MovieId),

    #[error("record already exists: {0}")]
    DuplicateId(MovieId),

    #[error("storage io error: {0}")]
    Io(#[source] Box<dyn StdError + Send + Sync>),

    #[error("invalid query: {0}")]
    Configuration(#[from] QueryError),

    /// A backend failure that retrying cannot fix, such as a corrupt record.
    #[error("storage backend error: {0}")]
    Backend(#[source] Box<dyn StdError + Send + Sync>),
}

impl StorageError {
    /// Whether retrying the same call could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Io(_))
    }
}

/// Persistence capability required by the effect runner and live queries.
///
/// Every successful mutation must bump the generation published by
/// `changes()` so subscribed live queries re-evaluate.
pub trait Storage: Send + Sync {
    fn fetch_all(&self) -> Result<Vec<Movie>, StorageError> {
        self.fetch(&QueryDescriptor::all())
    }

    fn fetch(&self, descriptor: &QueryDescriptor) -> Result<Vec<Movie>, StorageError>;

    fn add(&self, movie: Movie) -> Result<MovieId, StorageError>;

    fn delete(&self, id: MovieId) -> Result<(), StorageError>;

    /// Apply `mutator` to the record in place and mark it pending. Returns the
    /// updated value. The change is durable only after `save`.
    fn update(&self, id: MovieId, mutator: &dyn Fn(&mut Movie)) -> Result<Movie, StorageError>;

    fn save(&self) -> Result<(), StorageError>;

    /// Generation counter bumped on every successful mutation.
    fn changes(&self) -> watch::Receiver<u64>;
}

/// Storage that keeps nothing: fetches are empty, writes succeed.
pub struct NoopStorage {
    changes: watch::Sender<u64>,
}

impl NoopStorage {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self { changes }
    }
}

impl Default for NoopStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for NoopStorage {
    fn fetch(&self, descriptor: &QueryDescriptor) -> Result<Vec<Movie>, StorageError> {
        descriptor.validate()?;
        Ok(Vec::new())
    }

    fn add(&self, movie: Movie) -> Result<MovieId, StorageError> {
        Ok(movie.id)
    }

    fn delete(&self, _id: MovieId) -> Result<(), StorageError> {
        Ok(())
    }

    fn update(&self, id: MovieId, _mutator: &dyn Fn(&mut Movie)) -> Result<Movie, StorageError> {
        Err(StorageError::NotFound(id))
    }

    fn save(&self) -> Result<(), StorageError> {
        Ok(())
    }

    fn changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }
}
