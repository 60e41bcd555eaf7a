// ABOUTME: MemoryStorage, a deterministic in-process Storage used by tests and the console demo.
// ABOUTME: Separates durable and pending state and can inject save failures on demand.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use tokio::sync::watch;

use crate::model::{Movie, MovieId};
use crate::query::QueryDescriptor;
use crate::storage::{Storage, StorageError};

#[derive(Default)]
struct Inner {
    durable: BTreeMap<MovieId, Movie>,
    live: BTreeMap<MovieId, Movie>,
    dirty: BTreeSet<MovieId>,
    failing_saves: usize,
}

/// In-memory Storage. Inserts and deletes are durable immediately; updates
/// stay pending until `save`.
pub struct MemoryStorage {
    inner: Mutex<Inner>,
    changes: watch::Sender<u64>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            inner: Mutex::new(Inner::default()),
            changes,
        }
    }

    /// Build a storage pre-populated with durable records.
    pub fn with_records(records: impl IntoIterator<Item = Movie>) -> Self {
        let storage = Self::new();
        {
            let mut inner = storage.lock();
            for movie in records {
                inner.durable.insert(movie.id, movie.clone());
                inner.live.insert(movie.id, movie);
            }
        }
        storage
    }

    /// Make the next `count` calls to `save` fail with an io error.
    pub fn fail_next_saves(&self, count: usize) {
        self.lock().failing_saves = count;
    }

    /// Records as they would survive a restart.
    pub fn durable(&self) -> Vec<Movie> {
        self.lock().durable.values().cloned().collect()
    }

    pub fn pending_count(&self) -> usize {
        self.lock().dirty.len()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn bump(&self) {
        self.changes.send_modify(|generation| *generation += 1);
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryStorage {
    fn fetch(&self, descriptor: &QueryDescriptor) -> Result<Vec<Movie>, StorageError> {
        let inner = self.lock();
        Ok(descriptor.evaluate(inner.live.values())?)
    }

    fn add(&self, movie: Movie) -> Result<MovieId, StorageError> {
        let id = movie.id;
        {
            let mut inner = self.lock();
            if inner.live.contains_key(&id) {
                return Err(StorageError::DuplicateId(id));
            }
            inner.durable.insert(id, movie.clone());
            inner.live.insert(id, movie);
        }
        self.bump();
        Ok(id)
    }

    fn delete(&self, id: MovieId) -> Result<(), StorageError> {
        {
            let mut inner = self.lock();
            if inner.live.remove(&id).is_none() {
                return Err(StorageError::NotFound(id));
            }
            inner.durable.remove(&id);
            inner.dirty.remove(&id);
        }
        self.bump();
        Ok(())
    }

    fn update(&self, id: MovieId, mutator: &dyn Fn(&mut Movie)) -> Result<Movie, StorageError> {
        let updated = {
            let mut inner = self.lock();
            let movie = inner.live.get_mut(&id).ok_or(StorageError::NotFound(id))?;
            mutator(movie);
            movie.id = id;
            let updated = movie.clone();
            inner.dirty.insert(id);
            updated
        };
        self.bump();
        Ok(updated)
    }

    fn save(&self) -> Result<(), StorageError> {
        let mut inner = self.lock();
        if inner.failing_saves > 0 {
            inner.failing_saves -= 1;
            return Err(StorageError::Io(Box::new(std::io::Error::other(
                "injected save failure",
            ))));
        }
        let dirty = std::mem::take(&mut inner.dirty);
        for id in dirty {
            if let Some(movie) = inner.live.get(&id).cloned() {
                inner.durable.insert(id, movie);
            }
        }
        Ok(())
    }

    fn changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }
}
