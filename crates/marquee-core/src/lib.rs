// ABOUTME: Core library for marquee: the movie model, query descriptors, reducer, and effect runner.
// ABOUTME: Persistence is reached only through the Storage trait so any backend can be substituted.

pub mod intent;
pub mod live_query;
pub mod memory;
pub mod model;
pub mod query;
pub mod reducer;
pub mod runner;
pub mod state;
pub mod storage;

pub use intent::{Effect, Intent};
pub use live_query::LiveQuery;
pub use memory::MemoryStorage;
pub use model::{Movie, MovieId};
pub use query::{Predicate, QueryDescriptor, QueryError, SortField, SortKey, SortOrder};
pub use reducer::reduce;
pub use runner::{CatalogEvent, CatalogHandle, Outcome, RunnerError, RunnerOptions, spawn};
pub use state::AppState;
pub use storage::{NoopStorage, Storage, StorageError};
