// ABOUTME: Persistence layer for marquee, storing the movie catalog in a versioned SQLite file.
// ABOUTME: Provides schema chains, the startup migration pipeline, and the RecordStore backend.

pub mod migrate;
pub mod record_store;
pub mod schema;

pub use migrate::{MigrationError, MigrationPhase, MigrationReport, Migrator, read_version};
pub use record_store::{RecordStore, StoreError};
pub use schema::{
    FieldDef, MigrationChainError, MigrationStage, Schema, SchemaChain, StageKind, Transform,
    TransformError, movie_schema_chain, movie_schema_v1, movie_schema_v2,
};
