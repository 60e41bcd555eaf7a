// ABOUTME: Defines the Movie record persisted by the catalog and its identifier type.
// ABOUTME: Records are plain values; mutation happens by id through the Storage capability.

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Stable identifier of a movie, assigned once at creation.
pub type MovieId = Ulid;

/// Titles the "Add" intent picks from when inserting a sample record.
pub const SAMPLE_TITLES: [&str; 4] = [
    "Star Wars",
    "Harry Potter",
    "Hunger Games",
    "Lord of the Rings",
];

/// Cast attached to every sample record.
pub const SAMPLE_CAST: [&str; 4] = [
    "Sam Worthington",
    "Zoe Saldaña",
    "Stephen Lang",
    "Michelle Rodriguez",
];

/// A single catalog entry at the latest schema version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Movie {
    pub id: MovieId,
    pub title: String,
    pub cast: Vec<String>,
    #[serde(default)]
    pub favorite: bool,
}

impl Movie {
    /// Create a new Movie with a freshly generated id. `favorite` starts false.
    pub fn new(title: impl Into<String>, cast: Vec<String>) -> Self {
        Self {
            id: Ulid::new(),
            title: title.into(),
            cast,
            favorite: false,
        }
    }

    /// Build a sample record. The title is chosen from the random bits of the
    /// freshly generated id so no extra entropy source is needed.
    pub fn sample() -> Self {
        let id = Ulid::new();
        let title = SAMPLE_TITLES[(id.random() % SAMPLE_TITLES.len() as u128) as usize];
        Self {
            id,
            title: title.to_string(),
            cast: SAMPLE_CAST.iter().map(|s| s.to_string()).collect(),
            favorite: false,
        }
    }
}
