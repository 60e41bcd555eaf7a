// ABOUTME: Defines AppState, the immutable snapshot the reducer replaces on every transition.
// ABOUTME: Holds the last delivered query result plus the view parameters the descriptor derives from.

use serde::{Deserialize, Serialize};

use crate::model::{Movie, MovieId};
use crate::query::{QueryDescriptor, SortOrder};

/// Application state for the catalog screen. `entities` always holds the
/// last result delivered for `descriptor()`; it is never filtered or sorted
/// locally.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppState {
    pub entities: Vec<Movie>,
    pub search_string: String,
    pub title_sort: Option<SortOrder>,
    pub id_sort: Option<SortOrder>,
}

impl AppState {
    pub fn new() -> Self {
        Self::default()
    }

    /// The query the live channel should be evaluating for this state.
    pub fn descriptor(&self) -> QueryDescriptor {
        QueryDescriptor::from_view(&self.search_string, self.title_sort, self.id_sort)
    }

    pub fn contains(&self, id: &MovieId) -> bool {
        self.entities.iter().any(|m| m.id == *id)
    }

    pub fn get(&self, id: &MovieId) -> Option<&Movie> {
        self.entities.iter().find(|m| m.id == *id)
    }
}
