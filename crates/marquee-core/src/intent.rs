// ABOUTME: Defines the Intent enum (inputs to the reducer) and the Effect enum it emits.
// ABOUTME: Effects are descriptions only; the runner decides how and when to execute them.

use serde::{Deserialize, Serialize};

use crate::model::{Movie, MovieId};
use crate::query::SortOrder;

/// A discrete request for a state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Intent {
    /// The screen became visible; fetch the current result set once.
    Appeared,
    QueryResultChanged { records: Vec<Movie> },
    Add,
    Delete { id: MovieId },
    Favorite { id: MovieId },
    SearchStringChanged { search: String },
    TitleSortChanged { order: Option<SortOrder> },
    IdSortChanged { order: Option<SortOrder> },
    ClearAllSorting,
}

impl Intent {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Intent::Appeared => "appeared",
            Intent::QueryResultChanged { .. } => "query_result_changed",
            Intent::Add => "add",
            Intent::Delete { .. } => "delete",
            Intent::Favorite { .. } => "favorite",
            Intent::SearchStringChanged { .. } => "search_string_changed",
            Intent::TitleSortChanged { .. } => "title_sort_changed",
            Intent::IdSortChanged { .. } => "id_sort_changed",
            Intent::ClearAllSorting => "clear_all_sorting",
        }
    }
}

/// A side effect requested by the reducer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Effect {
    None,
    /// Insert a sample record; the runner generates the id and payload.
    InsertSample,
    Delete { id: MovieId },
    /// Toggle `favorite` by id, then save durably.
    ToggleFavorite { id: MovieId },
    /// Fetch the current descriptor and feed the result back as an intent.
    Refresh,
}

impl Effect {
    pub fn is_none(&self) -> bool {
        matches!(self, Effect::None)
    }
}
