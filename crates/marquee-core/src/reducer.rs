// ABOUTME: The pure transition function mapping (AppState, Intent) to (AppState, Effect).
// ABOUTME: Performs no I/O; filtering and sorting are expressed only as descriptor changes.

use crate::intent::{Effect, Intent};
use crate::state::AppState;

/// Apply `intent` to `state`, returning the replacement state and the effect
/// the runner should execute. Total over every intent.
pub fn reduce(state: &AppState, intent: Intent) -> (AppState, Effect) {
    match intent {
        Intent::Appeared => (state.clone(), Effect::Refresh),

        Intent::QueryResultChanged { records } => (
            AppState {
                entities: records,
                ..state.clone()
            },
            Effect::None,
        ),

        Intent::Add => (state.clone(), Effect::InsertSample),

        Intent::Delete { id } => {
            let effect = if state.contains(&id) {
                Effect::Delete { id }
            } else {
                Effect::None
            };
            (state.clone(), effect)
        }

        Intent::Favorite { id } => {
            let effect = if state.contains(&id) {
                Effect::ToggleFavorite { id }
            } else {
                Effect::None
            };
            (state.clone(), effect)
        }

        Intent::SearchStringChanged { search } => {
            if search == state.search_string {
                return (state.clone(), Effect::None);
            }
            (
                AppState {
                    search_string: search,
                    ..state.clone()
                },
                Effect::None,
            )
        }

        Intent::TitleSortChanged { order } => (
            AppState {
                title_sort: order,
                ..state.clone()
            },
            Effect::None,
        ),

        Intent::IdSortChanged { order } => (
            AppState {
                id_sort: order,
                ..state.clone()
            },
            Effect::None,
        ),

        Intent::ClearAllSorting => (
            AppState {
                title_sort: None,
                id_sort: None,
                ..state.clone()
            },
            Effect::None,
        ),
    }
}
