// ABOUTME: Property tests for state/store convergence under random intent sequences.
// ABOUTME: Checks the runner's entities against the store and the durable set against a direct replay.

use std::sync::Arc;
use std::time::Duration;

use marquee_core::{
    AppState, CatalogHandle, Intent, MemoryStorage, Movie, MovieId, RunnerOptions, SortOrder,
    Storage,
};
use proptest::prelude::*;
use ulid::Ulid;

#[derive(Debug, Clone)]
enum Op {
    Add,
    Delete(usize),
    Favorite(usize),
    DeleteUnknown,
    Search(&'static str),
    TitleSort(Option<SortOrder>),
    IdSort(Option<SortOrder>),
    ClearSorting,
}

fn order_strategy() -> impl Strategy<Value = Option<SortOrder>> {
    prop_oneof![
        Just(None),
        Just(Some(SortOrder::Forward)),
        Just(Some(SortOrder::Reverse)),
    ]
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Add),
        2 => any::<usize>().prop_map(Op::Delete),
        2 => any::<usize>().prop_map(Op::Favorite),
        1 => Just(Op::DeleteUnknown),
        1 => prop::sample::select(vec!["", "star", "WARS", "games", "xyz"]).prop_map(Op::Search),
        1 => order_strategy().prop_map(Op::TitleSort),
        1 => order_strategy().prop_map(Op::IdSort),
        1 => Just(Op::ClearSorting),
    ]
}

/// Wait until the runner's entities equal what the store returns for the
/// current descriptor.
async fn converge(handle: &CatalogHandle, storage: &MemoryStorage) -> AppState {
    let mut rx = handle.state();
    let state = tokio::time::timeout(
        Duration::from_secs(2),
        rx.wait_for(|s| {
            storage
                .fetch(&s.descriptor())
                .is_ok_and(|records| records == s.entities)
        }),
    )
    .await
    .expect("state should converge with the store")
    .expect("runner alive")
    .clone();
    state
}

fn pick(state: &AppState, index: usize) -> Option<MovieId> {
    if state.entities.is_empty() {
        None
    } else {
        Some(state.entities[index % state.entities.len()].id)
    }
}

/// The record the runner inserted: present in `after` but not in `before`.
fn inserted(before: &[Movie], after: &[Movie]) -> Option<Movie> {
    after
        .iter()
        .find(|m| before.iter().all(|b| b.id != m.id))
        .cloned()
}

async fn run_ops(ops: Vec<Op>) -> Result<(), TestCaseError> {
    let storage = Arc::new(MemoryStorage::new());
    let replay = MemoryStorage::new();
    let handle = marquee_core::spawn(storage.clone(), AppState::new(), RunnerOptions::default());
    let mut state = converge(&handle, &storage).await;

    for op in ops {
        match op {
            Op::Add => {
                let before = storage.durable();
                handle.dispatch(Intent::Add).await.unwrap();
                let movie = inserted(&before, &storage.durable());
                prop_assert!(movie.is_some(), "add should insert one record");
                if let Some(movie) = movie {
                    replay.add(movie).unwrap();
                }
            }
            Op::Delete(index) => {
                if let Some(id) = pick(&state, index) {
                    handle.dispatch(Intent::Delete { id }).await.unwrap();
                    replay.delete(id).unwrap();
                }
            }
            Op::Favorite(index) => {
                if let Some(id) = pick(&state, index) {
                    handle.dispatch(Intent::Favorite { id }).await.unwrap();
                    replay.update(id, &|m| m.favorite = !m.favorite).unwrap();
                    replay.save().unwrap();
                }
            }
            Op::DeleteUnknown => {
                handle
                    .dispatch(Intent::Delete { id: Ulid::new() })
                    .await
                    .unwrap();
            }
            Op::Search(search) => {
                handle
                    .dispatch(Intent::SearchStringChanged {
                        search: search.to_string(),
                    })
                    .await
                    .unwrap();
            }
            Op::TitleSort(order) => {
                handle
                    .dispatch(Intent::TitleSortChanged { order })
                    .await
                    .unwrap();
            }
            Op::IdSort(order) => {
                handle.dispatch(Intent::IdSortChanged { order }).await.unwrap();
            }
            Op::ClearSorting => {
                handle.dispatch(Intent::ClearAllSorting).await.unwrap();
            }
        }

        state = converge(&handle, &storage).await;
        prop_assert_eq!(&state.entities, &storage.fetch(&state.descriptor()).unwrap());
        prop_assert_eq!(storage.durable(), replay.durable());
        prop_assert_eq!(storage.pending_count(), 0);
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn runner_converges_with_store(ops in prop::collection::vec(op_strategy(), 0 .. 24)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(run_ops(ops))?;
    }
}
