// ABOUTME: The effect runner: an actor task that applies the reducer and executes resulting effects.
// ABOUTME: Owns the live query for the current descriptor and feeds its deliveries back as intents.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::intent::{Effect, Intent};
use crate::live_query::LiveQuery;
use crate::model::{Movie, MovieId};
use crate::reducer::reduce;
use crate::state::AppState;
use crate::storage::{Storage, StorageError};

/// Errors returned to callers of the handle.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("runner channel closed")]
    ChannelClosed,
}

/// How the effect chain started by one dispatch ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    /// The target record was already gone; nothing changed.
    NotFound(MovieId),
    /// The effect failed after any retries; state was left as it was.
    Failed(String),
}

/// Notifications broadcast to observers of the runner.
#[derive(Debug, Clone)]
pub enum CatalogEvent {
    Transition {
        intent: &'static str,
        changed: bool,
    },
    EffectFailed {
        effect: Effect,
        error: String,
    },
    QueryFailed {
        error: String,
    },
}

/// Tunables for the runner.
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Extra attempts made when `save` fails with a transient error.
    pub save_retries: usize,
    pub intent_buffer: usize,
    pub event_buffer: usize,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            save_retries: 2,
            intent_buffer: 64,
            event_buffer: 256,
        }
    }
}

type IntentMessage = (Intent, oneshot::Sender<Outcome>);

/// Public handle for dispatching intents and observing state.
#[derive(Clone)]
pub struct CatalogHandle {
    intent_tx: mpsc::Sender<IntentMessage>,
    event_tx: broadcast::Sender<CatalogEvent>,
    state_rx: watch::Receiver<AppState>,
}

impl CatalogHandle {
    /// Send an intent and wait until its effect chain has finished.
    pub async fn dispatch(&self, intent: Intent) -> Result<Outcome, RunnerError> {
        let (tx, rx) = oneshot::channel();
        self.intent_tx
            .send((intent, tx))
            .await
            .map_err(|_| RunnerError::ChannelClosed)?;
        rx.await.map_err(|_| RunnerError::ChannelClosed)
    }

    /// Watch the state; every transition publishes a new snapshot.
    pub fn state(&self) -> watch::Receiver<AppState> {
        self.state_rx.clone()
    }

    /// Clone of the current state.
    pub fn read_state(&self) -> AppState {
        self.state_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CatalogEvent> {
        self.event_tx.subscribe()
    }
}

/// Spawn the runner task. It stops once every handle has been dropped.
pub fn spawn(
    storage: Arc<dyn Storage>,
    initial_state: AppState,
    options: RunnerOptions,
) -> CatalogHandle {
    let (intent_tx, intent_rx) = mpsc::channel::<IntentMessage>(options.intent_buffer);
    let (event_tx, _) = broadcast::channel::<CatalogEvent>(options.event_buffer);
    let live = LiveQuery::subscribe(Arc::clone(&storage), initial_state.descriptor());
    let (state_tx, state_rx) = watch::channel(initial_state);

    let handle = CatalogHandle {
        intent_tx,
        event_tx: event_tx.clone(),
        state_rx,
    };

    let runner = Runner {
        storage,
        live,
        intent_rx,
        state_tx,
        event_tx,
        options,
    };

    tokio::spawn(runner.run());

    handle
}

struct Runner {
    storage: Arc<dyn Storage>,
    live: LiveQuery,
    intent_rx: mpsc::Receiver<IntentMessage>,
    state_tx: watch::Sender<AppState>,
    event_tx: broadcast::Sender<CatalogEvent>,
    options: RunnerOptions,
}

impl Runner {
    async fn run(mut self) {
        tracing::debug!("catalog runner started");
        loop {
            tokio::select! {
                biased;

                msg = self.intent_rx.recv() => {
                    let Some((intent, reply_tx)) = msg else { break };
                    let outcome = self.process(intent);
                    // The caller may have stopped waiting.
                    let _ = reply_tx.send(outcome);
                }

                delivery = self.live.next() => match delivery {
                    Some(Ok(records)) => {
                        self.process(Intent::QueryResultChanged { records });
                    }
                    Some(Err(e)) => {
                        tracing::error!("live query evaluation failed: {}", e);
                        let _ = self.event_tx.send(CatalogEvent::QueryFailed {
                            error: e.to_string(),
                        });
                    }
                    None => {
                        tracing::warn!("storage closed its change feed; stopping runner");
                        break;
                    }
                },
            }
        }
        tracing::debug!("catalog runner stopped");
    }

    /// Run one intent and every follow-up intent its effects produce.
    fn process(&mut self, intent: Intent) -> Outcome {
        let mut next = Some(intent);
        let mut outcome = Outcome::Completed;

        while let Some(intent) = next.take() {
            let effect = self.transition(intent);
            let (result, follow_up) = self.execute(effect);
            if result != Outcome::Completed {
                outcome = result;
            }
            next = follow_up;
        }

        outcome
    }

    /// Apply the reducer, publish the new state, and retarget the live query
    /// when the descriptor moved.
    fn transition(&mut self, intent: Intent) -> Effect {
        let name = intent.name();
        let current = self.state_tx.borrow().clone();
        let (next, effect) = reduce(&current, intent);
        let changed = next != current;

        tracing::debug!(intent = name, changed, effect = ?effect, "applied intent");

        if changed {
            let descriptor = next.descriptor();
            if descriptor != current.descriptor() && self.live.set_descriptor(descriptor) {
                tracing::debug!("query descriptor changed, re-evaluating");
            }
            self.state_tx.send_replace(next);
        }

        let _ = self.event_tx.send(CatalogEvent::Transition {
            intent: name,
            changed,
        });

        effect
    }

    fn execute(&self, effect: Effect) -> (Outcome, Option<Intent>) {
        let result = match effect {
            Effect::None => Ok(None),

            Effect::InsertSample => {
                let movie = Movie::sample();
                tracing::info!("inserting sample movie {} ({})", movie.title, movie.id);
                self.storage.add(movie).map(|_| None)
            }

            Effect::Delete { id } => self.storage.delete(id).map(|_| None),

            Effect::ToggleFavorite { id } => self
                .storage
                .update(id, &|m: &mut Movie| m.favorite = !m.favorite)
                .and_then(|_| self.save_with_retry())
                .map(|_| None),

            Effect::Refresh => self
                .storage
                .fetch(&self.live.descriptor())
                .map(|records| Some(Intent::QueryResultChanged { records })),
        };

        match result {
            Ok(follow_up) => (Outcome::Completed, follow_up),
            Err(e) => (self.fail(effect, e), None),
        }
    }

    fn save_with_retry(&self) -> Result<(), StorageError> {
        let mut attempt = 0;
        loop {
            match self.storage.save() {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < self.options.save_retries => {
                    attempt += 1;
                    tracing::warn!("save failed (attempt {}), retrying: {}", attempt, e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn fail(&self, effect: Effect, error: StorageError) -> Outcome {
        match error {
            StorageError::NotFound(id) => {
                tracing::warn!("{:?} skipped: record {} no longer exists", effect, id);
                Outcome::NotFound(id)
            }
            other => {
                tracing::error!("{:?} failed: {}", effect, other);
                let message = other.to_string();
                let _ = self.event_tx.send(CatalogEvent::EffectFailed {
                    effect,
                    error: message.clone(),
                });
                Outcome::Failed(message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::memory::MemoryStorage;
    use crate::query::SortOrder;

    fn spawn_with(storage: Arc<MemoryStorage>) -> CatalogHandle {
        spawn(storage, AppState::new(), RunnerOptions::default())
    }

    async fn wait_for<F>(handle: &CatalogHandle, mut pred: F) -> AppState
    where
        F: FnMut(&AppState) -> bool,
    {
        let mut rx = handle.state();
        let state = tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| pred(s)))
            .await
            .expect("state should converge")
            .expect("runner alive")
            .clone();
        state
    }

    fn titles(state: &AppState) -> Vec<String> {
        state.entities.iter().map(|m| m.title.clone()).collect()
    }

    #[tokio::test]
    async fn initial_result_is_delivered_without_intents() {
        let storage = Arc::new(MemoryStorage::with_records([Movie::new("Heat", Vec::new())]));
        let handle = spawn_with(storage);

        let state = wait_for(&handle, |s| !s.entities.is_empty()).await;
        assert_eq!(titles(&state), vec!["Heat"]);
    }

    #[tokio::test]
    async fn add_inserts_and_live_query_updates_entities() {
        let storage = Arc::new(MemoryStorage::new());
        let handle = spawn_with(storage.clone());

        assert_eq!(handle.dispatch(Intent::Add).await.unwrap(), Outcome::Completed);
        assert_eq!(handle.dispatch(Intent::Add).await.unwrap(), Outcome::Completed);

        let state = wait_for(&handle, |s| s.entities.len() == 2).await;
        assert_eq!(storage.fetch_all().unwrap(), state.entities);
    }

    #[tokio::test]
    async fn delete_removes_record_from_entities() {
        let keep = Movie::new("Alien", Vec::new());
        let gone = Movie::new("Heat", Vec::new());
        let storage = Arc::new(MemoryStorage::with_records([keep.clone(), gone.clone()]));
        let handle = spawn_with(storage.clone());
        wait_for(&handle, |s| s.entities.len() == 2).await;

        let outcome = handle.dispatch(Intent::Delete { id: gone.id }).await.unwrap();
        assert_eq!(outcome, Outcome::Completed);

        let state = wait_for(&handle, |s| s.entities.len() == 1).await;
        assert_eq!(state.entities, vec![keep]);
    }

    #[tokio::test]
    async fn stale_delete_reports_not_found_without_state_change() {
        let movie = Movie::new("Heat", Vec::new());
        let storage = Arc::new(MemoryStorage::with_records([movie.clone()]));
        let handle = spawn_with(storage.clone());
        wait_for(&handle, |s| s.entities.len() == 1).await;

        // Another writer removes the record before the runner hears about it.
        storage.delete(movie.id).unwrap();
        let outcome = handle.dispatch(Intent::Delete { id: movie.id }).await;

        // Either the live query already emptied the list (reducer skips the
        // effect) or the store reports the record missing.
        match outcome.unwrap() {
            Outcome::Completed | Outcome::NotFound(_) => {}
            other => panic!("unexpected outcome {:?}", other),
        }
        let state = wait_for(&handle, |s| s.entities.is_empty()).await;
        assert!(state.entities.is_empty());
    }

    #[tokio::test]
    async fn favorite_toggles_and_persists() {
        let movie = Movie::new("Heat", Vec::new());
        let storage = Arc::new(MemoryStorage::with_records([movie.clone()]));
        let handle = spawn_with(storage.clone());
        wait_for(&handle, |s| s.entities.len() == 1).await;

        let outcome = handle.dispatch(Intent::Favorite { id: movie.id }).await.unwrap();
        assert_eq!(outcome, Outcome::Completed);

        wait_for(&handle, |s| s.entities[0].favorite).await;
        assert!(storage.durable()[0].favorite);
        assert_eq!(storage.pending_count(), 0);
    }

    #[tokio::test]
    async fn transient_save_failure_is_retried() {
        let movie = Movie::new("Heat", Vec::new());
        let storage = Arc::new(MemoryStorage::with_records([movie.clone()]));
        let handle = spawn_with(storage.clone());
        wait_for(&handle, |s| s.entities.len() == 1).await;

        storage.fail_next_saves(2);
        let outcome = handle.dispatch(Intent::Favorite { id: movie.id }).await.unwrap();
        assert_eq!(outcome, Outcome::Completed);
        assert!(storage.durable()[0].favorite);
    }

    #[tokio::test]
    async fn exhausted_save_retries_surface_failure() {
        let movie = Movie::new("Heat", Vec::new());
        let storage = Arc::new(MemoryStorage::with_records([movie.clone()]));
        let handle = spawn_with(storage.clone());
        wait_for(&handle, |s| s.entities.len() == 1).await;
        let mut events = handle.subscribe();

        storage.fail_next_saves(10);
        let outcome = handle.dispatch(Intent::Favorite { id: movie.id }).await.unwrap();
        assert!(matches!(outcome, Outcome::Failed(_)));
        assert!(!storage.durable()[0].favorite);
        assert_eq!(storage.pending_count(), 1);

        let mut saw_failure = false;
        while let Ok(event) = events.try_recv() {
            if let CatalogEvent::EffectFailed { effect, .. } = event {
                assert_eq!(effect, Effect::ToggleFavorite { id: movie.id });
                saw_failure = true;
            }
        }
        assert!(saw_failure);
    }

    #[tokio::test]
    async fn search_filters_then_restores_original_order() {
        let storage = Arc::new(MemoryStorage::with_records([
            Movie::new("Star Wars", Vec::new()),
            Movie::new("Alien", Vec::new()),
            Movie::new("Heat", Vec::new()),
        ]));
        let handle = spawn_with(storage);
        let before = wait_for(&handle, |s| s.entities.len() == 3).await;

        handle
            .dispatch(Intent::SearchStringChanged {
                search: "wars".to_string(),
            })
            .await
            .unwrap();
        let state = wait_for(&handle, |s| s.entities.len() == 1).await;
        assert_eq!(titles(&state), vec!["Star Wars"]);

        handle
            .dispatch(Intent::SearchStringChanged {
                search: "xyz".to_string(),
            })
            .await
            .unwrap();
        wait_for(&handle, |s| s.entities.is_empty()).await;

        handle
            .dispatch(Intent::SearchStringChanged {
                search: String::new(),
            })
            .await
            .unwrap();
        let after = wait_for(&handle, |s| s.entities.len() == 3).await;
        assert_eq!(after.entities, before.entities);
    }

    #[tokio::test]
    async fn sort_changes_reorder_entities() {
        let storage = Arc::new(MemoryStorage::with_records([
            Movie::new("Alien", Vec::new()),
            Movie::new("Heat", Vec::new()),
        ]));
        let handle = spawn_with(storage);
        wait_for(&handle, |s| s.entities.len() == 2).await;

        handle
            .dispatch(Intent::TitleSortChanged {
                order: Some(SortOrder::Reverse),
            })
            .await
            .unwrap();
        let state = wait_for(&handle, |s| s.entities[0].title == "Heat").await;
        assert_eq!(state.title_sort, Some(SortOrder::Reverse));

        handle.dispatch(Intent::ClearAllSorting).await.unwrap();
        wait_for(&handle, |s| s.entities[0].title == "Alien").await;
    }

    #[tokio::test]
    async fn appeared_refreshes_synchronously() {
        let storage = Arc::new(MemoryStorage::with_records([Movie::new("Heat", Vec::new())]));
        let handle = spawn_with(storage);

        let outcome = handle.dispatch(Intent::Appeared).await.unwrap();
        assert_eq!(outcome, Outcome::Completed);
        // The refresh's follow-up intent ran before dispatch returned.
        assert_eq!(titles(&handle.read_state()), vec!["Heat"]);
    }
}
