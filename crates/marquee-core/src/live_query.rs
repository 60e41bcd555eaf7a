// ABOUTME: LiveQuery, an explicit subscription that re-evaluates a descriptor when the store changes.
// ABOUTME: Coalesces bursts of mutations, drops superseded results, and suppresses identical snapshots.

use std::sync::Arc;

use futures::stream::{self, Stream};
use tokio::sync::watch;

use crate::model::Movie;
use crate::query::QueryDescriptor;
use crate::storage::{Storage, StorageError};

/// A subscription to the result set of one descriptor at a time.
///
/// `next` is cancel-safe: dropping its future before it resolves loses no
/// pending change, so it can sit in a `tokio::select!` next to other work.
pub struct LiveQuery {
    storage: Arc<dyn Storage>,
    descriptor_tx: watch::Sender<QueryDescriptor>,
    descriptor_rx: watch::Receiver<QueryDescriptor>,
    changes: watch::Receiver<u64>,
    last: Option<Vec<Movie>>,
    owes_initial: bool,
}

impl LiveQuery {
    /// Subscribe to `descriptor`. The first call to `next` evaluates
    /// immediately.
    pub fn subscribe(storage: Arc<dyn Storage>, descriptor: QueryDescriptor) -> Self {
        let (descriptor_tx, descriptor_rx) = watch::channel(descriptor);
        let mut changes = storage.changes();
        changes.borrow_and_update();
        Self {
            storage,
            descriptor_tx,
            descriptor_rx,
            changes,
            last: None,
            owes_initial: true,
        }
    }

    pub fn descriptor(&self) -> QueryDescriptor {
        self.descriptor_rx.borrow().clone()
    }

    /// Replace the descriptor. Returns false when it equals the current one.
    /// The next call to `next` evaluates the new descriptor.
    pub fn set_descriptor(&self, descriptor: QueryDescriptor) -> bool {
        self.descriptor_tx.send_if_modified(|current| {
            if *current == descriptor {
                false
            } else {
                *current = descriptor;
                true
            }
        })
    }

    /// The last snapshot handed out, if any.
    pub fn last(&self) -> Option<&[Movie]> {
        self.last.as_deref()
    }

    /// Wait for the next distinct snapshot. Returns `None` once the storage
    /// has gone away and no further change can arrive.
    ///
    /// The descriptor can only change through `set_descriptor`, which cannot
    /// run while this holds `&mut self`, and the fetch is synchronous. So a
    /// delivered snapshot always belongs to the current descriptor.
    pub async fn next(&mut self) -> Option<Result<Vec<Movie>, StorageError>> {
        loop {
            if self.owes_initial {
                self.owes_initial = false;
            } else {
                tokio::select! {
                    changed = self.changes.changed() => {
                        if changed.is_err() {
                            return None;
                        }
                    }
                    // The sender lives in self, so this never errors.
                    _ = self.descriptor_rx.changed() => {}
                }
            }

            // Everything up to this point is covered by the evaluation below.
            self.changes.borrow_and_update();
            let descriptor = self.descriptor_rx.borrow_and_update().clone();

            let records = match self.storage.fetch(&descriptor) {
                Ok(records) => records,
                Err(e) => return Some(Err(e)),
            };

            if self.last.as_ref() == Some(&records) {
                continue;
            }

            self.last = Some(records.clone());
            return Some(Ok(records));
        }
    }

    /// Turn the subscription into a stream of snapshots.
    pub fn into_stream(self) -> impl Stream<Item = Result<Vec<Movie>, StorageError>> {
        stream::unfold(self, |mut live| async move {
            let item = live.next().await?;
            Some((item, live))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use futures::StreamExt;

    use crate::memory::MemoryStorage;
    use crate::query::SortOrder;

    fn titles(movies: &[Movie]) -> Vec<&str> {
        movies.iter().map(|m| m.title.as_str()).collect()
    }

    async fn next_ok(live: &mut LiveQuery) -> Vec<Movie> {
        tokio::time::timeout(Duration::from_secs(2), live.next())
            .await
            .expect("live query should deliver")
            .expect("storage alive")
            .expect("query succeeds")
    }

    #[tokio::test]
    async fn delivers_initial_result() {
        let storage = Arc::new(MemoryStorage::with_records([Movie::new("Heat", Vec::new())]));
        let mut live = LiveQuery::subscribe(storage, QueryDescriptor::all());

        let first = next_ok(&mut live).await;
        assert_eq!(titles(&first), vec!["Heat"]);
        assert_eq!(live.last().map(|l| l.len()), Some(1));
    }

    #[tokio::test]
    async fn redelivers_after_any_writer_mutates() {
        let storage = Arc::new(MemoryStorage::new());
        let mut live = LiveQuery::subscribe(storage.clone(), QueryDescriptor::all());
        assert!(next_ok(&mut live).await.is_empty());

        storage.add(Movie::new("Heat", Vec::new())).unwrap();
        let result = next_ok(&mut live).await;
        assert_eq!(titles(&result), vec!["Heat"]);
    }

    #[tokio::test]
    async fn bursts_coalesce_into_latest_state() {
        let storage = Arc::new(MemoryStorage::new());
        let mut live = LiveQuery::subscribe(storage.clone(), QueryDescriptor::all());
        next_ok(&mut live).await;

        for title in ["A", "B", "C"] {
            storage.add(Movie::new(title, Vec::new())).unwrap();
        }
        let result = next_ok(&mut live).await;
        assert_eq!(titles(&result), vec!["A", "B", "C"]);

        // Nothing else is owed: the three mutations were one dirty window.
        let pending = tokio::time::timeout(Duration::from_millis(50), live.next()).await;
        assert!(pending.is_err());
    }

    #[tokio::test]
    async fn descriptor_change_reevaluates_immediately() {
        let storage = Arc::new(MemoryStorage::with_records([
            Movie::new("Star Wars", Vec::new()),
            Movie::new("Alien", Vec::new()),
        ]));
        let mut live = LiveQuery::subscribe(storage, QueryDescriptor::all());
        assert_eq!(next_ok(&mut live).await.len(), 2);

        assert!(live.set_descriptor(QueryDescriptor::from_view("wars", None, None)));
        assert_eq!(titles(&next_ok(&mut live).await), vec!["Star Wars"]);

        assert!(live.set_descriptor(QueryDescriptor::from_view(
            "",
            Some(SortOrder::Reverse),
            None
        )));
        assert_eq!(titles(&next_ok(&mut live).await), vec!["Star Wars", "Alien"]);
    }

    #[tokio::test]
    async fn equal_descriptor_is_not_a_change() {
        let storage = Arc::new(MemoryStorage::new());
        let live = LiveQuery::subscribe(storage, QueryDescriptor::all());
        assert!(!live.set_descriptor(QueryDescriptor::all()));
    }

    #[tokio::test]
    async fn unchanged_results_are_suppressed() {
        let storage = Arc::new(MemoryStorage::with_records([Movie::new("Heat", Vec::new())]));
        let mut live = LiveQuery::subscribe(
            storage.clone(),
            QueryDescriptor::from_view("heat", None, None),
        );
        next_ok(&mut live).await;

        // Mutation outside the filter leaves the result identical.
        storage.add(Movie::new("Alien", Vec::new())).unwrap();
        let pending = tokio::time::timeout(Duration::from_millis(50), live.next()).await;
        assert!(pending.is_err());
    }

    #[tokio::test]
    async fn pending_change_is_evaluated_against_latest_descriptor() {
        let storage = Arc::new(MemoryStorage::with_records([Movie::new("Alien", Vec::new())]));
        let mut live = LiveQuery::subscribe(storage.clone(), QueryDescriptor::all());
        next_ok(&mut live).await;

        // A store change and two descriptor changes pile up before the next poll.
        storage.add(Movie::new("Star Wars", Vec::new())).unwrap();
        live.set_descriptor(QueryDescriptor::from_view("alien", None, None));
        live.set_descriptor(QueryDescriptor::from_view("wars", None, None));

        assert_eq!(titles(&next_ok(&mut live).await), vec!["Star Wars"]);
        let pending = tokio::time::timeout(Duration::from_millis(50), live.next()).await;
        assert!(pending.is_err());
    }

    #[tokio::test]
    async fn concurrent_subscribers_each_see_every_writer() {
        let storage = Arc::new(MemoryStorage::new());
        let mut everything = LiveQuery::subscribe(storage.clone(), QueryDescriptor::all());
        let mut wars = LiveQuery::subscribe(
            storage.clone(),
            QueryDescriptor::from_view("wars", Some(SortOrder::Reverse), None),
        );
        next_ok(&mut everything).await;
        next_ok(&mut wars).await;

        let writer = {
            let storage = storage.clone();
            tokio::spawn(async move {
                for title in ["Star Wars", "Alien", "Wars of the Worlds"] {
                    storage.add(Movie::new(title, Vec::new())).unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };
        writer.await.unwrap();

        let mut seen_all = next_ok(&mut everything).await;
        while seen_all.len() < 3 {
            seen_all = next_ok(&mut everything).await;
        }
        let mut seen_wars = next_ok(&mut wars).await;
        while seen_wars.len() < 2 {
            seen_wars = next_ok(&mut wars).await;
        }

        assert_eq!(
            titles(&seen_all),
            vec!["Alien", "Star Wars", "Wars of the Worlds"]
        );
        assert_eq!(titles(&seen_wars), vec!["Wars of the Worlds", "Star Wars"]);
        assert_eq!(storage.fetch(&everything.descriptor()).unwrap(), seen_all);
        assert_eq!(storage.fetch(&wars.descriptor()).unwrap(), seen_wars);
    }

    #[tokio::test]
    async fn stream_yields_snapshots() {
        let storage = Arc::new(MemoryStorage::new());
        let live = LiveQuery::subscribe(storage.clone(), QueryDescriptor::all());
        let mut snapshots = Box::pin(live.into_stream());

        let first = snapshots.next().await.unwrap().unwrap();
        assert!(first.is_empty());

        storage.add(Movie::new("Heat", Vec::new())).unwrap();
        let second = snapshots.next().await.unwrap().unwrap();
        assert_eq!(second.len(), 1);
    }
}
