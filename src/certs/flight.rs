//! Deduplicated background work keyed by hostname
//!
//! Each piece of work runs on its own task. A waiter that gives up (a TLS
//! handshake hitting its timeout) never cancels it, and later callers for the
//! same key join the run already in progress instead of starting another.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;

type Outcome<V> = Option<Result<V, String>>;

pub(crate) struct Flights<V> {
    pending: Arc<DashMap<String, watch::Receiver<Outcome<V>>>>,
}

impl<V: Clone + Send + Sync + 'static> Flights<V> {
    pub(crate) fn new() -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
        }
    }

    /// Join the run in progress for `key`, or spawn `work` as a new one
    ///
    /// `work` is dropped unpolled when a run is already in progress.
    pub(crate) fn join_or_spawn<F>(&self, key: &str, work: F) -> Flight<V>
    where
        F: Future<Output = Result<V, String>> + Send + 'static,
    {
        let tx = match self.pending.entry(key.to_string()) {
            Entry::Occupied(entry) => return Flight(entry.get().clone()),
            Entry::Vacant(entry) => {
                let (tx, rx) = watch::channel(None);
                entry.insert(rx);
                tx
            }
        };
        let rx = tx.subscribe();

        let pending = self.pending.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            let outcome = work.await;
            // Removed before publishing so a caller woken by the outcome never
            // joins this finished run
            pending.remove(&key);
            let _ = tx.send(Some(outcome));
        });

        Flight(rx)
    }

    pub(crate) fn is_pending(&self, key: &str) -> bool {
        self.pending.contains_key(key)
    }
}

/// Handle on one run; dropping it leaves the run going
pub(crate) struct Flight<V>(watch::Receiver<Outcome<V>>);

impl<V: Clone> Flight<V> {
    pub(crate) async fn outcome(mut self) -> Result<V, String> {
        let outcome = self
            .0
            .wait_for(Option::is_some)
            .await
            .map_err(|_| "background task ended without a result".to_string())?
            .clone();
        outcome.unwrap_or_else(|| Err("background task ended without a result".to_string()))
    }
}
