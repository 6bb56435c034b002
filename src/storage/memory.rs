use super::Storage;
use crate::error::StorageError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug)]
struct Activity {
    /// Milliseconds since the Unix epoch
    last_seen: AtomicI64,
    in_flight: AtomicUsize,
}

impl Activity {
    fn new() -> Self {
        Self {
            last_seen: AtomicI64::new(Utc::now().timestamp_millis()),
            in_flight: AtomicUsize::new(0),
        }
    }

    fn touch(&self) {
        self.last_seen
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }
}

/// Process-local routing table
///
/// Sharded maps keep routing reads, activity updates and mutations from the
/// orchestration layer off any process-wide lock.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    /// host -> (target -> idles)
    routes: DashMap<String, HashMap<String, bool>>,
    activity: DashMap<String, Arc<Activity>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// target -> whether every registration allows idling
    fn idle_eligibility(&self) -> HashMap<String, bool> {
        let mut eligible: HashMap<String, bool> = HashMap::new();
        for entry in self.routes.iter() {
            for (target, idles) in entry.value() {
                let e = eligible.entry(target.clone()).or_insert(true);
                *e = *e && *idles;
            }
        }
        eligible
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn target_add(&self, host: &str, target: &str, idles: bool) -> Result<(), StorageError> {
        self.routes
            .entry(host.to_string())
            .or_default()
            .insert(target.to_string(), idles);
        Ok(())
    }

    async fn target_remove(&self, host: &str, target: &str) -> Result<(), StorageError> {
        if let Entry::Occupied(mut entry) = self.routes.entry(host.to_string()) {
            entry.get_mut().remove(target);
            if entry.get().is_empty() {
                entry.remove();
            }
        }
        Ok(())
    }

    async fn target_list(&self, host: &str) -> Result<Vec<String>, StorageError> {
        let mut targets: Vec<String> = self
            .routes
            .get(host)
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default();
        targets.sort();
        Ok(targets)
    }

    async fn host_list(&self) -> Result<Vec<String>, StorageError> {
        let mut hosts: Vec<String> = self.routes.iter().map(|e| e.key().clone()).collect();
        hosts.sort();
        Ok(hosts)
    }

    async fn request_begin(&self, target: &str) -> Result<(), StorageError> {
        // Counted while the shard is held, so a concurrent prune in `stale`
        // cannot drop the record between lookup and increment
        let activity = self
            .activity
            .entry(target.to_string())
            .or_insert_with(|| Arc::new(Activity::new()));
        activity.in_flight.fetch_add(1, Ordering::AcqRel);
        activity.touch();
        Ok(())
    }

    async fn request_end(&self, target: &str) -> Result<(), StorageError> {
        let Some(activity) = self.activity.get(target).map(|a| Arc::clone(a.value())) else {
            return Ok(());
        };
        let _ = activity
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        activity.touch();
        Ok(())
    }

    async fn in_flight(&self, target: &str) -> Result<usize, StorageError> {
        Ok(self
            .activity
            .get(target)
            .map(|a| a.in_flight.load(Ordering::Acquire))
            .unwrap_or(0))
    }

    async fn stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, StorageError> {
        let eligible = self.idle_eligibility();
        let cutoff = cutoff.timestamp_millis();

        let mut stale = Vec::new();
        let mut orphaned = Vec::new();

        for entry in self.activity.iter() {
            let target = entry.key();
            let activity = entry.value();
            match eligible.get(target) {
                None => orphaned.push(target.clone()),
                Some(false) => {}
                Some(true) => {
                    if activity.in_flight.load(Ordering::Acquire) == 0
                        && activity.last_seen.load(Ordering::Relaxed) < cutoff
                    {
                        stale.push(target.clone());
                    }
                }
            }
        }

        for target in orphaned {
            let removed = self
                .activity
                .remove_if(&target, |_, a| a.in_flight.load(Ordering::Acquire) == 0);
            if removed.is_some() {
                debug!(backend = %target, "Dropped activity for unregistered target");
            }
        }

        stale.sort();
        Ok(stale)
    }
}
