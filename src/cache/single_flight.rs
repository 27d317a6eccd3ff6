//! Per-key load coalescing
//!
//! The first caller for a key becomes the leader and runs the load; callers
//! arriving while it is in flight subscribe to the leader's result. If the
//! leader is dropped before completing (its task was cancelled), followers
//! wake with no result and race to become the next leader.

use super::errors::CacheResult;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

type Outcome<T> = Option<CacheResult<T>>;

#[derive(Debug)]
struct Flight<T> {
    result: watch::Sender<Outcome<T>>,
    invalidated: AtomicBool,
}

#[derive(Debug)]
pub(crate) struct SingleFlight<T> {
    flights: DashMap<String, Arc<Flight<T>>>,
}

pub(crate) enum Role<'a, T: Clone> {
    Leader(FlightGuard<'a, T>),
    Follower(watch::Receiver<Outcome<T>>),
}

impl<T: Clone> SingleFlight<T> {
    pub(crate) fn new() -> Self {
        Self {
            flights: DashMap::new(),
        }
    }

    pub(crate) fn join(&self, key: &str) -> Role<'_, T> {
        match self.flights.entry(key.to_string()) {
            Entry::Occupied(occupied) => Role::Follower(occupied.get().result.subscribe()),
            Entry::Vacant(vacant) => {
                let (result, _) = watch::channel(None);
                let flight = Arc::new(Flight {
                    result,
                    invalidated: AtomicBool::new(false),
                });
                vacant.insert(Arc::clone(&flight));
                Role::Leader(FlightGuard {
                    owner: self,
                    key: key.to_string(),
                    flight,
                    completed: false,
                })
            }
        }
    }

    /// Wait for the leader; `None` means it went away without a result
    pub(crate) async fn wait(mut receiver: watch::Receiver<Outcome<T>>) -> Option<CacheResult<T>> {
        match receiver.wait_for(|outcome| outcome.is_some()).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        }
    }

    /// Flag the in-flight load for `key` as stale
    pub(crate) fn mark_invalidated(&self, key: &str) {
        if let Some(flight) = self.flights.get(key) {
            flight.invalidated.store(true, Ordering::SeqCst);
        }
    }

    pub(crate) fn mark_invalidated_prefix(&self, prefix: &str) {
        for flight in self.flights.iter() {
            if flight.key().starts_with(prefix) {
                flight.invalidated.store(true, Ordering::SeqCst);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> usize {
        self.flights.len()
    }

    fn remove(&self, key: &str, flight: &Arc<Flight<T>>) {
        self.flights
            .remove_if(key, |_, current| Arc::ptr_eq(current, flight));
    }
}

/// Held by the leader; publishes the result or, on drop, releases followers
pub(crate) struct FlightGuard<'a, T: Clone> {
    owner: &'a SingleFlight<T>,
    key: String,
    flight: Arc<Flight<T>>,
    completed: bool,
}

impl<T: Clone> FlightGuard<'_, T> {
    /// Whether a write or invalidation for this key raced the load
    pub(crate) fn is_invalidated(&self) -> bool {
        self.flight.invalidated.load(Ordering::SeqCst)
    }

    pub(crate) fn complete(mut self, result: CacheResult<T>) {
        self.completed = true;
        self.owner.remove(&self.key, &self.flight);
        self.flight.result.send_replace(Some(result));
    }
}

impl<T: Clone> Drop for FlightGuard<'_, T> {
    fn drop(&mut self) {
        if !self.completed {
            self.owner.remove(&self.key, &self.flight);
        }
    }
}
