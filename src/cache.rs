//! Bounded TTL cache with single-flight loading
//!
//! At most one load per key is outstanding. Callers arriving while a load
//! is in flight await the same shared future and observe the same result.
//! Successes and failures are both cached for the full TTL. Expiry is
//! checked lazily on access; eviction is least-recently-used.

use futures::future::{BoxFuture, FutureExt, Shared};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

type SharedLoad<V, E> = Shared<BoxFuture<'static, std::result::Result<V, E>>>;

struct Entry<V, E> {
    result: std::result::Result<V, E>,
    expires_at: Instant,
}

struct State<V, E> {
    /// Ordered from least to most recently used
    entries: IndexMap<String, Entry<V, E>>,
    in_flight: HashMap<String, SharedLoad<V, E>>,
}

pub struct SingleFlightCache<V, E> {
    capacity: usize,
    ttl: Duration,
    state: Mutex<State<V, E>>,
}

impl<V, E> SingleFlightCache<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new(capacity: usize, ttl: Duration) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::InvalidConfig(
                "cache capacity must be greater than 0".to_string(),
            ));
        }
        Ok(Self {
            capacity,
            ttl,
            state: Mutex::new(State {
                entries: IndexMap::with_capacity(capacity + 1),
                in_flight: HashMap::new(),
            }),
        })
    }

    /// Return the cached result for `key`, or join/start a load.
    ///
    /// `loader` only builds the future; it runs under the cache lock and
    /// must not touch this cache.
    pub async fn load<F, Fut>(&self, key: &str, loader: F) -> std::result::Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<V, E>> + Send + 'static,
    {
        let load = {
            let mut state = self.state.lock();

            if let Some(index) = state.entries.get_index_of(key) {
                if state.entries[index].expires_at > Instant::now() {
                    let last = state.entries.len() - 1;
                    state.entries.move_index(index, last);
                    return state.entries[last].result.clone();
                }
                state.entries.shift_remove_index(index);
            }

            match state.in_flight.get(key) {
                Some(load) => load.clone(),
                None => {
                    let load = loader().boxed().shared();
                    state.in_flight.insert(key.to_string(), load.clone());
                    load
                }
            }
        };

        let result = load.clone().await;
        self.publish(key, &load, &result);
        result
    }

    /// Move a finished load into the entry table. Only the first waiter of
    /// the load currently registered for `key` publishes.
    fn publish(&self, key: &str, load: &SharedLoad<V, E>, result: &std::result::Result<V, E>) {
        let mut state = self.state.lock();

        let current = state
            .in_flight
            .get(key)
            .is_some_and(|registered| registered.ptr_eq(load));
        if !current {
            return;
        }
        state.in_flight.remove(key);

        state.entries.shift_remove(key);
        state.entries.insert(
            key.to_string(),
            Entry {
                result: result.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        while state.entries.len() > self.capacity {
            state.entries.shift_remove_index(0);
        }
    }

    /// Number of cached entries, including expired ones not yet touched
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
