use std::{
    collections::HashMap,
    future::Future,
    hash::Hash,
    sync::{Arc, Mutex},
};

use futures_util::{
    FutureExt,
    future::{BoxFuture, Shared},
};

type Flight<V> = Shared<BoxFuture<'static, V>>;

/// Coalesces concurrent work per key: callers arriving while a flight for the
/// same key is running await its output instead of starting their own.
pub struct SingleFlight<K, V: Clone> {
    inflight: Arc<Mutex<HashMap<K, Flight<V>>>>,
}

impl<K, V: Clone> Clone for SingleFlight<K, V> {
    fn clone(&self) -> Self {
        Self {
            inflight: Arc::clone(&self.inflight),
        }
    }
}

impl<K, V: Clone> Default for SingleFlight<K, V> {
    fn default() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Run `start()` unless a flight for `key` already exists, then await it.
    ///
    /// `start` is only invoked by the caller that opens the flight. The flight
    /// keeps running to completion while any caller still awaits it.
    pub async fn run<F, Fut>(&self, key: K, start: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let flight = {
            let mut inflight = self.lock();
            match inflight.get(&key) {
                Some(existing) => existing.clone(),
                None => {
                    let flight = start().boxed().shared();
                    inflight.insert(key.clone(), flight.clone());
                    flight
                }
            }
        };

        let output = flight.clone().await;

        let mut inflight = self.lock();
        if inflight
            .get(&key)
            .is_some_and(|current| Shared::ptr_eq(current, &flight))
        {
            inflight.remove(&key);
        }
        output
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        self.lock().contains_key(key)
    }

    pub fn in_flight_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<K, Flight<V>>> {
        match self.inflight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use futures_util::future::join_all;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_execution() {
        let flights: SingleFlight<String, u64> = SingleFlight::default();
        let runs = Arc::new(AtomicUsize::new(0));

        let calls = (0..5).map(|_| {
            let flights = flights.clone();
            let runs = Arc::clone(&runs);
            async move {
                flights
                    .run("room".to_owned(), move || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        42
                    })
                    .await
            }
        });

        let results = join_all(calls).await;
        assert_eq!(results, vec![42; 5]);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(flights.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn distinct_keys_run_independently() {
        let flights: SingleFlight<&'static str, &'static str> = SingleFlight::default();
        let a = flights.run("a", || async { "A" });
        let b = flights.run("b", || async { "B" });
        assert_eq!(tokio::join!(a, b), ("A", "B"));
    }

    #[tokio::test]
    async fn completed_flight_is_not_reused() {
        let flights: SingleFlight<u8, u32> = SingleFlight::default();
        assert_eq!(flights.run(1, || async { 1 }).await, 1);
        assert!(!flights.is_in_flight(&1));
        assert_eq!(flights.run(1, || async { 2 }).await, 2);
    }
}
