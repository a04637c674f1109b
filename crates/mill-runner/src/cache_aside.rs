//! Cache-aside store with a TTL, a grace window for stale reads and a
//! single-flight guard per key.
//!
//! A value younger than `ttl` is served directly. Once it is older, exactly
//! one caller reloads it; while that reload runs, other callers get the stale
//! value if it is still within `ttl + grace`, or wait for the reload otherwise.
//! Slots older than `ttl + grace` with nobody loading or waiting are dropped
//! whenever a load finishes.

use crate::services::Clock;
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

struct Slot<V> {
    value: Option<(Arc<V>, DateTime<Utc>)>,
    refreshing: bool,
    waiting: usize,
}

impl<V> Default for Slot<V> {
    fn default() -> Self {
        Self {
            value: None,
            refreshing: false,
            waiting: 0,
        }
    }
}

impl<V> Slot<V> {
    fn in_use(&self, now: DateTime<Utc>, horizon: Duration) -> bool {
        self.refreshing
            || self.waiting > 0
            || matches!(&self.value, Some((_, at)) if now - *at < horizon)
    }
}

pub struct CacheAside<K, V> {
    ttl: Duration,
    grace: Duration,
    clock: Arc<dyn Clock>,
    slots: Mutex<HashMap<K, Slot<V>>>,
    refreshed: Condvar,
}

enum Lookup<V> {
    Hit(Arc<V>),
    Wait,
    Refresh,
}

impl<K, V> CacheAside<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new(ttl: Duration, grace: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            grace,
            clock,
            slots: Mutex::new(HashMap::new()),
            refreshed: Condvar::new(),
        }
    }

    pub fn get_or_load<F>(&self, key: &K, load: F) -> Result<Arc<V>>
    where
        F: FnOnce() -> Result<V>,
    {
        let mut slots = self.lock();
        loop {
            let now = self.clock.now();
            let slot = slots.entry(key.clone()).or_default();
            let lookup = match &slot.value {
                Some((value, at)) if now - *at < self.ttl => Lookup::Hit(value.clone()),
                Some((value, at)) if slot.refreshing && now - *at < self.ttl + self.grace => {
                    Lookup::Hit(value.clone())
                }
                _ if slot.refreshing => {
                    slot.waiting += 1;
                    Lookup::Wait
                }
                _ => {
                    slot.refreshing = true;
                    Lookup::Refresh
                }
            };
            match lookup {
                Lookup::Hit(value) => return Ok(value),
                Lookup::Wait => {
                    slots = self
                        .refreshed
                        .wait(slots)
                        .unwrap_or_else(|e| e.into_inner());
                    if let Some(slot) = slots.get_mut(key) {
                        slot.waiting = slot.waiting.saturating_sub(1);
                    }
                }
                Lookup::Refresh => break,
            }
        }
        drop(slots);

        let mut flight = Flight {
            cache: self,
            key,
            stored: false,
        };
        let value = Arc::new(load()?);
        flight.store(value.clone());
        Ok(value)
    }

    pub fn invalidate(&self, key: &K) {
        let mut slots = self.lock();
        let idle = match slots.get_mut(key) {
            Some(slot) => {
                slot.value = None;
                !slot.refreshing && slot.waiting == 0
            }
            None => false,
        };
        if idle {
            slots.remove(key);
        }
    }

    fn prune(&self, slots: &mut HashMap<K, Slot<V>>) {
        let now = self.clock.now();
        let horizon = self.ttl + self.grace;
        slots.retain(|_, slot| slot.in_use(now, horizon));
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, Slot<V>>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Clears the in-flight flag when the loader returns, fails or panics, and
/// wakes the callers waiting on it.
struct Flight<'a, K: Eq + Hash + Clone, V> {
    cache: &'a CacheAside<K, V>,
    key: &'a K,
    stored: bool,
}

impl<K: Eq + Hash + Clone, V> Flight<'_, K, V> {
    fn store(&mut self, value: Arc<V>) {
        let now = self.cache.clock.now();
        let mut slots = self.cache.lock();
        let slot = slots.entry(self.key.clone()).or_default();
        slot.value = Some((value, now));
        slot.refreshing = false;
        self.stored = true;
        self.cache.prune(&mut slots);
        drop(slots);
        self.cache.refreshed.notify_all();
    }
}

impl<K: Eq + Hash + Clone, V> Drop for Flight<'_, K, V> {
    fn drop(&mut self) {
        if self.stored {
            return;
        }
        let mut slots = self.cache.lock();
        if let Some(slot) = slots.get_mut(self.key) {
            slot.refreshing = false;
        }
        self.cache.prune(&mut slots);
        drop(slots);
        self.cache.refreshed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ManualClock;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;

    fn cache(clock: Arc<ManualClock>) -> Arc<CacheAside<&'static str, String>> {
        Arc::new(CacheAside::new(
            Duration::seconds(60),
            Duration::seconds(5),
            clock,
        ))
    }

    fn waiting_on(cache: &CacheAside<&'static str, String>, key: &'static str) -> usize {
        cache.lock().get(&key).map(|slot| slot.waiting).unwrap_or(0)
    }

    #[test]
    fn fresh_values_are_served_without_reloading() {
        let clock = Arc::new(ManualClock::at_seconds(1_000));
        let cache = cache(clock.clone());
        let loads = AtomicUsize::new(0);
        let load = || {
            loads.fetch_add(1, Ordering::SeqCst);
            Ok("listing".to_string())
        };
        cache.get_or_load(&"k", load).expect("first load");
        clock.advance(Duration::seconds(59));
        let value = cache
            .get_or_load(&"k", || {
                loads.fetch_add(1, Ordering::SeqCst);
                Ok("other".to_string())
            })
            .expect("cached");
        assert_eq!(value.as_str(), "listing");
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn expired_values_are_reloaded() {
        let clock = Arc::new(ManualClock::at_seconds(1_000));
        let cache = cache(clock.clone());
        cache
            .get_or_load(&"k", || Ok("old".to_string()))
            .expect("load");
        clock.advance(Duration::seconds(60));
        let value = cache
            .get_or_load(&"k", || Ok("new".to_string()))
            .expect("reload");
        assert_eq!(value.as_str(), "new");
    }

    #[test]
    fn loader_errors_are_returned_and_do_not_poison_the_key() {
        let clock = Arc::new(ManualClock::at_seconds(1_000));
        let cache = cache(clock);
        let err = match cache.get_or_load(&"k", || Err(anyhow!("provider offline"))) {
            Ok(_) => panic!("loader error should surface"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("provider offline"));
        let value = cache
            .get_or_load(&"k", || Ok("recovered".to_string()))
            .expect("retry");
        assert_eq!(value.as_str(), "recovered");
    }

    #[test]
    fn concurrent_misses_share_a_single_load() {
        let clock = Arc::new(ManualClock::at_seconds(1_000));
        let cache = cache(clock);
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let leader = {
            let cache = cache.clone();
            thread::spawn(move || {
                cache
                    .get_or_load(&"k", move || {
                        started_tx.send(()).expect("signal start");
                        release_rx.recv().expect("release");
                        Ok("shared".to_string())
                    })
                    .expect("leader load")
            })
        };
        started_rx.recv().expect("leader started");

        let follower_loads = Arc::new(AtomicUsize::new(0));
        let follower = {
            let cache = cache.clone();
            let follower_loads = follower_loads.clone();
            thread::spawn(move || {
                cache
                    .get_or_load(&"k", move || {
                        follower_loads.fetch_add(1, Ordering::SeqCst);
                        Ok("duplicate".to_string())
                    })
                    .expect("follower load")
            })
        };
        // The leader is still held, so the follower can only be parked on the key.
        while waiting_on(&cache, "k") == 0 {
            thread::sleep(std::time::Duration::from_millis(1));
        }
        release_tx.send(()).expect("release leader");

        assert_eq!(leader.join().expect("leader").as_str(), "shared");
        assert_eq!(follower.join().expect("follower").as_str(), "shared");
        assert_eq!(follower_loads.load(Ordering::SeqCst), 0);
        assert_eq!(waiting_on(&cache, "k"), 0);
    }

    #[test]
    fn expired_keys_are_dropped_once_past_the_grace_window() {
        let clock = Arc::new(ManualClock::at_seconds(1_000));
        let cache = cache(clock.clone());
        cache
            .get_or_load(&"old", || Ok("a".to_string()))
            .expect("load old");
        clock.advance(Duration::seconds(30));
        cache
            .get_or_load(&"recent", || Ok("b".to_string()))
            .expect("load recent");
        clock.advance(Duration::seconds(36));
        cache
            .get_or_load(&"new", || Ok("c".to_string()))
            .expect("load new");
        let mut keys: Vec<&str> = cache.lock().keys().copied().collect();
        keys.sort();
        assert_eq!(keys, vec!["new", "recent"]);

        let _ = cache.get_or_load(&"broken", || Err(anyhow!("provider offline")));
        assert!(!cache.lock().contains_key("broken"));
        cache.invalidate(&"recent");
        assert!(!cache.lock().contains_key("recent"));
    }

    #[test]
    fn stale_value_is_served_within_grace_while_one_caller_refreshes() {
        let clock = Arc::new(ManualClock::at_seconds(1_000));
        let cache = cache(clock.clone());
        cache
            .get_or_load(&"k", || Ok("stale".to_string()))
            .expect("prime");
        clock.advance(Duration::seconds(62));

        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let refresher = {
            let cache = cache.clone();
            thread::spawn(move || {
                cache
                    .get_or_load(&"k", move || {
                        started_tx.send(()).expect("signal start");
                        release_rx.recv().expect("release");
                        Ok("fresh".to_string())
                    })
                    .expect("refresh")
            })
        };
        started_rx.recv().expect("refresh started");

        let served = cache
            .get_or_load(&"k", || Ok("unexpected".to_string()))
            .expect("stale read");
        assert_eq!(served.as_str(), "stale");

        release_tx.send(()).expect("release refresher");
        assert_eq!(refresher.join().expect("refresher").as_str(), "fresh");
        let after = cache
            .get_or_load(&"k", || Ok("unexpected".to_string()))
            .expect("fresh read");
        assert_eq!(after.as_str(), "fresh");
    }

    #[test]
    fn invalidate_forces_a_reload() {
        let clock = Arc::new(ManualClock::at_seconds(1_000));
        let cache = cache(clock);
        cache
            .get_or_load(&"k", || Ok("one".to_string()))
            .expect("load");
        cache.invalidate(&"k");
        let value = cache
            .get_or_load(&"k", || Ok("two".to_string()))
            .expect("reload");
        assert_eq!(value.as_str(), "two");
    }
}
