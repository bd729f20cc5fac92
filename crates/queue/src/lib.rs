//! Recon work queue: a deduplicating, rate-limited delay queue of keys.
//!
//! A key is in at most one of three places at a time from a worker's point of
//! view: pending (`dirty`, possibly also `ready`), in flight (`processing`),
//! or both when it was re-added while a worker held it. Re-adds of an
//! in-flight key are parked in `dirty` and handed out again only after
//! [`WorkQueue::done`]. All state lives behind one mutex so every operation is
//! linearizable with respect to the others.

#![forbid(unsafe_code)]

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use recon_core::Key;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

mod rate_limiter;

pub use rate_limiter::{
    default_controller_rate_limiter, BucketRateLimiter, ItemExponentialFailureRateLimiter, MaxOfRateLimiter,
    RateLimiter,
};

/// Longest delay honoured; anything beyond waits this long instead.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

struct State {
    ready: VecDeque<Key>,
    dirty: FxHashSet<Key>,
    processing: FxHashSet<Key>,
    /// Delayed adds ordered by ready time. Entries superseded by an earlier
    /// time for the same key are skipped when popped.
    waiting: BinaryHeap<Reverse<(Instant, u64, Key)>>,
    waiting_at: FxHashMap<Key, Instant>,
    enqueued_at: FxHashMap<Key, Instant>,
    seq: u64,
    limiter: Box<dyn RateLimiter>,
    shutting_down: bool,
}

impl State {
    /// Returns true when a new key became ready.
    fn add(&mut self, name: &str, key: Key, now: Instant) -> bool {
        if self.shutting_down || self.dirty.contains(&key) {
            return false;
        }
        counter!("workqueue_adds_total", 1u64, "queue" => name.to_string());
        self.dirty.insert(key.clone());
        if self.processing.contains(&key) {
            return false;
        }
        self.enqueued_at.insert(key.clone(), now);
        self.ready.push_back(key);
        gauge!("workqueue_depth", self.ready.len() as f64, "queue" => name.to_string());
        true
    }

    /// Returns true when the earliest deadline may have moved.
    fn add_after(&mut self, name: &str, key: Key, delay: Duration, now: Instant) -> bool {
        if self.shutting_down {
            return false;
        }
        if delay.is_zero() {
            return self.add(name, key, now);
        }
        let at = now + delay.min(FAR_FUTURE);
        if matches!(self.waiting_at.get(&key), Some(existing) if *existing <= at) {
            return false;
        }
        self.seq = self.seq.wrapping_add(1);
        self.waiting_at.insert(key.clone(), at);
        self.waiting.push(Reverse((at, self.seq, key)));
        true
    }

    /// Move every delayed key whose time has come onto the ready list.
    fn promote(&mut self, name: &str, now: Instant) {
        while let Some(Reverse((at, _, _))) = self.waiting.peek() {
            if *at > now {
                break;
            }
            let Some(Reverse((at, _, key))) = self.waiting.pop() else { break };
            if self.waiting_at.get(&key) == Some(&at) {
                self.waiting_at.remove(&key);
                self.add(name, key, now);
            }
        }
    }

    fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((at, _, key))) = self.waiting.peek() {
            if self.waiting_at.get(key) == Some(at) {
                return Some(*at);
            }
            self.waiting.pop();
        }
        None
    }
}

/// Rate-limited deduplicating work queue shared by the feed and the workers.
pub struct WorkQueue {
    name: String,
    state: Mutex<State>,
    ready: Notify,
    drained: Notify,
}

impl WorkQueue {
    /// Queue using [`default_controller_rate_limiter`].
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_rate_limiter(name, default_controller_rate_limiter())
    }

    pub fn with_rate_limiter(name: impl Into<String>, limiter: impl RateLimiter + 'static) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(State {
                ready: VecDeque::new(),
                dirty: FxHashSet::default(),
                processing: FxHashSet::default(),
                waiting: BinaryHeap::new(),
                waiting_at: FxHashMap::default(),
                enqueued_at: FxHashMap::default(),
                seq: 0,
                limiter: Box::new(limiter),
                shutting_down: false,
            }),
            ready: Notify::new(),
            drained: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // Critical sections never panic midway; a poisoned lock still guards consistent state.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue immediately. A key already pending is not duplicated; a key in
    /// flight is marked for exactly one redelivery after `done`.
    pub fn add(&self, key: Key) {
        let woke = self.state().add(&self.name, key, Instant::now());
        if woke {
            self.ready.notify_one();
        }
    }

    /// Enqueue once `delay` has elapsed. If the key is already waiting, only an
    /// earlier ready time replaces the existing one.
    pub fn add_after(&self, key: Key, delay: Duration) {
        let moved = self.state().add_after(&self.name, key, delay, Instant::now());
        if moved {
            self.ready.notify_waiters();
        }
    }

    /// Enqueue after the delay the rate limiter assigns to this key.
    pub fn add_rate_limited(&self, key: Key) {
        let moved = {
            let mut st = self.state();
            if st.shutting_down {
                return;
            }
            let now = Instant::now();
            let delay = st.limiter.when(&key, now);
            debug!(queue = %self.name, key = %key, delay_ms = delay.as_millis() as u64, "rate limited add");
            st.add_after(&self.name, key, delay, now)
        };
        if moved {
            self.ready.notify_waiters();
        }
    }

    /// Wait for the next ready key and mark it in flight. `None` means the
    /// queue is shut down and has nothing left to hand out.
    pub async fn get(&self) -> Option<Key> {
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let deadline = {
                let mut st = self.state();
                let now = Instant::now();
                st.promote(&self.name, now);
                if let Some(key) = st.ready.pop_front() {
                    st.dirty.remove(&key);
                    st.processing.insert(key.clone());
                    if let Some(since) = st.enqueued_at.remove(&key) {
                        histogram!(
                            "workqueue_queue_latency_ms",
                            now.saturating_duration_since(since).as_secs_f64() * 1000.0,
                            "queue" => self.name.clone()
                        );
                    }
                    gauge!("workqueue_depth", st.ready.len() as f64, "queue" => self.name.clone());
                    let more = !st.ready.is_empty();
                    drop(st);
                    if more {
                        self.ready.notify_waiters();
                    }
                    return Some(key);
                }
                if st.shutting_down {
                    return None;
                }
                st.next_deadline()
            };

            match deadline {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Mark a key as no longer in flight. If it was re-added meanwhile it
    /// becomes ready for the next `get`.
    pub fn done(&self, key: &Key) {
        let (requeued, drained) = {
            let mut st = self.state();
            st.processing.remove(key);
            let requeued = if st.dirty.contains(key) {
                st.enqueued_at.insert(key.clone(), Instant::now());
                st.ready.push_back(key.clone());
                gauge!("workqueue_depth", st.ready.len() as f64, "queue" => self.name.clone());
                true
            } else {
                false
            };
            (requeued, st.shutting_down && st.processing.is_empty())
        };
        if requeued {
            self.ready.notify_one();
        }
        if drained {
            self.drained.notify_waiters();
        }
    }

    /// Reset the key's backoff so its next failure starts from the base delay.
    pub fn forget(&self, key: &Key) {
        self.state().limiter.forget(key);
    }

    pub fn num_requeues(&self, key: &Key) -> u32 {
        self.state().limiter.num_requeues(key)
    }

    /// Number of keys ready for delivery.
    pub fn len(&self) -> usize {
        self.state().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting keys. Ready keys are still handed out; delayed keys are
    /// dropped. Blocked `get` calls return `None` once nothing is ready.
    pub fn shut_down(&self) {
        {
            let mut st = self.state();
            if st.shutting_down {
                return;
            }
            st.shutting_down = true;
            st.waiting.clear();
            st.waiting_at.clear();
        }
        debug!(queue = %self.name, "work queue shutting down");
        self.ready.notify_waiters();
        self.drained.notify_waiters();
    }

    /// Shut down, then wait until every in-flight key has been marked done.
    pub async fn shut_down_with_drain(&self) {
        self.shut_down();
        loop {
            let drained = self.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            if self.state().processing.is_empty() {
                return;
            }
            drained.await;
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }
}
