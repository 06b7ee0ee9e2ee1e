use std::{
    collections::{HashMap, HashSet, VecDeque},
    time::{Duration, Instant},
};

use futures_delay_queue::{delay_queue, DelayQueue};
use futures_intrusive::{buffer::GrowingHeapBuf, channel::shared::GenericReceiver};
use parking_lot::{Mutex, RawMutex};
use tokio::sync::Notify;

/// Delays every item by the same interval, however often it failed.
#[derive(Debug, Clone)]
pub struct FixedItemIntervalRateLimiter {
    interval: Duration,
}

impl FixedItemIntervalRateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
        }
    }

    pub fn when(&self, _key: &str) -> Duration {
        self.interval
    }

    pub fn num_requeues(&self, _key: &str) -> u32 {
        1
    }

    pub fn forget(&self, _key: &str) {}
}

type DelayedKey = (String, u64);

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    /// Keys that need processing, queued or not.
    dirty: HashSet<String>,
    /// Keys handed out by `get` and not yet `done`.
    processing: HashSet<String>,
    /// Earliest pending delayed add per key, and its sequence number.
    waiting: HashMap<String, (Instant, u64)>,
    seq: u64,
    shutting_down: bool,
}

/// Deduplicating work queue of object keys.
///
/// A key is queued at most once. A key added while being processed is only
/// queued again once `done` is called, so no two workers ever hold the same
/// key at the same time.
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    rate_limiter: FixedItemIntervalRateLimiter,
    delayed: DelayQueue<DelayedKey, GrowingHeapBuf<DelayedKey>>,
    delayed_rx: GenericReceiver<RawMutex, DelayedKey, GrowingHeapBuf<DelayedKey>>,
}

impl WorkQueue {
    pub fn new(rate_limiter: FixedItemIntervalRateLimiter) -> Self {
        let (delayed, delayed_rx) = delay_queue::<DelayedKey>();
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            rate_limiter,
            delayed,
            delayed_rx,
        }
    }

    pub fn add(&self, key: &str) {
        let mut state = self.state.lock();
        if state.shutting_down {
            return;
        }
        Self::add_locked(&mut state, key);
        drop(state);
        self.notify.notify_one();
    }

    fn add_locked(state: &mut QueueState, key: &str) {
        if !state.dirty.insert(key.to_owned()) {
            return;
        }
        if state.processing.contains(key) {
            tracing::debug!("{} is being processed, deferred", key);
            return;
        }
        state.queue.push_back(key.to_owned());
    }

    /// Add `key` once the rate limiter allows it.
    pub fn add_rate_limited(&self, key: &str) {
        self.add_after(key, self.rate_limiter.when(key));
    }

    /// Add `key` after `delay`. Of several pending delayed adds of a key,
    /// only the one that becomes ready first takes effect.
    pub fn add_after(&self, key: &str, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let mut state = self.state.lock();
        if state.shutting_down {
            return;
        }
        let ready_at = Instant::now() + delay;
        if let Some((pending, _)) = state.waiting.get(key) {
            if *pending <= ready_at {
                return;
            }
        }
        state.seq += 1;
        let seq = state.seq;
        state.waiting.insert(key.to_owned(), (ready_at, seq));
        self.delayed.insert((key.to_owned(), seq), delay);
    }

    /// Move expired delayed adds into the queue. Runs until the task is aborted.
    pub async fn run_delay_pump(&self) {
        while let Some((key, seq)) = self.delayed_rx.receive().await {
            let mut state = self.state.lock();
            if state.shutting_down {
                break;
            }
            match state.waiting.get(&key) {
                Some((_, pending)) if *pending == seq => {
                    state.waiting.remove(&key);
                    Self::add_locked(&mut state, &key);
                    drop(state);
                    self.notify.notify_one();
                },
                // Superseded by an earlier add, or forgotten
                _ => {},
            }
        }
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Mark `key` as processed, queueing it again if it was added meanwhile.
    pub fn done(&self, key: &str) {
        let mut state = self.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.to_owned());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Stop tracking `key`, dropping its pending delayed add.
    pub fn forget(&self, key: &str) {
        self.rate_limiter.forget(key);
        self.state.lock().waiting.remove(key);
    }

    pub fn num_requeues(&self, key: &str) -> u32 {
        self.rate_limiter.num_requeues(key)
    }

    /// Stop handing out keys. Workers blocked in `get` return `None`.
    pub fn shut_down(&self) {
        self.state.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
