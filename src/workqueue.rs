//! Deduplicating, rate limited work queue.
//!
//! A key is handed to at most one worker at a time. Adding a key that is already queued
//! is a no-op, and adding a key that is being processed defers it until `done`.
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Per-item exponential backoff combined with a shared token bucket, the larger delay wins
#[derive(Debug, Clone)]
pub struct RateLimiter {
    base: Duration,
    max: Duration,
    bucket_interval: Duration,
    failures: HashMap<String, u32>,
    next_token: Option<Instant>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(5),
            Duration::from_secs(1000),
            Duration::from_secs(5),
        )
    }
}

impl RateLimiter {
    pub fn new(base: Duration, max: Duration, bucket_interval: Duration) -> Self {
        Self {
            base,
            max,
            bucket_interval,
            failures: HashMap::new(),
            next_token: None,
        }
    }

    fn backoff(&mut self, key: &str) -> Duration {
        let failures = self.failures.entry(key.to_string()).or_insert(0);
        let exp = *failures;
        *failures += 1;
        let factor = 2u32.checked_pow(exp).unwrap_or(u32::MAX);
        self.base.checked_mul(factor).unwrap_or(self.max).min(self.max)
    }

    fn bucket(&mut self, now: Instant) -> Duration {
        let available = self.next_token.map_or(now, |t| t.max(now));
        self.next_token = Some(available + self.bucket_interval);
        available - now
    }

    pub fn when(&mut self, key: &str, now: Instant) -> Duration {
        self.backoff(key).max(self.bucket(now))
    }

    pub fn forget(&mut self, key: &str) {
        self.failures.remove(key);
    }

    pub fn num_requeues(&self, key: &str) -> u32 {
        self.failures.get(key).copied().unwrap_or_default()
    }
}

#[derive(Debug, Default)]
struct State {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    waiting: HashMap<String, Instant>,
    limiter: RateLimiter,
    shutting_down: bool,
}

impl State {
    fn add(&mut self, key: String) -> bool {
        if self.shutting_down || self.dirty.contains(&key) {
            return false;
        }
        self.dirty.insert(key.clone());
        if self.processing.contains(&key) {
            return false;
        }
        self.queue.push_back(key);
        true
    }

    fn promote_due(&mut self, now: Instant) -> bool {
        let due: Vec<String> = self
            .waiting
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        let mut added = false;
        for key in due {
            self.waiting.remove(&key);
            added |= self.add(key);
        }
        added
    }

    fn next_due(&self) -> Option<Instant> {
        self.waiting.values().min().copied()
    }
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<State>,
    notify: Notify,
}

#[derive(Clone, Debug, Default)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

impl WorkQueue {
    pub fn new(limiter: RateLimiter) -> Self {
        let queue = Self::default();
        queue.inner.state.lock().limiter = limiter;
        queue
    }

    pub fn add(&self, key: &str) {
        if self.inner.state.lock().add(key.to_string()) {
            self.inner.notify.notify_one();
        }
    }

    /// Adds `key` once `delay` has passed, keeping the earliest deadline if already waiting
    pub fn add_after(&self, key: &str, delay: Duration) {
        if delay.is_zero() {
            return self.add(key);
        }
        let at = Instant::now() + delay;
        {
            let mut state = self.inner.state.lock();
            if state.shutting_down {
                return;
            }
            let slot = state.waiting.entry(key.to_string()).or_insert(at);
            if at < *slot {
                *slot = at;
            }
        }
        // wake a sleeping worker so it recomputes its deadline
        self.inner.notify.notify_one();
    }

    pub fn add_rate_limited(&self, key: &str) {
        let delay = self.inner.state.lock().limiter.when(key, Instant::now());
        self.add_after(key, delay);
    }

    pub fn forget(&self, key: &str) {
        self.inner.state.lock().limiter.forget(key);
    }

    pub fn num_requeues(&self, key: &str) -> u32 {
        self.inner.state.lock().limiter.num_requeues(key)
    }

    /// Waits for the next key. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.inner.notify.notified();
            let deadline = {
                let mut state = self.inner.state.lock();
                state.promote_due(Instant::now());
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
                state.next_due()
            };
            match deadline {
                Some(at) => {
                    let _ = tokio::time::timeout_at(at, notified).await;
                }
                None => notified.await,
            }
        }
    }

    /// Marks `key` as processed, re-queueing it if it was added meanwhile
    pub fn done(&self, key: &str) {
        let mut state = self.inner.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.to_string());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    pub fn shut_down(&self) {
        self.inner.state.lock().shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }

    /// Keys ready to be handed out
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys scheduled for later
    pub fn waiting_len(&self) -> usize {
        self.inner.state.lock().waiting.len()
    }
}
