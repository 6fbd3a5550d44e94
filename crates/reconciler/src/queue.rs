//! Deduplicating, rate-limited work queue.
//!
//! Items move through three sets:
//!
//! - **dirty**: needs processing (queued, or re-added while in flight)
//! - **processing**: handed out by [`WorkQueue::get`] and not yet released
//! - **queue**: FIFO of dirty items that are not in flight
//!
//! An item is never in `queue` and `processing` at the same time, so no two
//! workers hold the same item concurrently. Re-adding an in-flight item only
//! marks it dirty; releasing the [`InFlight`] guard puts it back in the FIFO.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, watch};
use tracing::trace;

use crate::error::Result;
use crate::rate_limit::{RateLimitConfig, RateLimiter, TokenBucket};

struct State<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    shutting_down: bool,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    available: Notify,
    limiter: Box<dyn RateLimiter<T>>,
    bucket: Option<TokenBucket>,
    shutdown_tx: watch::Sender<bool>,
}

/// Shared handle to a work queue. Clones refer to the same queue.
pub struct WorkQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for WorkQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("WorkQueue")
            .field("queued", &state.queue.len())
            .field("processing", &state.processing.len())
            .field("shutting_down", &state.shutting_down)
            .finish()
    }
}

impl<T> WorkQueue<T>
where
    T: Eq + Hash + Clone + Send + Sync + 'static,
{
    /// Create a queue using `limiter` for [`WorkQueue::add_rate_limited`],
    /// with no overall retry bound.
    pub fn new(limiter: impl RateLimiter<T> + 'static) -> Self {
        Self::build(Box::new(limiter), None)
    }

    /// Create a queue whose rate-limited adds wait out the per-item backoff
    /// and then take a token from the overall bucket.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidConfig`] if `config` is invalid.
    pub fn from_config(config: &RateLimitConfig) -> Result<Self> {
        config.validate()?;
        let bucket = config.bucket()?;
        Ok(Self::build(Box::new(config.backoff()), Some(bucket)))
    }

    fn build(limiter: Box<dyn RateLimiter<T>>, bucket: Option<TokenBucket>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    shutting_down: false,
                }),
                available: Notify::new(),
                limiter,
                bucket,
                shutdown_tx,
            }),
        }
    }

    /// Enqueue `item`. Coalesces with an identical pending item; defers if
    /// the item is in flight. Ignored once the queue is shutting down.
    pub fn add(&self, item: T) {
        {
            let mut state = self.inner.state.lock();
            if state.shutting_down {
                return;
            }
            if !state.dirty.insert(item.clone()) {
                return;
            }
            if state.processing.contains(&item) {
                trace!("item in flight, deferring");
                return;
            }
            state.queue.push_back(item);
        }
        self.inner.available.notify_one();
    }

    /// Wait for the next item.
    ///
    /// Returns `None` once the queue is shutting down and every queued item
    /// has been handed out.
    pub async fn get(&self) -> Option<InFlight<T>> {
        loop {
            let available = self.inner.available.notified();
            tokio::pin!(available);
            available.as_mut().enable();

            {
                let mut state = self.inner.state.lock();
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    return Some(InFlight {
                        queue: self.clone(),
                        item,
                    });
                }
                if state.shutting_down {
                    return None;
                }
            }

            available.await;
        }
    }

    /// Release the in-flight marker for `item`, requeueing it if it was
    /// re-added meanwhile.
    fn done(&self, item: &T) {
        let requeued = {
            let mut state = self.inner.state.lock();
            state.processing.remove(item);
            if state.dirty.contains(item) {
                state.queue.push_back(item.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.inner.available.notify_one();
        }
    }

    /// Enqueue `item` after the rate limiter's delay for it and, if the
    /// queue has an overall bucket, after taking a token from it.
    pub fn add_rate_limited(&self, item: T) {
        if self.is_shutting_down() {
            return;
        }
        let delay = self.inner.limiter.when(&item);
        self.schedule(item, delay, true);
    }

    /// Enqueue `item` once `delay` has elapsed, unless the queue shuts down
    /// first. Must be called from within a tokio runtime.
    pub fn add_after(&self, item: T, delay: Duration) {
        self.schedule(item, delay, false);
    }

    fn schedule(&self, item: T, delay: Duration, take_token: bool) {
        if self.is_shutting_down() {
            return;
        }
        let gated = take_token && self.inner.bucket.is_some();
        if delay.is_zero() && !gated {
            self.add(item);
            return;
        }

        let queue = self.clone();
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let ready = async {
                tokio::time::sleep(delay).await;
                if let Some(bucket) = queue.inner.bucket.as_ref().filter(|_| gated) {
                    bucket.acquire().await;
                }
            };
            tokio::select! {
                () = ready => queue.add(item),
                _ = shutdown_rx.wait_for(|down| *down) => {}
            }
        });
    }

    /// Reset the failure count of `item`. Does not touch queue membership.
    pub fn forget(&self, item: &T) {
        self.inner.limiter.forget(item);
    }

    /// Failures recorded for `item` since it was last forgotten.
    pub fn num_requeues(&self, item: &T) -> u32 {
        self.inner.limiter.num_requeues(item)
    }

    /// Stop accepting items and wake every waiting [`WorkQueue::get`].
    pub fn shut_down(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
        }
        self.inner.shutdown_tx.send_replace(true);
        self.inner.available.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }

    /// Number of items waiting to be handed out.
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of items currently handed out.
    pub fn in_flight(&self) -> usize {
        self.inner.state.lock().processing.len()
    }
}

/// An item handed out by [`WorkQueue::get`].
///
/// Releasing the guard (explicitly with [`InFlight::done`] or by dropping
/// it, including during unwinding) marks processing finished exactly once.
pub struct InFlight<T>
where
    T: Eq + Hash + Clone + Send + Sync + 'static,
{
    queue: WorkQueue<T>,
    item: T,
}

impl<T> InFlight<T>
where
    T: Eq + Hash + Clone + Send + Sync + 'static,
{
    pub fn item(&self) -> &T {
        &self.item
    }

    /// Mark processing of the item finished.
    pub fn done(self) {
        drop(self);
    }
}

impl<T> Drop for InFlight<T>
where
    T: Eq + Hash + Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.queue.done(&self.item);
    }
}

impl<T> fmt::Debug for InFlight<T>
where
    T: Eq + Hash + Clone + Send + Sync + fmt::Debug + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("InFlight").field(&self.item).finish()
    }
}
