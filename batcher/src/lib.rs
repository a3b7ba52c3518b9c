/*!
Infrastructure for shipping bounded batches of items from producers to a single background worker.

Producers push items into a [`Sender`] without ever waiting on anything but a short critical section. A [`Receiver`] drains them from the head of the queue in batches, either when a batch-size threshold is reached or a flush interval elapses, whichever comes first.

Failed batches are retried with a capped exponential backoff. Once retries are exhausted the remaining items are handed back to the caller instead of being re-queued, so a persistently failing destination can't starve newer items.
*/

use crate::internal_metrics::InternalMetrics;
use std::{
    any::Any,
    cmp,
    collections::VecDeque,
    fmt,
    future::{self, Future},
    mem,
    panic::{self, AssertUnwindSafe, UnwindSafe},
    pin::{pin, Pin},
    sync::{Arc, Mutex, MutexGuard},
    task::{self, Context, Poll},
    time::Duration,
};

mod internal_metrics;

pub use internal_metrics::ChannelMetrics;

const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);
const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(30);

/**
A container for items waiting to be batched.

Items are always removed from the front, in the order they were pushed.
*/
pub trait Channel {
    type Item;

    fn new() -> Self;

    fn with_capacity(capacity: usize) -> Self
    where
        Self: Sized,
    {
        let _ = capacity;

        Self::new()
    }

    fn push(&mut self, item: Self::Item);

    fn remaining(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /**
    Split off at most `max` items from the front of the channel.
    */
    fn take_front(&mut self, max: usize) -> Self;

    fn clear(&mut self);
}

impl<T> Channel for VecDeque<T> {
    type Item = T;

    fn new() -> Self {
        VecDeque::new()
    }

    fn with_capacity(capacity: usize) -> Self {
        VecDeque::with_capacity(capacity)
    }

    fn push(&mut self, item: Self::Item) {
        self.push_back(item);
    }

    fn remaining(&self) -> usize {
        self.len()
    }

    fn is_empty(&self) -> bool {
        self.is_empty()
    }

    fn take_front(&mut self, max: usize) -> Self {
        if max >= self.len() {
            return mem::take(self);
        }

        let rest = self.split_off(max);
        mem::replace(self, rest)
    }

    fn clear(&mut self) {
        self.clear()
    }
}

/**
Create a bounded channel.

At most `max_capacity` items are held in memory at once. The [`Receiver`] takes at most `batch_size` items per batch, and wakes early whenever that many items are waiting.
*/
pub fn bounded<T: Channel>(max_capacity: usize, batch_size: usize) -> (Sender<T>, Receiver<T>) {
    let batch_size = cmp::max(batch_size, 1);
    let max_capacity = cmp::max(max_capacity, 1);

    let shared = Arc::new(Shared {
        metrics: Default::default(),
        state: Mutex::new(State {
            queue: T::with_capacity(max_capacity),
            watchers: Watchers::new(),
            waker: None,
            is_open: true,
            is_in_batch: false,
        }),
    });

    (
        Sender {
            max_capacity,
            // The receiver can't wait for more items than fit in the queue
            wake_threshold: cmp::min(batch_size, max_capacity),
            shared: shared.clone(),
        },
        Receiver {
            batch_size,
            wake_threshold: cmp::min(batch_size, max_capacity),
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            retry: Retry::new(DEFAULT_MAX_RETRIES),
            retry_delay: Delay::new(DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_CAP),
            shared,
        },
    )
}

/**
The producer half of a channel.
*/
pub struct Sender<T> {
    max_capacity: usize,
    wake_threshold: usize,
    shared: Arc<Shared<T>>,
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        self.shared.close();
    }
}

/**
An item couldn't be pushed onto the channel.

The item is handed back so the caller can decide what to do with it.
*/
pub enum TrySendError<T> {
    /**
    The channel is at capacity.
    */
    Full(T),
    /**
    The channel has been closed.
    */
    Closed(T),
}

impl<T> TrySendError<T> {
    pub fn into_inner(self) -> T {
        match self {
            TrySendError::Full(item) | TrySendError::Closed(item) => item,
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, TrySendError::Full(_))
    }
}

impl<T> fmt::Debug for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrySendError::Full(_) => f.write_str("Full(..)"),
            TrySendError::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}

impl<T: Channel> Sender<T> {
    /**
    Push an item onto the back of the channel without waiting.
    */
    pub fn try_send(&self, msg: T::Item) -> Result<(), TrySendError<T::Item>> {
        let waker = {
            let mut state = self.shared.lock();

            if !state.is_open {
                return Err(TrySendError::Closed(msg));
            }

            // Never grow past the configured capacity; the caller is expected
            // to find somewhere else for the item
            if state.queue.remaining() >= self.max_capacity {
                self.shared.metrics.queue_full.increment();

                return Err(TrySendError::Full(msg));
            }

            state.queue.push(msg);

            if state.queue.remaining() >= self.wake_threshold {
                state.waker.take()
            } else {
                None
            }
        };

        // Wake the receiver outside of the lock
        if let Some(waker) = waker {
            waker.wake();
        }

        Ok(())
    }

    /**
    Stop accepting new items.

    The receiver will drain whatever is left in the queue and then complete.
    */
    pub fn close(&self) {
        self.shared.close();
    }

    pub fn is_open(&self) -> bool {
        self.shared.lock().is_open
    }

    /**
    The number of items currently waiting in the queue.
    */
    pub fn len(&self) -> usize {
        self.shared.lock().queue.remaining()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /**
    Take everything still waiting in the queue.

    This is used to recover items after the receiver has been stopped.
    */
    pub fn take_remaining(&self) -> T {
        mem::replace(&mut self.shared.lock().queue, T::new())
    }

    /**
    Schedule `watcher` to be called once everything currently in the queue has been processed.

    If there's nothing to wait for then `watcher` is called immediately.
    */
    pub fn on_next_flush(&self, watcher: impl FnOnce() + Send + 'static) {
        let watcher = Box::new(watcher);

        let mut state = self.shared.lock();

        // If:
        // - We're not in a batch and
        // - the queue is empty (there's no data)
        // Then:
        // - Call the watcher without scheduling it; there's nothing to wait for
        if !state.is_in_batch && state.queue.is_empty() {
            // Drop the lock before signalling the watcher
            drop(state);

            watcher();
        }
        // If there's active data to flush then schedule the watcher
        else {
            state.watchers.push(watcher);
        }
    }

    pub fn metrics(&self) -> ChannelMetrics {
        ChannelMetrics {
            metrics: self.shared.metrics.clone(),
        }
    }
}

/**
The consumer half of a channel.

Call [`Receiver::exec`] to drive it.
*/
pub struct Receiver<T> {
    batch_size: usize,
    wake_threshold: usize,
    flush_interval: Duration,
    retry: Retry,
    retry_delay: Delay,
    shared: Arc<Shared<T>>,
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        self.shared.close();
    }
}

/**
A batch failed.

Any items that are worth retrying are carried along with the error.
*/
pub struct BatchError<T> {
    retryable: T,
}

impl<T: Channel> BatchError<T> {
    /**
    The batch failed, but the items in `retryable` may succeed if tried again.
    */
    pub fn retry(_: impl std::error::Error + Send + Sync + 'static, retryable: T) -> Self {
        BatchError { retryable }
    }

    /**
    The batch failed and nothing in it is worth trying again.
    */
    pub fn no_retry(_: impl std::error::Error + Send + Sync + 'static) -> Self {
        BatchError {
            retryable: T::new(),
        }
    }

    pub fn into_retryable(self) -> T {
        self.retryable
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> BatchError<U> {
        BatchError {
            retryable: f(self.retryable),
        }
    }
}

impl<T: Channel> Receiver<T> {
    /**
    The maximum time to wait for a full batch before flushing whatever is in the queue.
    */
    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    /**
    The number of times a failed batch is retried before it's handed to the exhausted callback.
    */
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.retry = Retry::new(max_retries);
        self
    }

    /**
    The delay before the first retry, doubling on each attempt up to `cap`.
    */
    pub fn with_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.retry_delay = Delay::new(base, cap);
        self
    }

    /**
    Run the receiver until its channel is closed and drained.

    The `wait` function provides all delays, both the flush interval and retry backoff. The `on_batch` function is called with each batch. If it fails with retryable items then those items are retried. If retries are exhausted then they're passed to `on_exhausted`.
    */
    pub async fn exec<
        FBatch: Future<Output = Result<(), BatchError<T>>>,
        FWait: Future<Output = ()>,
    >(
        mut self,
        mut wait: impl FnMut(Duration) -> FWait,
        mut on_batch: impl FnMut(T) -> FBatch,
        mut on_exhausted: impl FnMut(T),
    ) {
        loop {
            let should_wait = {
                let state = self.shared.lock();

                state.is_open && state.queue.remaining() < self.wake_threshold
            };

            // Race the flush interval against the queue filling up
            if should_wait {
                let mut delay = pin!(wait(self.flush_interval));
                let shared = &self.shared;
                let wake_threshold = self.wake_threshold;

                future::poll_fn(|cx| {
                    if shared.poll_ready(cx, wake_threshold).is_ready() {
                        return Poll::Ready(());
                    }

                    delay.as_mut().poll(cx)
                })
                .await;
            }

            // Run inside the lock
            let (current_batch, watchers, is_open) = {
                let mut state = self.shared.lock();

                let batch = state.queue.take_front(self.batch_size);

                state.is_in_batch = batch.remaining() > 0;

                let watchers = if state.is_in_batch {
                    Watchers::new()
                } else {
                    mem::take(&mut state.watchers)
                };

                (batch, watchers, state.is_open)
            };

            // Run outside of the lock
            if current_batch.remaining() == 0 {
                // There was nothing to flush
                watchers.notify();

                // If the channel is closed then exit the loop and return
                if !is_open {
                    return;
                }

                continue;
            }

            self.emit(current_batch, &mut wait, &mut on_batch, &mut on_exhausted)
                .await;

            let watchers = {
                let mut state = self.shared.lock();

                state.is_in_batch = false;

                if state.queue.is_empty() {
                    mem::take(&mut state.watchers)
                } else {
                    Watchers::new()
                }
            };

            // After the queue has been emptied, notify any watchers
            watchers.notify();
        }
    }

    async fn emit<
        FBatch: Future<Output = Result<(), BatchError<T>>>,
        FWait: Future<Output = ()>,
    >(
        &mut self,
        mut current_batch: T,
        wait: &mut impl FnMut(Duration) -> FWait,
        on_batch: &mut impl FnMut(T) -> FBatch,
        on_exhausted: &mut impl FnMut(T),
    ) {
        self.retry.reset();
        self.retry_delay.reset();

        // Emit the batch, taking care not to panic
        loop {
            match panic::catch_unwind(AssertUnwindSafe(|| on_batch(current_batch))) {
                Ok(on_batch) => match CatchUnwind(AssertUnwindSafe(on_batch)).await {
                    Ok(Ok(())) => {
                        self.shared.metrics.queue_batch_processed.increment();
                    }
                    Ok(Err(BatchError { retryable })) => {
                        self.shared.metrics.queue_batch_failed.increment();

                        if retryable.remaining() > 0 {
                            if self.retry.next() {
                                // Delay a bit before trying again; this gives the external service
                                // a chance to get itself together
                                wait(self.retry_delay.next()).await;

                                current_batch = retryable;

                                self.shared.metrics.queue_batch_retry.increment();
                                continue;
                            }

                            self.shared.metrics.queue_batch_exhausted.increment();

                            if panic::catch_unwind(AssertUnwindSafe(|| on_exhausted(retryable)))
                                .is_err()
                            {
                                self.shared.metrics.queue_batch_panicked.increment();
                            }
                        }
                    }
                    Err(_) => {
                        self.shared.metrics.queue_batch_panicked.increment();
                    }
                },
                Err(_) => {
                    self.shared.metrics.queue_batch_panicked.increment();
                }
            }

            break;
        }
    }

    pub fn metrics(&self) -> ChannelMetrics {
        ChannelMetrics {
            metrics: self.shared.metrics.clone(),
        }
    }
}

struct CatchUnwind<F>(F);

impl<F: Future + UnwindSafe> Future for CatchUnwind<F> {
    type Output = Result<F::Output, Box<dyn Any + Send>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // SAFETY: `CatchUnwind` uses structural pinning
        let f = unsafe { Pin::map_unchecked_mut(self, |x| &mut x.0) };

        panic::catch_unwind(AssertUnwindSafe(|| f.poll(cx)))?.map(Ok)
    }
}

/**
A capped exponential backoff.

The first delay is `base`, each following delay doubles the last, and no delay exceeds `max`.
*/
#[derive(Debug, Clone)]
struct Delay {
    current: Duration,
    base: Duration,
    max: Duration,
}

impl Delay {
    fn new(base: Duration, max: Duration) -> Delay {
        Delay {
            current: Duration::ZERO,
            base,
            max,
        }
    }

    fn reset(&mut self) {
        self.current = Duration::ZERO
    }

    fn next(&mut self) -> Duration {
        self.current = if self.current.is_zero() {
            cmp::min(self.base, self.max)
        } else {
            cmp::min(self.current.saturating_mul(2), self.max)
        };

        self.current
    }
}

struct Retry {
    current: u32,
    max: u32,
}

impl Retry {
    fn new(max: u32) -> Self {
        Retry { current: 0, max }
    }

    fn reset(&mut self) {
        self.current = 0;
    }

    fn next(&mut self) -> bool {
        self.current += 1;
        self.current <= self.max
    }
}

struct Shared<T> {
    metrics: Arc<InternalMetrics>,
    state: Mutex<State<T>>,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        // The state is left consistent at every point a panic could occur
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn close(&self) {
        let waker = {
            let mut state = self.lock();

            state.is_open = false;
            state.waker.take()
        };

        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

impl<T: Channel> Shared<T> {
    fn poll_ready(&self, cx: &mut Context<'_>, wake_threshold: usize) -> Poll<()> {
        let mut state = self.lock();

        if !state.is_open || state.queue.remaining() >= wake_threshold {
            Poll::Ready(())
        } else {
            state.waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

struct State<T> {
    queue: T,
    watchers: Watchers,
    waker: Option<task::Waker>,
    is_open: bool,
    is_in_batch: bool,
}

struct Watchers(Vec<Watcher>);

type Watcher = Box<dyn FnOnce() + Send>;

impl Default for Watchers {
    fn default() -> Self {
        Watchers::new()
    }
}

impl Watchers {
    fn new() -> Self {
        Watchers(Vec::new())
    }

    fn push(&mut self, watcher: Watcher) {
        self.0.push(watcher);
    }

    fn notify(self) {
        for watcher in self.0 {
            let _ = panic::catch_unwind(AssertUnwindSafe(watcher));
        }
    }
}

pub mod sync;

#[cfg(feature = "tokio")]
pub mod tokio;
