/*!
The [`AsyncEventLogger`].

The logger owns a bounded in-memory queue that producers push events into, and two background workers:

- A flush worker that drains the queue in batches, sends them through a [`Transport`], retries failures with a capped exponential backoff, and writes batches that exhaust their retries to the spillover store.
- A reclaim worker that periodically drains the spillover store back through the same send path once the remote service is healthy again.

The two workers never send at the same time. They share a single send gate, so a batch being replayed from disk can't race a fresh batch for a token refresh or for the remote service.
*/

use std::{
    collections::VecDeque,
    fmt,
    path::Path,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use evlog_batcher::{BatchError, ChannelMetrics, Sender};
use evlog_spill::{DiskSpillover, SpilloverBuilder, SpilloverMetrics};
use tokio::{
    runtime::{Handle, Runtime},
    sync::watch,
    task::JoinHandle,
};

use crate::{
    error::{Error, ShutdownError},
    event::Limits,
    metrics::{InternalMetrics, MetricsSnapshot},
    token::{AuthError, TokenProvider},
    transport::{SendReport, Transport, TransportError},
    Event,
};

const DEFAULT_QUEUE_CAPACITY: usize = 10_000;
const DEFAULT_BATCH_SIZE: usize = 100;
const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);
const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(30);
const DEFAULT_RECLAIM_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/**
A builder for an [`AsyncEventLogger`].

Use [`AsyncEventLogger::builder`] to begin a [`LoggerBuilder`]. It will use the following defaults:

- A queue capacity of 10,000 events.
- Batches of up to 100 events, flushed at least every second.
- Up to 3 retries per batch, with a backoff starting at 1s and capped at 30s.
- No spillover store.
- Spillover reclaimed every 30s.
- A 10s shutdown grace period when the logger is dropped without being shut down.
*/
pub struct LoggerBuilder {
    transport: Arc<dyn Transport>,
    token_provider: TokenProvider,
    queue_capacity: usize,
    batch_size: usize,
    flush_interval: Duration,
    max_retries: u32,
    backoff_base: Duration,
    backoff_cap: Duration,
    spillover: Option<SpilloverBuilder>,
    reclaim_interval: Duration,
    shutdown_grace: Duration,
    limits: Limits,
}

impl LoggerBuilder {
    /**
    The maximum number of events to hold in memory.

    When the queue is full, new events go straight to the spillover store, or are dropped if there isn't one.
    */
    pub fn queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    /**
    The maximum number of events to send together.

    A flush is triggered as soon as this many events are queued.
    */
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /**
    The longest time an event will wait in the queue before a flush is triggered.
    */
    pub fn flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    /**
    The number of times a failed batch is retried before it's spilled.
    */
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /**
    The delay before the first retry, and the limit on how far it can double to.
    */
    pub fn backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_cap = cap;
        self
    }

    /**
    Write events that can't be queued or delivered to a spillover store.
    */
    pub fn spillover(mut self, spillover: SpilloverBuilder) -> Self {
        self.spillover = Some(spillover);
        self
    }

    /**
    Write events that can't be queued or delivered to a spillover store in `dir`, using its default configuration.
    */
    pub fn spillover_dir(self, dir: impl AsRef<Path>) -> Self {
        self.spillover(evlog_spill::dir(dir))
    }

    /**
    How often to try replay events from the spillover store.
    */
    pub fn reclaim_interval(mut self, reclaim_interval: Duration) -> Self {
        self.reclaim_interval = reclaim_interval;
        self
    }

    /**
    The grace period used when the logger is dropped without calling [`AsyncEventLogger::shutdown`].
    */
    pub fn shutdown_grace(mut self, shutdown_grace: Duration) -> Self {
        self.shutdown_grace = shutdown_grace;
        self
    }

    /**
    The maximum length in bytes of each identifier on an event.
    */
    pub fn max_identifier_len(mut self, max_identifier_len: usize) -> Self {
        self.limits.max_identifier_len = max_identifier_len;
        self
    }

    /**
    The maximum length in bytes of an event's message.
    */
    pub fn max_message_len(mut self, max_message_len: usize) -> Self {
        self.limits.max_message_len = max_message_len;
        self
    }

    /**
    The maximum encoded size of an event's payload.
    */
    pub fn max_payload_bytes(mut self, max_payload_bytes: usize) -> Self {
        self.limits.max_payload_bytes = max_payload_bytes;
        self
    }

    /**
    Open the spillover store and start the background workers.

    If this method is called within a `tokio` runtime then the workers are spawned on it. Otherwise the logger starts a small runtime of its own.
    */
    pub fn spawn(self) -> Result<AsyncEventLogger, Error> {
        if self.queue_capacity == 0 || self.batch_size == 0 {
            return Err(Error::new("queue capacity and batch size must be non-zero"));
        }

        let spillover = match self.spillover {
            Some(spillover) => Some(spillover.open::<Event>().map_err(Error::new)?),
            None => None,
        };

        let (handle, runtime) = match Handle::try_current() {
            Ok(handle) => (handle, None),
            Err(_) => {
                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(1)
                    .thread_name("evlog-worker")
                    .enable_all()
                    .build()
                    .map_err(Error::new)?;

                (runtime.handle().clone(), Some(runtime))
            }
        };

        let (sender, receiver) =
            evlog_batcher::bounded::<VecDeque<Event>>(self.queue_capacity, self.batch_size);

        let receiver = receiver
            .with_flush_interval(self.flush_interval)
            .with_max_retries(self.max_retries)
            .with_backoff(self.backoff_base, self.backoff_cap);

        let inner = Arc::new(Inner {
            sender,
            transport: self.transport,
            token_provider: self.token_provider,
            spillover,
            metrics: InternalMetrics::default(),
            state: AtomicU8::new(LoggerState::Running as u8),
            send_gate: tokio::sync::Mutex::new(()),
            in_flight: Mutex::new(None),
            limits: self.limits,
            reclaim_batch_size: self.batch_size,
        });

        let (stop, stopped) = watch::channel(false);

        let workers = {
            let _guard = handle.enter();

            let flush = evlog_batcher::tokio::spawn(
                receiver,
                {
                    let inner = inner.clone();

                    move |batch| {
                        let inner = inner.clone();

                        async move { inner.flush_batch(batch).await }
                    }
                },
                {
                    let inner = inner.clone();

                    move |batch| inner.spill_exhausted(batch)
                },
            );

            let reclaim = if inner.spillover.is_some() {
                Some(tokio::spawn(reclaim(
                    inner.clone(),
                    self.reclaim_interval,
                    stopped,
                )))
            } else {
                None
            };

            Workers { flush, reclaim }
        };

        Ok(AsyncEventLogger {
            inner,
            workers: Mutex::new(Some(workers)),
            stop,
            handle,
            runtime,
            shutdown_grace: self.shutdown_grace,
        })
    }
}

/**
The lifecycle of an [`AsyncEventLogger`].
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoggerState {
    /**
    The logger is accepting events.
    */
    Running = 0,
    /**
    Shutdown has started and the queue is being flushed.
    */
    Draining = 1,
    /**
    The logger has shut down. Any new events are dropped.
    */
    Stopped = 2,
}

impl LoggerState {
    fn from_u8(state: u8) -> Self {
        match state {
            0 => LoggerState::Running,
            1 => LoggerState::Draining,
            _ => LoggerState::Stopped,
        }
    }
}

/**
A logger that ships events to a remote event log in the background.

Calls to [`AsyncEventLogger::log`] never block and never fail loudly. The only signal of data loss is a `false` return value and the [`MetricsSnapshot::dropped`] counter.
*/
pub struct AsyncEventLogger {
    inner: Arc<Inner>,
    workers: Mutex<Option<Workers>>,
    stop: watch::Sender<bool>,
    handle: Handle,
    runtime: Option<Runtime>,
    shutdown_grace: Duration,
}

struct Workers {
    flush: JoinHandle<()>,
    reclaim: Option<JoinHandle<()>>,
}

impl AsyncEventLogger {
    /**
    Start building a logger that sends events through `transport`, authenticated with tokens from `token_provider`.
    */
    pub fn builder(
        transport: impl Transport + 'static,
        token_provider: impl Into<TokenProvider>,
    ) -> LoggerBuilder {
        LoggerBuilder {
            transport: Arc::new(transport),
            token_provider: token_provider.into(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_cap: DEFAULT_BACKOFF_CAP,
            spillover: None,
            reclaim_interval: DEFAULT_RECLAIM_INTERVAL,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            limits: Limits::default(),
        }
    }

    /**
    Hand an event to the logger.

    If the queue is full then the event is written to the spillover store instead. Returns `false` if the event couldn't be queued or spilled and was dropped.
    */
    pub fn log(&self, mut event: Event) -> bool {
        let inner = &self.inner;

        if inner.state() != LoggerState::Running {
            inner.metrics.dropped.increment();
            return false;
        }

        if event.truncate(&inner.limits) {
            inner.metrics.truncated.increment();
        }

        let event = match inner.sender.try_send(event) {
            Ok(()) => {
                inner.metrics.accepted.increment();
                return true;
            }
            Err(err) if err.is_full() => err.into_inner(),
            // The logger is shutting down
            Err(_) => {
                inner.metrics.dropped.increment();
                return false;
            }
        };

        let Some(ref spillover) = inner.spillover else {
            inner.metrics.dropped.increment();
            return false;
        };

        match spillover.append(&event) {
            Ok(appended) => {
                inner.metrics.accepted.increment();
                inner.metrics.spilled.increment();
                inner.discard_evicted(appended.evicted());

                true
            }
            Err(err) => {
                inner.metrics.dropped.increment();
                inner.discard_evicted(err.evicted());

                emit::warn!(
                    rt: emit::runtime::internal(),
                    "dropping event; the queue is full and it couldn't be spilled: {err}",
                    err,
                );

                false
            }
        }
    }

    /**
    Hand a set of events to the logger, returning how many were accepted.

    Each event is handled as if it were passed to [`AsyncEventLogger::log`] individually.
    */
    pub fn log_all(&self, events: impl IntoIterator<Item = Event>) -> usize {
        events
            .into_iter()
            .map(|event| self.log(event))
            .filter(|accepted| *accepted)
            .count()
    }

    /**
    Wait until every event queued at the point this call was made has been processed.

    Returns `false` if `timeout` elapsed first.
    */
    pub async fn flush(&self, timeout: Duration) -> bool {
        evlog_batcher::tokio::flush(&self.inner.sender, timeout).await
    }

    /**
    Block the current thread until every event queued at the point this call was made has been processed.

    This method must not be called from within an async context.
    */
    pub fn blocking_flush(&self, timeout: Duration) -> bool {
        evlog_batcher::sync::blocking_flush(&self.inner.sender, timeout)
    }

    /**
    Stop accepting events and flush the queue, waiting up to `grace` for it to finish.

    Flushing uses the same retry and spillover policy as normal operation. If the grace period elapses first then the workers are stopped and any queued or in-flight events are written to the spillover store.

    Only the first call does anything. Later calls return `Ok(())` immediately.
    */
    pub async fn shutdown(&self, grace: Duration) -> Result<(), ShutdownError> {
        let inner = &self.inner;

        if inner
            .state
            .compare_exchange(
                LoggerState::Running as u8,
                LoggerState::Draining as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Ok(());
        }

        emit::debug!(
            rt: emit::runtime::internal(),
            "shutting down with {queue_depth} queued events",
            queue_depth: inner.sender.len(),
        );

        inner.sender.close();
        let _ = self.stop.send(true);

        let workers = self
            .workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        let result = match workers {
            Some(mut workers) => {
                let drained = tokio::time::timeout(grace, async {
                    let _ = (&mut workers.flush).await;

                    if let Some(ref mut reclaim) = workers.reclaim {
                        let _ = reclaim.await;
                    }
                })
                .await;

                match drained {
                    Ok(()) => Ok(()),
                    Err(_) => {
                        workers.flush.abort();
                        let _ = (&mut workers.flush).await;

                        if let Some(mut reclaim) = workers.reclaim {
                            reclaim.abort();
                            let _ = (&mut reclaim).await;
                        }

                        Err(inner.secure_remaining(grace))
                    }
                }
            }
            None => Ok(()),
        };

        inner
            .state
            .store(LoggerState::Stopped as u8, Ordering::Release);

        result
    }

    /**
    Shut down the logger from synchronous code.

    This method must not be called from within an async context.
    */
    pub fn blocking_shutdown(&self, grace: Duration) -> Result<(), ShutdownError> {
        match self.runtime {
            Some(ref runtime) => runtime.block_on(self.shutdown(grace)),
            None => self.handle.block_on(self.shutdown(grace)),
        }
    }

    /**
    Get a snapshot of the logger's metrics.
    */
    pub fn metrics(&self) -> MetricsSnapshot {
        let inner = &self.inner;

        inner.metrics.snapshot(
            inner.sender.len(),
            inner
                .spillover
                .as_ref()
                .map(|spillover| spillover.pending())
                .unwrap_or(0),
        )
    }

    /**
    Get metrics for the in-memory queue.
    */
    pub fn channel_metrics(&self) -> ChannelMetrics {
        self.inner.sender.metrics()
    }

    /**
    Get metrics for the spillover store, if there is one.
    */
    pub fn spillover_metrics(&self) -> Option<SpilloverMetrics> {
        self.inner
            .spillover
            .as_ref()
            .map(|spillover| spillover.metrics())
    }

    /**
    Whether the logger is running, draining for shutdown, or stopped.
    */
    pub fn state(&self) -> LoggerState {
        self.inner.state()
    }
}

impl fmt::Debug for AsyncEventLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncEventLogger")
            .field("state", &self.state())
            .field("metrics", &self.metrics())
            .finish_non_exhaustive()
    }
}

impl Drop for AsyncEventLogger {
    fn drop(&mut self) {
        if self.state() == LoggerState::Running {
            if self.runtime.is_some() && Handle::try_current().is_err() {
                let _ = self.blocking_shutdown(self.shutdown_grace);
            } else {
                // The workers finish draining the queue in the background
                self.inner.sender.close();
            }
        }

        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

struct Inner {
    sender: Sender<VecDeque<Event>>,
    transport: Arc<dyn Transport>,
    token_provider: TokenProvider,
    spillover: Option<DiskSpillover<Event>>,
    metrics: InternalMetrics,
    state: AtomicU8,
    // Held for each send attempt so flush and reclaim never send at the same time
    send_gate: tokio::sync::Mutex<()>,
    // A copy of the batch the flush worker is currently trying to send
    in_flight: Mutex<Option<Vec<Event>>>,
    limits: Limits,
    reclaim_batch_size: usize,
}

#[derive(Debug)]
enum SendError {
    Auth(AuthError),
    Transport(TransportError),
}

impl SendError {
    fn is_retryable(&self) -> bool {
        match self {
            SendError::Auth(_) => true,
            SendError::Transport(err) => err.is_retryable(),
        }
    }
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Auth(err) => fmt::Display::fmt(err, f),
            SendError::Transport(err) => fmt::Display::fmt(err, f),
        }
    }
}

impl std::error::Error for SendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SendError::Auth(err) => Some(err),
            SendError::Transport(err) => Some(err),
        }
    }
}

impl Inner {
    fn state(&self) -> LoggerState {
        LoggerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, Option<Vec<Event>>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn send(&self, batch: &[Event]) -> Result<SendReport, SendError> {
        let _gate = self.send_gate.lock().await;

        // A token is requested for every attempt, so a refreshed one is picked up on retry
        let token = match self.token_provider.get_token().await {
            Ok(token) => token,
            Err(err) => {
                self.metrics.auth_failed.increment();

                return Err(SendError::Auth(err));
            }
        };

        match self.transport.send(batch, &token).await {
            Ok(report) => Ok(report),
            Err(err) => {
                if err.is_unauthorized() {
                    self.token_provider.invalidate();
                }

                Err(SendError::Transport(err))
            }
        }
    }

    async fn flush_batch(&self, batch: VecDeque<Event>) -> Result<(), BatchError<VecDeque<Event>>> {
        let batch = Vec::from(batch);

        *self.lock_in_flight() = Some(batch.clone());

        match self.send(&batch).await {
            Ok(report) => {
                self.lock_in_flight().take();
                self.on_sent(&batch, &report, None);

                Ok(())
            }
            Err(err) if err.is_retryable() => {
                self.metrics.consecutive_failures.increment();

                emit::warn!(
                    rt: emit::runtime::internal(),
                    "failed to send {count} events: {err}",
                    count: batch.len(),
                    err,
                );

                Err(BatchError::retry(err, VecDeque::from(batch)))
            }
            Err(err) => {
                self.lock_in_flight().take();
                self.discard(batch.len());

                emit::warn!(
                    rt: emit::runtime::internal(),
                    "dropping {count} events the remote service won't accept: {err}",
                    count: batch.len(),
                    err,
                );

                Err(BatchError::no_retry(err))
            }
        }
    }

    fn spill_exhausted(&self, batch: VecDeque<Event>) {
        let batch = Vec::from(batch);

        let spilled = self.spill(&batch);

        emit::debug!(
            rt: emit::runtime::internal(),
            "spilled {spilled} of {count} events after retries were exhausted",
            spilled,
            count: batch.len(),
        );

        self.lock_in_flight().take();
    }

    // Write accepted events to the spillover store, returning how many were secured
    fn spill(&self, events: &[Event]) -> usize {
        let Some(ref spillover) = self.spillover else {
            if !events.is_empty() {
                self.discard(events.len());

                emit::warn!(
                    rt: emit::runtime::internal(),
                    "dropping {count} undeliverable events; there's no spillover store",
                    count: events.len(),
                );
            }

            return 0;
        };

        match spillover.append_all(events) {
            Ok(appended) => {
                self.metrics.spilled.increment_by(appended.written());
                self.discard_evicted(appended.evicted());

                appended.written()
            }
            Err(err) => {
                let written = err.written();

                self.metrics.spilled.increment_by(written);
                self.discard_evicted(err.evicted());
                self.discard(events.len() - written);

                emit::warn!(
                    rt: emit::runtime::internal(),
                    "dropping {count} undeliverable events; they couldn't be spilled: {err}",
                    count: events.len() - written,
                    err,
                );

                written
            }
        }
    }

    // `evicted` is set for replayed batches, counting the events in the batch
    // that were evicted from the spillover store while they were being sent
    fn on_sent(&self, batch: &[Event], report: &SendReport, evicted: Option<usize>) {
        let rejected = report.rejected_count(batch.len());
        let delivered = batch.len() - rejected;

        // Evicted events have already been counted as discarded
        let evicted_delivered = evicted.unwrap_or(0).min(delivered);
        let evicted_rejected = evicted.unwrap_or(0) - evicted_delivered;

        self.metrics.sent.increment_by(delivered - evicted_delivered);
        if evicted.is_some() {
            self.metrics
                .replayed
                .increment_by(delivered - evicted_delivered);
        }

        self.metrics.consecutive_failures.reset();

        if rejected > 0 {
            self.discard(rejected.saturating_sub(evicted_rejected));

            for err in report.rejected() {
                emit::debug!(rt: emit::runtime::internal(), "{err}", err);
            }

            emit::warn!(
                rt: emit::runtime::internal(),
                "the remote service rejected {rejected} of {count} events",
                rejected,
                count: batch.len(),
            );
        }
    }

    fn discard(&self, count: usize) {
        self.metrics.dropped.increment_by(count);
        self.metrics.discarded.increment_by(count);
    }

    // Spilled events deleted by the spillover store to make room for newer ones
    fn discard_evicted(&self, evicted: u64) {
        if evicted > 0 {
            self.discard(evicted as usize);
        }
    }

    async fn reclaim(&self) {
        let Some(ref spillover) = self.spillover else {
            return;
        };

        loop {
            // During an outage, fresh traffic takes priority. When the queue is idle
            // a single replayed batch is used to probe whether the service has recovered
            if self.metrics.consecutive_failures.sample() > 0 && !self.sender.is_empty() {
                return;
            }

            if self.state() != LoggerState::Running {
                return;
            }

            let drained = match spillover.drain(self.reclaim_batch_size) {
                Ok(drained) => drained,
                Err(err) => {
                    emit::warn!(
                        rt: emit::runtime::internal(),
                        "failed to read spilled events: {err}",
                        err,
                    );

                    return;
                }
            };

            if drained.is_empty() {
                return;
            }

            let (receipts, batch): (Vec<_>, Vec<_>) =
                drained.into_iter().map(|spilled| spilled.into_parts()).unzip();

            match self.send(&batch).await {
                Ok(report) => {
                    // Only acknowledge once the remote service has confirmed the batch
                    let evicted = spillover.acknowledge(receipts);
                    self.on_sent(&batch, &report, Some(evicted));

                    emit::debug!(
                        rt: emit::runtime::internal(),
                        "replayed {count} spilled events",
                        count: batch.len(),
                    );
                }
                Err(err) if err.is_retryable() => {
                    self.metrics.consecutive_failures.increment();

                    emit::debug!(
                        rt: emit::runtime::internal(),
                        "failed to replay {count} spilled events: {err}",
                        count: batch.len(),
                        err,
                    );

                    return;
                }
                Err(err) => {
                    let evicted = spillover.acknowledge(receipts);
                    self.discard(batch.len().saturating_sub(evicted));

                    emit::warn!(
                        rt: emit::runtime::internal(),
                        "dropping {count} spilled events the remote service won't accept: {err}",
                        count: batch.len(),
                        err,
                    );
                }
            }
        }
    }

    // Called after the workers have been stopped
    fn secure_remaining(&self, grace: Duration) -> ShutdownError {
        let mut remaining = self.lock_in_flight().take().unwrap_or_default();
        remaining.extend(self.sender.take_remaining());

        let spilled = self.spill(&remaining);
        let lost = remaining.len() - spilled;

        emit::warn!(
            rt: emit::runtime::internal(),
            "failed to flush within {grace}; spilled {spilled} events and lost {lost}",
            #[emit::as_debug]
            grace,
            spilled,
            lost,
        );

        ShutdownError {
            grace,
            spilled,
            lost,
        }
    }
}

async fn reclaim(inner: Arc<Inner>, interval: Duration, mut stop: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => (),
            _ = stop.changed() => return,
        }

        inner.reclaim().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    use crate::{
        token::{BoxFuture, OAuthTokenProvider, StaticTokenProvider, Token, TokenSource},
        transport::RejectedError,
        EventKind, EventStatus,
    };

    enum Outcome {
        Accept,
        Reject(Vec<usize>),
        Retryable,
        Unauthorized,
        Terminal,
        Hang,
        Slow(Duration),
    }

    #[derive(Default)]
    struct TestTransport {
        script: Mutex<VecDeque<Outcome>>,
        delivered: Mutex<Vec<Event>>,
        attempted: Mutex<Vec<String>>,
        tokens: Mutex<Vec<String>>,
        calls: AtomicUsize,
        sending: AtomicUsize,
        max_sending: AtomicUsize,
    }

    impl TestTransport {
        fn scripted(script: impl IntoIterator<Item = Outcome>) -> Arc<Self> {
            Arc::new(TestTransport {
                script: Mutex::new(script.into_iter().collect()),
                ..Default::default()
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn delivered(&self) -> Vec<String> {
            self.delivered
                .lock()
                .unwrap()
                .iter()
                .map(|event| event.correlation_id().to_owned())
                .collect()
        }

        fn attempted(&self) -> Vec<String> {
            self.attempted.lock().unwrap().clone()
        }

        fn tokens(&self) -> Vec<String> {
            self.tokens.lock().unwrap().clone()
        }

        fn max_sending(&self) -> usize {
            self.max_sending.load(Ordering::SeqCst)
        }
    }

    impl Transport for TestTransport {
        fn send<'a>(
            &'a self,
            batch: &'a [Event],
            token: &'a Token,
        ) -> BoxFuture<'a, Result<SendReport, TransportError>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);

                self.tokens.lock().unwrap().push(token.value().to_owned());
                self.attempted
                    .lock()
                    .unwrap()
                    .extend(batch.iter().map(|event| event.correlation_id().to_owned()));

                let outcome = self
                    .script
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or(Outcome::Accept);

                match outcome {
                    Outcome::Accept => {
                        self.delivered.lock().unwrap().extend(batch.iter().cloned());

                        Ok(SendReport::accepted())
                    }
                    Outcome::Reject(indexes) => {
                        self.delivered.lock().unwrap().extend(
                            batch
                                .iter()
                                .enumerate()
                                .filter(|(i, _)| !indexes.contains(i))
                                .map(|(_, event)| event.clone()),
                        );

                        Ok(SendReport::with_rejected(
                            indexes
                                .into_iter()
                                .map(|index| RejectedError::new(index, "invalid payload")),
                        ))
                    }
                    Outcome::Retryable => Err(TransportError::retryable("service unavailable")),
                    Outcome::Unauthorized => Err(TransportError::unauthorized("token expired")),
                    Outcome::Terminal => Err(TransportError::terminal("bad request")),
                    Outcome::Hang => std::future::pending().await,
                    Outcome::Slow(delay) => {
                        let sending = self.sending.fetch_add(1, Ordering::SeqCst) + 1;
                        self.max_sending.fetch_max(sending, Ordering::SeqCst);

                        tokio::time::sleep(delay).await;

                        self.sending.fetch_sub(1, Ordering::SeqCst);
                        self.delivered.lock().unwrap().extend(batch.iter().cloned());

                        Ok(SendReport::accepted())
                    }
                }
            })
        }
    }

    struct FailingSource;

    #[derive(Default)]
    struct CountingSource {
        fetches: AtomicUsize,
    }

    impl TokenSource for CountingSource {
        fn fetch(&self) -> BoxFuture<'_, Result<Token, AuthError>> {
            Box::pin(async move {
                let n = self.fetches.fetch_add(1, Ordering::SeqCst);

                Ok(Token::never_expires(format!("token-{n}")))
            })
        }
    }

    impl TokenSource for FailingSource {
        fn fetch(&self) -> BoxFuture<'_, Result<Token, AuthError>> {
            Box::pin(async { Err(AuthError::new("invalid client secret")) })
        }
    }

    fn event(n: usize) -> Event {
        Event::new(EventKind::Step, EventStatus::Success).with_correlation_id(format!("e{n}"))
    }

    fn builder(transport: &Arc<TestTransport>) -> LoggerBuilder {
        AsyncEventLogger::builder(transport.clone(), StaticTokenProvider::new("token"))
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_without_spillover_drops() {
        let transport = TestTransport::scripted([]);
        let logger = builder(&transport).queue_capacity(2).spawn().unwrap();

        assert!(logger.log(event(1)));
        assert!(logger.log(event(2)));
        assert!(!logger.log(event(3)));

        let metrics = logger.metrics();
        assert_eq!(2, metrics.accepted);
        assert_eq!(1, metrics.dropped);
        assert_eq!(2, metrics.queue_depth);

        logger.shutdown(Duration::from_secs(5)).await.unwrap();

        assert_eq!(vec!["e1", "e2"], transport.delivered());
    }

    #[tokio::test(start_paused = true)]
    async fn log_all_counts_accepted_events() {
        let transport = TestTransport::scripted([]);
        let logger = builder(&transport).queue_capacity(2).spawn().unwrap();

        assert_eq!(2, logger.log_all((0..3).map(event)));
        assert_eq!(1, logger.metrics().dropped);
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_falls_back_to_spillover() {
        let dir = tempfile::tempdir().unwrap();
        let transport = TestTransport::scripted([]);
        let logger = builder(&transport)
            .queue_capacity(1)
            .spillover_dir(dir.path())
            .spawn()
            .unwrap();

        assert!(logger.log(event(1)));
        assert!(logger.log(event(2)));

        let metrics = logger.metrics();
        assert_eq!(2, metrics.accepted);
        assert_eq!(1, metrics.spilled);
        assert_eq!(1, metrics.spilled_pending);
        assert_eq!(0, metrics.dropped);
    }

    #[tokio::test(start_paused = true)]
    async fn batches_are_sent_in_fifo_order() {
        let transport = TestTransport::scripted([]);
        let logger = builder(&transport).batch_size(2).spawn().unwrap();

        logger.log_all((0..5).map(event));

        assert!(logger.flush(Duration::from_secs(10)).await);

        assert_eq!(vec!["e0", "e1", "e2", "e3", "e4"], transport.delivered());
        assert_eq!(3, transport.calls());
        assert_eq!(5, logger.metrics().sent);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_spill_and_reclaim_delivers() {
        let dir = tempfile::tempdir().unwrap();
        let transport =
            TestTransport::scripted([Outcome::Retryable, Outcome::Retryable, Outcome::Retryable]);

        let logger = builder(&transport)
            .flush_interval(Duration::from_millis(100))
            .max_retries(2)
            .backoff(Duration::from_secs(1), Duration::from_secs(30))
            .reclaim_interval(Duration::from_secs(5))
            .spillover_dir(dir.path())
            .spawn()
            .unwrap();

        assert!(logger.log(event(1)));

        // 3 attempts: at 100ms, then after 1s and 2s of backoff
        tokio::time::sleep(Duration::from_secs(4)).await;

        let metrics = logger.metrics();
        assert_eq!(3, transport.calls());
        assert_eq!(1, metrics.spilled);
        assert_eq!(1, metrics.spilled_pending);
        assert_eq!(3, metrics.consecutive_failures);
        assert!(transport.delivered().is_empty());

        // The queue is idle, so the next reclaim tick probes with the spilled batch
        tokio::time::sleep(Duration::from_secs(10)).await;

        let metrics = logger.metrics();
        assert_eq!(vec!["e1"], transport.delivered());
        assert_eq!(1, metrics.sent);
        assert_eq!(1, metrics.replayed);
        assert_eq!(0, metrics.spilled_pending);
        assert_eq!(0, metrics.consecutive_failures);
        assert_eq!(0, metrics.dropped);
    }

    #[tokio::test(start_paused = true)]
    async fn auth_failures_are_retried_without_sending() {
        let dir = tempfile::tempdir().unwrap();
        let transport = TestTransport::scripted([]);

        let logger = AsyncEventLogger::builder(
            transport.clone(),
            OAuthTokenProvider::builder(FailingSource).build(),
        )
        .flush_interval(Duration::from_millis(100))
        .max_retries(1)
        .spillover_dir(dir.path())
        .spawn()
        .unwrap();

        logger.log(event(1));

        tokio::time::sleep(Duration::from_secs(10)).await;

        let metrics = logger.metrics();
        assert_eq!(0, transport.calls());
        assert_eq!(2, metrics.auth_failed);
        assert_eq!(1, metrics.spilled);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_events_are_dropped_not_retried() {
        let transport = TestTransport::scripted([Outcome::Reject(vec![1])]);
        let logger = builder(&transport).batch_size(3).spawn().unwrap();

        logger.log_all((0..3).map(event));

        assert!(logger.flush(Duration::from_secs(10)).await);

        let metrics = logger.metrics();
        assert_eq!(1, transport.calls());
        assert_eq!(vec!["e0", "e2"], transport.delivered());
        assert_eq!(2, metrics.sent);
        assert_eq!(1, metrics.dropped);
        assert_eq!(1, metrics.discarded);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_failures_drop_the_batch() {
        let transport = TestTransport::scripted([Outcome::Terminal]);
        let logger = builder(&transport).batch_size(2).spawn().unwrap();

        logger.log_all((0..2).map(event));

        assert!(logger.flush(Duration::from_secs(10)).await);

        let metrics = logger.metrics();
        assert_eq!(1, transport.calls());
        assert_eq!(2, metrics.dropped);
        assert_eq!(0, metrics.consecutive_failures);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_is_idempotent_and_stops_accepting() {
        let transport = TestTransport::scripted([]);
        let logger = builder(&transport).spawn().unwrap();

        logger.log(event(1));

        assert_eq!(LoggerState::Running, logger.state());

        logger.shutdown(Duration::from_secs(5)).await.unwrap();
        logger.shutdown(Duration::from_secs(5)).await.unwrap();

        assert_eq!(LoggerState::Stopped, logger.state());
        assert_eq!(vec!["e1"], transport.delivered());

        assert!(!logger.log(event(2)));
        assert_eq!(1, logger.metrics().dropped);
    }

    #[tokio::test(start_paused = true)]
    async fn grace_expiry_spills_in_flight_and_queued_events() {
        let dir = tempfile::tempdir().unwrap();
        let transport = TestTransport::scripted([Outcome::Hang]);

        let logger = builder(&transport)
            .batch_size(2)
            .spillover_dir(dir.path())
            .spawn()
            .unwrap();

        logger.log_all((0..3).map(event));

        // Let the worker pick up the first batch and get stuck sending it
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(1, transport.calls());

        let err = logger
            .shutdown(Duration::from_secs(2))
            .await
            .unwrap_err();

        assert_eq!(3, err.spilled());
        assert_eq!(0, err.lost());

        assert_eq!(LoggerState::Stopped, logger.state());
        assert_eq!(3, logger.metrics().spilled_pending);
    }

    #[tokio::test(start_paused = true)]
    async fn grace_expiry_without_spillover_reports_losses() {
        let transport = TestTransport::scripted([Outcome::Hang]);
        let logger = builder(&transport).batch_size(1).spawn().unwrap();

        logger.log_all((0..2).map(event));

        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = logger
            .shutdown(Duration::from_secs(1))
            .await
            .unwrap_err();

        assert_eq!(0, err.spilled());
        assert_eq!(2, err.lost());
    }

    #[tokio::test(start_paused = true)]
    async fn accepted_events_are_conserved() {
        let dir = tempfile::tempdir().unwrap();
        let transport = TestTransport::scripted([
            Outcome::Accept,
            Outcome::Reject(vec![0, 3]),
            Outcome::Retryable,
            Outcome::Retryable,
            Outcome::Terminal,
            Outcome::Retryable,
            Outcome::Retryable,
        ]);

        let logger = builder(&transport)
            .batch_size(5)
            .max_retries(1)
            .backoff(Duration::from_millis(100), Duration::from_secs(1))
            .reclaim_interval(Duration::from_secs(5))
            .spillover_dir(dir.path())
            .spawn()
            .unwrap();

        assert_eq!(30, logger.log_all((0..30).map(event)));

        tokio::time::sleep(Duration::from_secs(60)).await;
        logger.shutdown(Duration::from_secs(30)).await.unwrap();

        let metrics = logger.metrics();

        assert_eq!(
            metrics.accepted,
            metrics.sent + metrics.spilled_pending as usize + metrics.discarded
        );
        assert_eq!(0, metrics.queue_depth);
    }

    #[tokio::test(start_paused = true)]
    async fn evicted_events_are_counted_as_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let transport = TestTransport::scripted([Outcome::Hang]);

        let logger = builder(&transport)
            .queue_capacity(1)
            .spillover(
                SpilloverBuilder::new(dir.path())
                    .max_segment_bytes(1)
                    .max_total_bytes(1000)
                    .evict_oldest(true),
            )
            .spawn()
            .unwrap();

        assert_eq!(100, logger.log_all((0..100).map(event)));

        let metrics = logger.metrics();
        let evicted = logger.spillover_metrics().unwrap().record_evicted();

        assert!(evicted > 0);
        assert_eq!(evicted, metrics.discarded);
        assert_eq!(evicted, metrics.dropped);
        assert_eq!(
            metrics.accepted,
            metrics.sent
                + metrics.spilled_pending as usize
                + metrics.discarded
                + metrics.queue_depth
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reclaim_yields_to_queued_events_during_an_outage() {
        let dir = tempfile::tempdir().unwrap();
        let transport = TestTransport::scripted((0..13).map(|_| Outcome::Retryable));

        let logger = builder(&transport)
            .queue_capacity(1)
            .batch_size(1)
            .max_retries(20)
            .backoff(Duration::from_secs(1), Duration::from_secs(1))
            .reclaim_interval(Duration::from_secs(5))
            .spillover_dir(dir.path())
            .spawn()
            .unwrap();

        assert!(logger.log(event(1)));
        // The queue is full, so this one is spilled
        assert!(logger.log(event(2)));
        assert_eq!(1, logger.metrics().spilled);

        // Let the worker take the first event and start failing
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(logger.log(event(3)));

        // Reclaim ticks at 5s and 10s while the outage continues and `e3` waits
        tokio::time::sleep(Duration::from_millis(11_500)).await;

        assert!(transport.attempted().iter().all(|id| id == "e1"));
        assert_eq!(0, logger.metrics().replayed);
        assert_eq!(1, logger.metrics().spilled_pending);

        // The service recovers at 13s and the next tick replays the spilled event
        tokio::time::sleep(Duration::from_secs(10)).await;

        let metrics = logger.metrics();
        assert_eq!(vec!["e1", "e3", "e2"], transport.delivered());
        assert_eq!(1, metrics.replayed);
        assert_eq!(0, metrics.spilled_pending);
    }

    #[tokio::test(start_paused = true)]
    async fn unauthorized_sends_retry_with_a_fresh_token() {
        let transport = TestTransport::scripted([Outcome::Unauthorized]);
        let source = Arc::new(CountingSource::default());

        let logger = AsyncEventLogger::builder(
            transport.clone(),
            OAuthTokenProvider::builder(source.clone()).build(),
        )
        .backoff(Duration::from_millis(100), Duration::from_secs(1))
        .spawn()
        .unwrap();

        logger.log(event(1));

        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(2, source.fetches.load(Ordering::SeqCst));
        assert_eq!(vec!["token-0", "token-1"], transport.tokens());
        assert_eq!(vec!["e1"], transport.delivered());
        assert_eq!(1, logger.metrics().sent);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_and_reclaim_never_send_at_the_same_time() {
        let dir = tempfile::tempdir().unwrap();
        let transport =
            TestTransport::scripted((0..40).map(|_| Outcome::Slow(Duration::from_millis(500))));

        let logger = builder(&transport)
            .queue_capacity(2)
            .batch_size(1)
            .reclaim_interval(Duration::from_millis(700))
            .spillover_dir(dir.path())
            .spawn()
            .unwrap();

        // Most of these overflow into the spillover store
        assert_eq!(10, logger.log_all((0..10).map(event)));

        // Keep live traffic flowing while the spilled events are replayed
        for n in 10..20 {
            assert!(logger.log(event(n)));
            tokio::time::sleep(Duration::from_millis(250)).await;
        }

        tokio::time::sleep(Duration::from_secs(60)).await;

        assert!(logger.metrics().replayed > 0);
        assert_eq!(1, transport.max_sending());

        let mut delivered = transport.delivered();
        delivered.sort();

        let mut expected = (0..20).map(|n| format!("e{n}")).collect::<Vec<_>>();
        expected.sort();

        assert_eq!(expected, delivered);
    }
}
