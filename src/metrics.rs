/*!
Counters describing what a logger has done with the events it was given.
*/

use std::sync::atomic::{AtomicUsize, Ordering};

macro_rules! metrics {
    (
        $snapshot:ident: $internal_container:ident {
            $(
                $(#[$meta:meta])*
                $metric:ident: $ty:ident,
            )*
        }
        sampled {
            $(
                $(#[$sampled_meta:meta])*
                $sampled:ident: $sampled_ty:ty,
            )*
        }
    ) => {
        #[derive(Default)]
        pub(crate) struct $internal_container {
            $(
                pub(crate) $metric: $ty,
            )*
        }

        /**
        A point-in-time copy of a logger's metrics.
        */
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
        #[non_exhaustive]
        pub struct $snapshot {
            $(
                $(#[$meta])*
                pub $metric: usize,
            )*
            $(
                $(#[$sampled_meta])*
                pub $sampled: $sampled_ty,
            )*
        }

        impl $internal_container {
            pub(crate) fn snapshot(&self, $($sampled: $sampled_ty),*) -> $snapshot {
                $snapshot {
                    $(
                        $metric: self.$metric.sample(),
                    )*
                    $(
                        $sampled,
                    )*
                }
            }
        }
    };
}

#[derive(Default)]
pub(crate) struct Counter(AtomicUsize);

impl Counter {
    pub fn increment(&self) {
        self.increment_by(1);
    }

    pub fn increment_by(&self, by: usize) {
        self.0.fetch_add(by, Ordering::Relaxed);
    }

    pub fn sample(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
pub(crate) struct Gauge(AtomicUsize);

impl Gauge {
    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::Relaxed);
    }

    pub fn sample(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

metrics!(
    MetricsSnapshot: InternalMetrics {
        /**
        Events that were queued or spilled by `log`.
        */
        accepted: Counter,
        /**
        Events the remote service accepted, including replayed ones.
        */
        sent: Counter,
        /**
        Events that were lost, either because they couldn't be accepted or because they were discarded after acceptance.
        */
        dropped: Counter,
        /**
        Accepted events that were later lost.

        This includes events the remote service permanently rejected and events that couldn't be spilled after retries were exhausted.
        */
        discarded: Counter,
        /**
        Events written to the spillover store.
        */
        spilled: Counter,
        /**
        Events delivered from the spillover store.
        */
        replayed: Counter,
        /**
        Events that had identifiers, messages, or payloads cut to fit size limits.
        */
        truncated: Counter,
        /**
        Send attempts that failed because no token could be obtained.
        */
        auth_failed: Counter,
        /**
        Send attempts that have failed in a row.
        */
        consecutive_failures: Gauge,
    }
    sampled {
        /**
        Events currently waiting in the in-memory queue.
        */
        queue_depth: usize,
        /**
        Events in the spillover store that haven't been delivered yet.
        */
        spilled_pending: u64,
    }
);
