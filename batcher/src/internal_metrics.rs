use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

macro_rules! metrics {
    (
        $pub_container:ty {
            $field:ident: $internal_container:ident {
                $(
                    $(#[$meta:meta])*
                    $metric:ident: $ty:ident -> $pub_ty:ident,
                )*
            }
        }
    ) => {
        #[derive(Default)]
        pub(crate) struct $internal_container {
            $(
                $(#[$meta])*
                pub(crate) $metric: $ty,
            )*
        }

        impl $pub_container {
            $(
                $(#[$meta])*
                pub fn $metric(&self) -> $pub_ty {
                    self.$field.$metric.sample()
                }
            )*
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

/**
Metrics describing the health of a channel.
*/
#[derive(Clone)]
pub struct ChannelMetrics {
    pub(crate) metrics: Arc<InternalMetrics>,
}

metrics!(
    ChannelMetrics {
        metrics: InternalMetrics {
            /**
            An item was pushed while the queue was at capacity and was handed back to the caller.
            */
            queue_full: Counter -> usize,
            /**
            A batch was processed successfully.
            */
            queue_batch_processed: Counter -> usize,
            /**
            An attempt to process a batch failed.
            */
            queue_batch_failed: Counter -> usize,
            /**
            A failed batch was retried.
            */
            queue_batch_retry: Counter -> usize,
            /**
            A batch ran out of retries and was handed back to the caller.
            */
            queue_batch_exhausted: Counter -> usize,
            /**
            Processing a batch panicked.
            */
            queue_batch_panicked: Counter -> usize,
        }
    }
);
