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
Metrics describing the health of a spillover store.
*/
#[derive(Clone)]
pub struct SpilloverMetrics {
    pub(crate) metrics: Arc<InternalMetrics>,
}

metrics!(
    SpilloverMetrics {
        metrics: InternalMetrics {
            /**
            A segment file was created.
            */
            segment_created: Counter -> usize,
            /**
            Attempting to create a segment file failed.
            */
            segment_create_failed: Counter -> usize,
            /**
            Attempting to read a segment file failed.
            */
            segment_read_failed: Counter -> usize,
            /**
            Attempting to write or sync a segment file failed.
            */
            segment_write_failed: Counter -> usize,
            /**
            A fully acknowledged segment file was deleted.
            */
            segment_deleted: Counter -> usize,
            /**
            Attempting to delete a segment file failed.
            */
            segment_delete_failed: Counter -> usize,
            /**
            A segment was deleted to make room for new records.
            */
            segment_evicted: Counter -> usize,
            /**
            A record was appended.
            */
            record_appended: Counter -> usize,
            /**
            A record was acknowledged.
            */
            record_acknowledged: Counter -> usize,
            /**
            A record was rejected because the store was full.
            */
            record_rejected_full: Counter -> usize,
            /**
            An unacknowledged record was lost when its segment was evicted.
            */
            record_evicted: Counter -> usize,
            /**
            A corrupt record was found, ending its segment.
            */
            record_corrupt: Counter -> usize,
            /**
            An intact record couldn't be deserialized and was skipped.
            */
            record_undecodable: Counter -> usize,
            /**
            Attempting to persist a segment's acknowledged position failed.
            */
            cursor_write_failed: Counter -> usize,
        }
    }
);
