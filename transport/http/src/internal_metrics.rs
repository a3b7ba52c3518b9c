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
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sample(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

/**
Metrics describing the HTTP connections and requests made by a transport or token source.
*/
#[derive(Clone)]
pub struct HttpMetrics {
    pub(crate) metrics: Arc<InternalMetrics>,
}

metrics!(
    HttpMetrics {
        metrics: InternalMetrics {
            /**
            A connection to the remote service was established.
            */
            transport_conn_established: Counter -> usize,
            /**
            Attempting to connect to the remote service failed.
            */
            transport_conn_failed: Counter -> usize,
            /**
            A TLS handshake was made.
            */
            transport_conn_tls_handshake: Counter -> usize,
            /**
            Attempting to make a TLS handshake failed.
            */
            transport_conn_tls_failed: Counter -> usize,
            /**
            A request was sent.
            */
            transport_request_sent: Counter -> usize,
            /**
            Attempting to send a request failed.
            */
            transport_request_failed: Counter -> usize,
            /**
            A request didn't complete within its timeout.
            */
            transport_request_timeout: Counter -> usize,
            /**
            A request body was compressed using gzip.
            */
            transport_request_compress_gzip: Counter -> usize,
            /**
            The remote service responded with a non-success status code.
            */
            transport_response_status_failed: Counter -> usize,
            /**
            A response body couldn't be understood.
            */
            transport_response_undecodable: Counter -> usize,
        }
    }
);
