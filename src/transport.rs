/*!
The [`Transport`] contract for delivering batches to the remote event log.
*/

use std::{fmt, sync::Arc};

use crate::{
    token::{BoxFuture, Token},
    Event,
};

/**
A destination for batches of events.
*/
pub trait Transport: Send + Sync {
    /**
    Send a batch of events, authenticated with the given token.

    A successful send may still report individual events as rejected. Those events will never be retried.
    */
    fn send<'a>(
        &'a self,
        batch: &'a [Event],
        token: &'a Token,
    ) -> BoxFuture<'a, Result<SendReport, TransportError>>;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn send<'a>(
        &'a self,
        batch: &'a [Event],
        token: &'a Token,
    ) -> BoxFuture<'a, Result<SendReport, TransportError>> {
        (**self).send(batch, token)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send<'a>(
        &'a self,
        batch: &'a [Event],
        token: &'a Token,
    ) -> BoxFuture<'a, Result<SendReport, TransportError>> {
        (**self).send(batch, token)
    }
}

/**
The outcome of a batch the remote service accepted.
*/
#[derive(Debug, Clone, Default)]
pub struct SendReport {
    rejected: Vec<RejectedError>,
}

impl SendReport {
    /**
    Every event in the batch was accepted.
    */
    pub fn accepted() -> Self {
        SendReport::default()
    }

    /**
    Some events in the batch were permanently rejected.
    */
    pub fn with_rejected(rejected: impl IntoIterator<Item = RejectedError>) -> Self {
        SendReport {
            rejected: rejected.into_iter().collect(),
        }
    }

    pub fn rejected(&self) -> &[RejectedError] {
        &self.rejected
    }

    /**
    The number of distinct events in a batch of `batch_len` that were rejected.

    Out of range or repeated indexes are ignored.
    */
    pub fn rejected_count(&self, batch_len: usize) -> usize {
        let mut indexes = self
            .rejected
            .iter()
            .map(|rejected| rejected.index)
            .filter(|index| *index < batch_len)
            .collect::<Vec<_>>();

        indexes.sort_unstable();
        indexes.dedup();

        indexes.len()
    }
}

/**
An event the remote service refused to accept.
*/
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedError {
    index: usize,
    reason: String,
}

impl RejectedError {
    pub fn new(index: usize, reason: impl Into<String>) -> Self {
        RejectedError {
            index,
            reason: reason.into(),
        }
    }

    /**
    The position of the rejected event within its batch.
    */
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl fmt::Display for RejectedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event {} was rejected: {}", self.index, self.reason)
    }
}

impl std::error::Error for RejectedError {}

/**
A failure to deliver a whole batch.
*/
pub struct TransportError {
    kind: TransportErrorKind,
    source: Box<dyn std::error::Error + Send + Sync>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransportErrorKind {
    Retryable,
    Unauthorized,
    Terminal,
}

impl TransportError {
    /**
    A transient failure, like a network error, timeout, or `5xx` response.
    */
    pub fn retryable(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        TransportError {
            kind: TransportErrorKind::Retryable,
            source: err.into(),
        }
    }

    /**
    The token was refused.

    These failures are retried with a freshly fetched token.
    */
    pub fn unauthorized(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        TransportError {
            kind: TransportErrorKind::Unauthorized,
            source: err.into(),
        }
    }

    /**
    A permanent failure, like a `4xx` validation response.

    Retrying the batch would fail the same way, so it's dropped.
    */
    pub fn terminal(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        TransportError {
            kind: TransportErrorKind::Terminal,
            source: err.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind != TransportErrorKind::Terminal
    }

    pub fn is_unauthorized(&self) -> bool {
        self.kind == TransportErrorKind::Unauthorized
    }
}

impl fmt::Debug for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportError")
            .field("kind", &self.kind)
            .field("source", &self.source)
            .finish()
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.source, f)
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.source)
    }
}
