use std::{fmt, time::Duration};

/**
An error attempting to configure a logger.
*/
pub struct Error(Box<dyn std::error::Error + Send + Sync>);

impl Error {
    pub(crate) fn new(e: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Error(e.into())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

/**
A logger didn't finish flushing within its shutdown grace period.

This is a soft failure. Events that were still queued or in flight when the grace period ended were written to the spillover store where possible; only [`ShutdownError::lost`] events are gone.
*/
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownError {
    pub(crate) grace: Duration,
    pub(crate) spilled: usize,
    pub(crate) lost: usize,
}

impl ShutdownError {
    /**
    The grace period that elapsed.
    */
    pub fn grace(&self) -> Duration {
        self.grace
    }

    /**
    Unflushed events that were written to the spillover store instead.
    */
    pub fn spilled(&self) -> usize {
        self.spilled
    }

    /**
    Unflushed events that couldn't be secured anywhere.
    */
    pub fn lost(&self) -> usize {
        self.lost
    }
}

impl fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "failed to flush within {:?}; {} events were spilled and {} were lost",
            self.grace, self.spilled, self.lost
        )
    }
}

impl std::error::Error for ShutdownError {}
