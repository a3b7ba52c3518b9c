/*!
Ship `evlog` events to a remote event log over HTTP.

This library provides two pieces:

- [`HttpTransport`], an [`evlog::Transport`] that POSTs batches of events as JSON.
- [`ClientCredentialsSource`], an [`evlog::token::TokenSource`] that requests tokens from an OAuth 2.0 identity provider.

# Getting started

```no_run
# async fn run() -> Result<(), Box<dyn std::error::Error>> {
use std::time::Duration;

use evlog::{AsyncEventLogger, OAuthTokenProvider};
use evlog_http::{ClientCredentialsSource, HttpTransport};

let transport = HttpTransport::builder("https://events.example.com/v1/events").build()?;

let tokens = OAuthTokenProvider::builder(
    ClientCredentialsSource::builder(
        "https://login.example.com/oauth2/token",
        "my-client",
        "my-secret",
    )
    .scope("events:write")
    .build()?,
)
.build();

let logger = AsyncEventLogger::builder(transport, tokens).spawn()?;

// ..

logger.shutdown(Duration::from_secs(10)).await?;
# Ok(())
# }
```

# Cargo features

- `tls` (default): Support `https` URLs using `rustls` and the platform's native certificates.
- `gzip` (default): Compress request bodies sent over plaintext connections.

# Diagnostics

Failures are reported through `emit`'s internal runtime. Counters for connections and requests are available through [`HttpTransport::metrics`] and [`ClientCredentialsSource::metrics`].
*/

#![deny(missing_docs)]

use std::fmt;

mod client;
mod internal_metrics;
mod oauth;
mod transport;
mod wire;

pub use self::{
    internal_metrics::HttpMetrics,
    oauth::{ClientCredentialsBuilder, ClientCredentialsSource},
    transport::{HttpTransport, HttpTransportBuilder, DEFAULT_REQUEST_TIMEOUT},
};

/**
An error attempting to configure or use an HTTP connection.
*/
pub struct Error {
    msg: String,
    cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    pub(crate) fn new(
        msg: impl fmt::Display,
        e: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error {
            msg: msg.to_string(),
            cause: Some(Box::new(e)),
        }
    }

    pub(crate) fn msg(msg: impl fmt::Display) -> Self {
        Error {
            msg: msg.to_string(),
            cause: None,
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg)?;

        if let Some(ref cause) = self.cause {
            write!(f, ": {cause}")?;
        }

        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|source| &**source as &(dyn std::error::Error + 'static))
    }
}
