/*!
Ship structured process events to a remote event log without blocking or losing them.

`evlog` is a client embedded in instrumented applications. Application code hands [`Event`]s to an [`AsyncEventLogger`], which queues them in memory, batches them, and sends them through a [`Transport`] in the background. Bearer tokens for each send come from a [`TokenProvider`].

# Getting started

```no_run
# async fn run(transport: impl evlog::Transport + 'static) -> Result<(), Box<dyn std::error::Error>> {
use std::time::Duration;

use evlog::{AsyncEventLogger, Event, EventKind, EventStatus, StaticTokenProvider};

let logger = AsyncEventLogger::builder(transport, StaticTokenProvider::new("my-token"))
    .spillover_dir("./spill")
    .spawn()?;

logger.log(
    Event::new(EventKind::ProcessStart, EventStatus::InProgress)
        .with_correlation_id("order-42")
        .with_process_name("checkout"),
);

logger.shutdown(Duration::from_secs(10)).await?;
# Ok(())
# }
```

# Delivery guarantees

Calls to [`AsyncEventLogger::log`] never block. When the in-memory queue is full, events are written straight to a [`DiskSpillover`] store if one is configured. Batches that keep failing are retried with a capped exponential backoff, then spilled to disk instead of being requeued. A background reclaim worker replays spilled events once the remote service is healthy again.

Delivery is at-least-once. An event may be sent more than once around a crash or a shutdown that runs out of time, but an accepted event is only lost if the remote service permanently rejects it or the spillover store can't take it.

# Diagnostics

The logger reports its own failures through `emit`'s internal runtime, so they never flow back into the logger being diagnosed. Counters describing what it's done with its events are available through [`AsyncEventLogger::metrics`].
*/

pub mod clock;
mod error;
pub mod event;
mod logger;
mod metrics;
pub mod token;
pub mod transport;

pub use self::{
    clock::{Clock, SystemClock},
    error::{Error, ShutdownError},
    event::{Event, EventKind, EventStatus},
    logger::{AsyncEventLogger, LoggerBuilder, LoggerState},
    metrics::MetricsSnapshot,
    token::{
        AuthError, OAuthTokenProvider, OAuthTokenProviderBuilder, StaticTokenProvider, Token,
        TokenProvider, TokenSource,
    },
    transport::{RejectedError, SendReport, Transport, TransportError},
};

#[doc(inline)]
pub use evlog_spill::{AppendError, Appended, DiskSpillover, SpillError, SpilloverBuilder};
