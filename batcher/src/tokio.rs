/*!
Run channels in a `tokio` runtime.
*/

use std::{future::Future, time::Duration};

use crate::{BatchError, Channel, Receiver, Sender};

/**
Spawn a worker to run the [`Receiver`] on the current `tokio` runtime.

All delays are driven by [`tokio::time::sleep`], so a paused runtime clock drives them deterministically.
*/
pub fn spawn<
    T: Channel + Send + 'static,
    F: Future<Output = Result<(), BatchError<T>>> + Send + 'static,
>(
    receiver: Receiver<T>,
    on_batch: impl FnMut(T) -> F + Send + 'static,
    on_exhausted: impl FnMut(T) + Send + 'static,
) -> tokio::task::JoinHandle<()>
where
    T::Item: Send + 'static,
{
    tokio::spawn(async move {
        receiver
            .exec(tokio::time::sleep, on_batch, on_exhausted)
            .await
    })
}

/**
Wait for a channel to process all items active at the point this call was made.

Returns `false` if `timeout` elapsed first.
*/
pub async fn flush<T: Channel>(sender: &Sender<T>, timeout: Duration) -> bool {
    let (notifier, notified) = tokio::sync::oneshot::channel();

    sender.on_next_flush(move || {
        let _ = notifier.send(());
    });

    match tokio::time::timeout(timeout, notified).await {
        // The notifier was triggered
        Ok(Ok(())) => true,
        // Unexpected hangup; this should mean the channel was closed
        Ok(Err(_)) => true,
        // The timeout was reached instead
        Err(_) => false,
    }
}
