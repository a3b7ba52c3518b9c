/*!
Wait on channels from synchronous code.
*/

use std::{
    sync::{Arc, Condvar, Mutex},
    time::{Duration, Instant},
};

use crate::{Channel, Sender};

#[derive(Clone)]
struct Trigger(Arc<(Mutex<bool>, Condvar)>);

impl Trigger {
    fn new() -> Self {
        Trigger(Arc::new((Mutex::new(false), Condvar::new())))
    }

    fn trigger(self) {
        if let Ok(mut flushed) = (self.0).0.lock() {
            *flushed = true;
        }
        (self.0).1.notify_all();
    }

    fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        let Ok(mut flushed) = (self.0).0.lock() else {
            return false;
        };

        while !*flushed {
            let remaining = deadline.saturating_duration_since(Instant::now());

            if remaining.is_zero() {
                return false;
            }

            match (self.0).1.wait_timeout(flushed, remaining) {
                Ok((next_flushed, _)) => flushed = next_flushed,
                Err(_) => return false,
            }
        }

        true
    }
}

/**
Block the current thread until everything in the channel at the point this call was made has been processed, or `timeout` elapses.

This call should not be made on a thread that's driving the channel's receiver.
*/
pub fn blocking_flush<T: Channel>(sender: &Sender<T>, timeout: Duration) -> bool {
    let on_flush = Trigger::new();

    sender.on_next_flush({
        let on_flush = on_flush.clone();

        move || {
            on_flush.trigger();
        }
    });

    on_flush.wait_timeout(timeout)
}
