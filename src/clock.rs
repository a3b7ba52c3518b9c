/*!
The [`Clock`] type.

Clocks are used to decide whether tokens are still fresh. Delays like flush intervals and retry backoff are driven by `tokio`'s timer instead, so they can be paused and advanced deterministically in tests.
*/

use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

/**
A service to get the current wall-clock time.
*/
pub trait Clock {
    /**
    Read the current time.
    */
    fn now(&self) -> SystemTime;
}

impl<'a, T: Clock + ?Sized> Clock for &'a T {
    fn now(&self) -> SystemTime {
        (**self).now()
    }
}

impl<T: Clock + ?Sized> Clock for Box<T> {
    fn now(&self) -> SystemTime {
        (**self).now()
    }
}

impl<T: Clock + ?Sized> Clock for Arc<T> {
    fn now(&self) -> SystemTime {
        (**self).now()
    }
}

/**
A [`Clock`] based on the operating system's clock.
*/
#[derive(Default, Debug, Clone, Copy)]
pub struct SystemClock {}

impl SystemClock {
    /**
    Create a new instance of the system clock.
    */
    pub const fn new() -> Self {
        SystemClock {}
    }
}

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

pub(crate) fn until(clock: &(impl Clock + ?Sized), at: SystemTime) -> Duration {
    at.duration_since(clock.now()).unwrap_or_default()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use std::sync::Mutex;

    /**
    A clock that only moves when it's told to.
    */
    pub(crate) struct FakeClock(Mutex<SystemTime>);

    impl FakeClock {
        pub(crate) fn new() -> Self {
            FakeClock(Mutex::new(SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000)))
        }

        pub(crate) fn advance(&self, by: Duration) {
            *self.0.lock().unwrap() += by;
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> SystemTime {
            *self.0.lock().unwrap()
        }
    }

    #[test]
    fn until_saturates_at_zero() {
        let clock = FakeClock::new();
        let past = clock.now() - Duration::from_secs(1);

        assert_eq!(Duration::ZERO, until(&clock, past));

        let future = clock.now() + Duration::from_secs(5);
        clock.advance(Duration::from_secs(2));

        assert_eq!(Duration::from_secs(3), until(&clock, future));
    }
}
