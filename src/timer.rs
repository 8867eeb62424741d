//! Abstractions over wall-clock time.
//!
//! Everything in this crate that reads the clock or waits does so through a
//! [`Timer`] so that tests can drive time deterministically with a
//! [`MockTimer`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::task::Context;
use std::task::Poll;
use std::task::Waker;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;

use crate::runtime;

/// The number of milliseconds in a second.
pub const SECOND_MS: i64 = 1000;

/// The number of milliseconds in a minute.
pub const MINUTE_MS: i64 = 60 * SECOND_MS;

/// The number of milliseconds in a year.
pub const YEAR_MS: i64 = 365 * 24 * 60 * MINUTE_MS;

/// A source of the current time and of sleeps.
pub trait Timer: Send + Sync + 'static {
    /// Gets the current time in milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64;

    /// Gets the current time in microseconds since the Unix epoch.
    fn now_us(&self) -> i64 {
        self.now_ms() * 1000
    }

    /// Returns a future that completes once the clock reaches the given
    /// deadline.
    ///
    /// The deadline is absolute so that a sleep requested before the returned
    /// future is first polled is still measured from the time of the request.
    fn sleep_until_ms(&self, deadline_ms: i64) -> BoxFuture<'static, ()>;
}

/// A timer backed by the system clock and the async runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimer;

impl Timer for SystemTimer {
    fn now_ms(&self) -> i64 {
        ms_from_system_time(SystemTime::now())
    }

    fn now_us(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_micros()).unwrap_or(i64::MAX))
            .unwrap_or_default()
    }

    fn sleep_until_ms(&self, deadline_ms: i64) -> BoxFuture<'static, ()> {
        let remaining = deadline_ms - self.now_ms();
        async move {
            if remaining > 0 {
                runtime::sleep(Duration::from_millis(remaining as u64)).await;
            }
        }
        .boxed()
    }
}

/// State shared between a [`MockTimer`] and its clones.
#[derive(Debug)]
struct MockState {
    /// The current mock time.
    now_ms: AtomicI64,
    /// Pending sleeps and the deadline each is waiting for.
    sleepers: Mutex<Vec<(i64, Waker)>>,
}

/// A manually advanced timer for tests.
///
/// Time only moves when [`MockTimer::advance_ms`] or
/// [`MockTimer::set_time_ms`] is called; any sleep whose deadline has been
/// reached is woken at that point.
#[derive(Debug, Clone)]
pub struct MockTimer(Arc<MockState>);

impl MockTimer {
    /// A fixed, arbitrary starting time (April 5th, 2010).
    pub const DEFAULT_START_MS: i64 = 1_270_493_486_000;

    /// Creates a new mock timer starting at the given time.
    pub fn new(start_ms: i64) -> Self {
        Self(Arc::new(MockState {
            now_ms: AtomicI64::new(start_ms),
            sleepers: Mutex::new(Vec::new()),
        }))
    }

    /// Advances the clock by the given number of milliseconds.
    pub fn advance_ms(&self, delta_ms: i64) {
        self.0.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
        self.wake_expired();
    }

    /// Sets the clock to the given time.
    pub fn set_time_ms(&self, now_ms: i64) {
        self.0.now_ms.store(now_ms, Ordering::SeqCst);
        self.wake_expired();
    }

    /// Wakes every sleeper whose deadline has passed.
    fn wake_expired(&self) {
        let now = self.0.now_ms.load(Ordering::SeqCst);
        let mut woken = Vec::new();
        {
            let mut sleepers = self.0.sleepers.lock();
            sleepers.retain(|(deadline, waker)| {
                if *deadline <= now {
                    woken.push(waker.clone());
                    false
                } else {
                    true
                }
            });
        }

        for waker in woken {
            waker.wake();
        }
    }
}

impl Default for MockTimer {
    fn default() -> Self {
        Self::new(Self::DEFAULT_START_MS)
    }
}

impl Timer for MockTimer {
    fn now_ms(&self) -> i64 {
        self.0.now_ms.load(Ordering::SeqCst)
    }

    fn sleep_until_ms(&self, deadline_ms: i64) -> BoxFuture<'static, ()> {
        MockSleep {
            state: self.0.clone(),
            deadline_ms,
        }
        .boxed()
    }
}

/// A sleep on a [`MockTimer`].
struct MockSleep {
    /// The timer state.
    state: Arc<MockState>,
    /// The time at which the sleep completes.
    deadline_ms: i64,
}

impl Future for MockSleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        // The clock is checked under the sleeper lock so an advance cannot slip
        // between the check and the registration
        let mut sleepers = self.state.sleepers.lock();
        if self.state.now_ms.load(Ordering::SeqCst) >= self.deadline_ms {
            return Poll::Ready(());
        }

        sleepers.push((self.deadline_ms, cx.waker().clone()));
        Poll::Pending
    }
}

/// Converts milliseconds since the Unix epoch into a [`SystemTime`].
pub(crate) fn system_time_from_ms(ms: i64) -> SystemTime {
    if ms >= 0 {
        UNIX_EPOCH + Duration::from_millis(ms as u64)
    } else {
        UNIX_EPOCH - Duration::from_millis(ms.unsigned_abs())
    }
}

/// Converts a [`SystemTime`] into milliseconds since the Unix epoch.
pub(crate) fn ms_from_system_time(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => i64::try_from(d.as_millis()).unwrap_or(i64::MAX),
        Err(e) => -i64::try_from(e.duration().as_millis()).unwrap_or(i64::MAX),
    }
}
