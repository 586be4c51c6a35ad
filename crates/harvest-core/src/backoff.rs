//! Exponential-backoff gate for flaky dependencies
//!
//! Wraps calls to an unreliable callee: while the callee is healthy every
//! caller is admitted; after a failure the gate closes and reopens for a
//! single probing thread at randomized, exponentially growing intervals.
//! The probe's success reopens the gate for everyone, its failure extends
//! the wait.
//!
//! ```
//! use std::time::Duration;
//! use harvest_core::backoff::Backoff;
//!
//! let gate = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
//! if gate.check() {
//!     let ok = true; // call the guarded dependency here
//!     gate.update(ok);
//! }
//! ```

use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;

use crate::types::{MonotonicClock, TimeSource};

// ----------------------------------------------------------------------------
// State
// ----------------------------------------------------------------------------

/// Gate state, guarded by one mutex
///
/// `interval` of zero means healthy. While `interval` is non-zero,
/// `retry_at` of `None` means a probe is in flight; `Some` is the next
/// time a caller may become the prober.
#[derive(Debug, Default)]
struct State {
    interval: Duration,
    retry_at: Option<Duration>,
}

/// Exponential-backoff gate, safe for concurrent use
pub struct Backoff<T: TimeSource = MonotonicClock> {
    base: Duration,
    max: Duration,
    clock: T,
    state: Mutex<State>,
}

impl Backoff<MonotonicClock> {
    /// Create a healthy gate with the given initial and maximum retry
    /// intervals
    pub fn new(base: Duration, max: Duration) -> Self {
        Self::with_clock(base, max, MonotonicClock::default())
    }
}

impl<T: TimeSource> Backoff<T> {
    /// Create a gate reading time from a caller-supplied clock
    pub fn with_clock(base: Duration, max: Duration, clock: T) -> Self {
        Self {
            base,
            max,
            clock,
            state: Mutex::new(State::default()),
        }
    }

    /// May the caller proceed with the guarded operation?
    ///
    /// Returns `true` on the healthy path, and for exactly one caller
    /// per retry window while the callee is failing. A caller that was
    /// admitted must report the outcome through [`update`].
    ///
    /// [`update`]: Backoff::update
    pub fn check(&self) -> bool {
        let mut state = self.state.lock().expect("backoff mutex poisoned");

        if state.interval.is_zero() {
            return true;
        }
        match state.retry_at {
            // Another thread is probing right now.
            None => false,
            Some(retry_at) if self.clock.now() >= retry_at => {
                // This caller becomes the prober; concurrent callers see
                // the None sentinel and are denied until it reports back.
                state.retry_at = None;
                true
            }
            Some(_) => false,
        }
    }

    /// Report the outcome of a guarded operation
    ///
    /// Success reopens the gate fully. A failure is only acted on when it
    /// comes from the designated prober (or from the healthy path); late
    /// failures reported while a retry window is already scheduled are
    /// dropped.
    pub fn update(&self, success: bool) {
        let mut state = self.state.lock().expect("backoff mutex poisoned");

        if success {
            state.interval = Duration::ZERO;
            state.retry_at = None;
            return;
        }
        if state.retry_at.is_some() {
            return;
        }

        state.interval = if state.interval.is_zero() {
            self.base.min(self.max)
        } else {
            (state.interval * 2).min(self.max)
        };

        // Spread the retries of collaborating collectors apart.
        let delay = rand::thread_rng().gen_range(state.interval / 2..=state.interval);
        state.retry_at = Some(self.clock.now() + delay);
    }

    /// Current retry interval; zero while the callee is healthy
    pub fn interval(&self) -> Duration {
        self.state.lock().expect("backoff mutex poisoned").interval
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
