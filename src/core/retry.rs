use std::time::Duration;

use rand::Rng;

use crate::transfer::{TransferError, TransferErrorKind};

/// Base delay for the exponential backoff window.
pub(crate) const BACKOFF_BASE: Duration = Duration::from_millis(25);
/// The backoff window stops growing after this many doublings.
pub(crate) const BACKOFF_EXPONENT_CAP: u32 = 5;
/// Least HTTP status treated as retry-worthy.
pub(crate) const LEAST_RETRYABLE_STATUS: u16 = 500;

/// Per-request retry configuration: how many attempts the request may use in
/// total, and whether transport errors (as opposed to `5xx` responses) are a
/// reason to retry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetrySettings {
    attempts: u16,
    on_transport_failure: bool,
}

impl RetrySettings {
    /// `attempts` is clamped to at least one.
    pub fn new(attempts: u16, on_transport_failure: bool) -> Self {
        Self {
            attempts: attempts.max(1),
            on_transport_failure,
        }
    }

    pub fn single() -> Self {
        Self::new(1, false)
    }

    pub fn attempts(self) -> u16 {
        self.attempts
    }

    pub fn on_transport_failure(self) -> bool {
        self.on_transport_failure
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self::single()
    }
}

/// What to do after an attempt completes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RetryVerdict {
    Finish,
    Retry { delay: Duration },
}

/// Tracks attempts across the lifetime of one request. `attempts_used`
/// starts at one and only ever grows, never past `settings.attempts()`.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RetryState {
    settings: RetrySettings,
    attempts_used: u16,
}

impl RetryState {
    pub(crate) fn new(settings: RetrySettings) -> Self {
        Self {
            settings,
            attempts_used: 1,
        }
    }

    pub(crate) fn settings(&self) -> RetrySettings {
        self.settings
    }

    pub(crate) fn attempts_used(&self) -> u16 {
        self.attempts_used
    }

    /// The retry predicate. Finish when the attempt produced a response with
    /// a non-retryable status, when every configured attempt has been used,
    /// when a transport error occurred and transport errors are not a retry
    /// reason, or when the transfer was cancelled (terminal from any state).
    /// The delay is drawn from the backoff window of the attempt index
    /// *before* the increment.
    pub(crate) fn decide(&self, error: Option<&TransferError>, status: u16) -> RetryVerdict {
        let finished = (error.is_none() && status < LEAST_RETRYABLE_STATUS)
            || self.attempts_used >= self.settings.attempts
            || (error.is_some() && !self.settings.on_transport_failure)
            || error.is_some_and(|error| error.kind == TransferErrorKind::Cancelled);
        if finished {
            RetryVerdict::Finish
        } else {
            RetryVerdict::Retry {
                delay: backoff_delay(self.attempts_used),
            }
        }
    }

    pub(crate) fn note_retry_scheduled(&mut self) {
        self.attempts_used += 1;
    }
}

/// Delay before the next attempt when `attempt_index` attempts have already
/// been used: `base * (U[0, 2^min(i-1, cap)] + 1)` with an inclusive uniform
/// draw, so the first backoff is 25-50ms, the second 25-75ms, and the window
/// stops growing after the fifth.
pub(crate) fn backoff_delay(attempt_index: u16) -> Duration {
    let exponent = u32::from(attempt_index.saturating_sub(1)).min(BACKOFF_EXPONENT_CAP);
    let window = 1_u32 << exponent;
    let drawn = rand::rng().random_range(0..=window);
    BACKOFF_BASE * (drawn + 1)
}

/// Worst-case total backoff over a full retry sequence: the sum of each
/// window's maximum delay for attempts `1..attempts`.
pub(crate) fn max_backoff_total(attempts: u16) -> Duration {
    let mut total = Duration::ZERO;
    for attempt_index in 1..attempts {
        let exponent = u32::from(attempt_index - 1).min(BACKOFF_EXPONENT_CAP);
        total += BACKOFF_BASE * ((1 << exponent) + 1);
    }
    total
}

/// Overall wall-clock budget for the whole retry sequence: every attempt's
/// transfer timeout with 10% slack, plus the worst-case backoff between
/// attempts. A zero per-attempt timeout means "engine default", for which no
/// aggregate deadline is attached.
pub(crate) fn aggregate_timeout(per_attempt: Duration, attempts: u16) -> Option<Duration> {
    if per_attempt.is_zero() {
        return None;
    }
    let attempts_ms = (per_attempt.as_millis() as f64 * 1.1 * f64::from(attempts)).ceil() as u64;
    Some(Duration::from_millis(attempts_ms) + max_backoff_total(attempts))
}
