use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Exponential backoff: `base_delay * multiplier^attempt`, capped at `max_delay`.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl BackoffPolicy {
    /// Delay to wait after the zero-based `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(64) as i32);
        let secs = self.base_delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// Longest span a deadline is allowed to cover.
pub const MAX_DEADLINE_SPAN: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// `start + span`, with `span` capped at [`MAX_DEADLINE_SPAN`].
pub fn deadline_after(start: Instant, span: Duration) -> Instant {
    start + span.min(MAX_DEADLINE_SPAN)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollAttempt {
    /// Zero-based.
    pub attempt_number: u32,
    pub next_delay: Duration,
    pub deadline: Instant,
}

/// What a single probe observed.
#[derive(Debug)]
pub enum Probe<T, E> {
    Ready(T),
    /// Not there yet; try again after the backoff.
    Pending,
    /// A transient error; try again after the backoff.
    Retry(String),
    Fail(E),
}

#[derive(Debug, PartialEq, Eq)]
pub enum PollOutcome<T, E> {
    Ready(T),
    Failed(E),
    Timeout {
        attempts: u32,
        last_error: Option<String>,
    },
    Cancelled {
        attempts: u32,
    },
}

/// Runs `probe` until it settles, the deadline passes, or `cancel` fires.
///
/// The first probe runs immediately. Sleeps never extend past `deadline`, and
/// cancellation interrupts a sleep in progress.
pub async fn poll_until<T, E, F, Fut>(
    policy: &BackoffPolicy,
    deadline: Instant,
    cancel: &CancellationToken,
    mut probe: F,
) -> PollOutcome<T, E>
where
    F: FnMut(PollAttempt) -> Fut,
    Fut: Future<Output = Probe<T, E>>,
{
    let mut attempts = 0u32;
    let mut last_error = None;

    loop {
        if cancel.is_cancelled() {
            return PollOutcome::Cancelled { attempts };
        }
        if attempts > 0 && Instant::now() >= deadline {
            return PollOutcome::Timeout {
                attempts,
                last_error,
            };
        }

        let next_delay = policy.delay_for(attempts);
        let attempt = PollAttempt {
            attempt_number: attempts,
            next_delay,
            deadline,
        };
        let result = probe(attempt).await;
        attempts += 1;

        match result {
            Probe::Ready(value) => return PollOutcome::Ready(value),
            Probe::Fail(err) => return PollOutcome::Failed(err),
            Probe::Pending => {}
            Probe::Retry(err) => {
                tracing::debug!(attempt = attempts, error = %err, "transient poll failure");
                last_error = Some(err);
            }
        }

        if cancel.is_cancelled() {
            return PollOutcome::Cancelled { attempts };
        }
        let now = Instant::now();
        if now >= deadline {
            return PollOutcome::Timeout {
                attempts,
                last_error,
            };
        }
        let wake_at = now.checked_add(next_delay).map_or(deadline, |at| at.min(deadline));
        tokio::select! {
            _ = cancel.cancelled() => return PollOutcome::Cancelled { attempts },
            _ = tokio::time::sleep_until(wake_at) => {}
        }
    }
}
