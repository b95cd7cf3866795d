//! Retry delays with jittered, capped back-off.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

/// Maps a 1-based attempt number to the delay before that attempt.
pub trait RetryDelayCalculator: Send + Sync {
    fn delay(&self, attempt: u32) -> Duration;
}

impl<F> RetryDelayCalculator for F
where
    F: Fn(u32) -> Duration + Send + Sync,
{
    fn delay(&self, attempt: u32) -> Duration {
        self(attempt)
    }
}

/// `initial * min((n + 2) / 3, 2) * jitter`, jitter in `[0.8, 1.0]`.
///
/// The first attempt waits the initial delay (minus jitter), growing to
/// twice the initial delay from the fourth attempt on.
#[derive(Debug, Clone)]
pub struct BackoffRetryDelayCalculator {
    initial: Duration,
    seed: u32,
}

impl BackoffRetryDelayCalculator {
    pub fn new(initial: Duration) -> Self {
        let bytes = Uuid::new_v4().into_bytes();
        let seed = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        Self { initial, seed }
    }

    fn backoff_coefficient(attempt: u32) -> f64 {
        ((attempt as f64 + 2.0) / 3.0).min(2.0)
    }

    fn jitter_coefficient(&self, attempt: u32) -> f64 {
        1.0 - 0.2 * pseudo_random_fraction(self.seed.wrapping_add(attempt))
    }
}

impl RetryDelayCalculator for BackoffRetryDelayCalculator {
    fn delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let factor = Self::backoff_coefficient(attempt) * self.jitter_coefficient(attempt);
        self.initial.mul_f64(factor)
    }
}

/// Same delay for every attempt.
#[derive(Debug, Clone, Copy)]
pub struct FixedDelay(pub Duration);

impl RetryDelayCalculator for FixedDelay {
    fn delay(&self, _attempt: u32) -> Duration {
        self.0
    }
}

/// Cheap deterministic "random" fraction in [0, 1).
fn pseudo_random_fraction(x: u32) -> f64 {
    let hash = x.wrapping_mul(2654435761); // Knuth multiplicative hash
    (hash as f64) / (u32::MAX as f64 + 1.0)
}

// ── Scheduler ───────────────────────────────────────────────────────

/// One recorded retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryAttempt {
    /// Correlates log lines for one attempt.
    pub id: Uuid,
    /// 1-based attempt number within the current sequence.
    pub number: u32,
    pub delay: Duration,
}

/// Counts attempts of one retry sequence and reports the delay for each.
///
/// Performs no timing itself; the caller arms a timer for the returned delay.
#[derive(Clone)]
pub struct RetryScheduler {
    calculator: Arc<dyn RetryDelayCalculator>,
    attempts: u32,
}

impl RetryScheduler {
    pub fn new(calculator: Arc<dyn RetryDelayCalculator>) -> Self {
        Self {
            calculator,
            attempts: 0,
        }
    }

    pub fn record_attempt(&mut self) -> RetryAttempt {
        self.attempts = self.attempts.saturating_add(1);
        let attempt = RetryAttempt {
            id: Uuid::new_v4(),
            number: self.attempts,
            delay: self.calculator.delay(self.attempts),
        };
        tracing::debug!(
            retry_id = %attempt.id,
            attempt = attempt.number,
            delay_ms = attempt.delay.as_millis() as u64,
            "retry scheduled"
        );
        attempt
    }

    /// Start a new, independent sequence.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

impl fmt::Debug for RetryScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryScheduler")
            .field("attempts", &self.attempts)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scripted(delays: &'static [u64]) -> Arc<dyn RetryDelayCalculator> {
        Arc::new(move |n: u32| Duration::from_millis(delays[(n - 1) as usize]))
    }

    #[test]
    fn reports_calculator_delays_in_order() {
        let mut s = RetryScheduler::new(scripted(&[100, 300, 900]));
        let delays: Vec<_> = (0..3).map(|_| s.record_attempt()).collect();
        assert_eq!(
            delays.iter().map(|a| a.delay).collect::<Vec<_>>(),
            vec![
                Duration::from_millis(100),
                Duration::from_millis(300),
                Duration::from_millis(900)
            ]
        );
        assert_eq!(
            delays.iter().map(|a| a.number).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn reset_restarts_numbering() {
        let mut s = RetryScheduler::new(scripted(&[100, 300, 900]));
        s.record_attempt();
        s.record_attempt();
        s.reset();
        assert_eq!(s.attempts(), 0);
        let a = s.record_attempt();
        assert_eq!(a.number, 1);
        assert_eq!(a.delay, Duration::from_millis(100));
    }

    #[test]
    fn backoff_stays_within_jitter_bounds() {
        let c = BackoffRetryDelayCalculator::new(Duration::from_secs(15));
        for n in 1..20 {
            let d = c.delay(n).as_secs_f64();
            let base = 15.0 * ((n as f64 + 2.0) / 3.0).min(2.0);
            assert!(d <= base + 1e-9, "attempt {n}: {d} > {base}");
            assert!(d >= base * 0.8 - 1e-9, "attempt {n}: {d} < {}", base * 0.8);
        }
    }

    #[test]
    fn backoff_is_capped_at_twice_initial() {
        let c = BackoffRetryDelayCalculator::new(Duration::from_secs(10));
        assert!(c.delay(50) <= Duration::from_secs(20));
        assert!(c.delay(1) <= Duration::from_secs(10));
    }

    #[test]
    fn fixed_delay_ignores_attempt() {
        let f = FixedDelay(Duration::from_secs(30));
        assert_eq!(f.delay(1), f.delay(9));
    }
}
