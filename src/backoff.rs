//! Wait strategies deciding how long to sleep between attempts.
//!
//! Every strategy receives the configured `min`/`max` bounds, the 0-based
//! index of the attempt that just failed and the last response (if any).
//! Results never exceed `max`, except [`LinearJitter`] with `max <= min`,
//! which degenerates to `min * (attempt + 1)`.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use rand::{rngs::StdRng, Rng, SeedableRng};
use reqwest::Response;

/// Computes the delay before the next attempt.
pub trait WaitStrategy: Send + Sync {
    fn wait(
        &self,
        min: Duration,
        max: Duration,
        attempt: usize,
        last_response: Option<&Response>,
    ) -> Duration;
}

impl<F> WaitStrategy for F
where
    F: Fn(Duration, Duration, usize, Option<&Response>) -> Duration + Send + Sync,
{
    fn wait(
        &self,
        min: Duration,
        max: Duration,
        attempt: usize,
        last_response: Option<&Response>,
    ) -> Duration {
        self(min, max, attempt, last_response)
    }
}

/// `min * 2^attempt`, capped at `max`.
#[derive(Clone, Copy, Debug, Default)]
pub struct Exponential;

impl WaitStrategy for Exponential {
    fn wait(&self, min: Duration, max: Duration, attempt: usize, _: Option<&Response>) -> Duration {
        cap(exponential_nanos(min, attempt), max)
    }
}

/// `(min + uniform[0, max - min)) * (attempt + 1)`, capped at `max`.
#[derive(Debug)]
pub struct LinearJitter {
    source: JitterSource,
}

impl LinearJitter {
    pub fn new() -> Self {
        Self {
            source: JitterSource::from_entropy(),
        }
    }

    /// Reproducible sequence for tests and simulations.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            source: JitterSource::seeded(seed),
        }
    }
}

impl Default for LinearJitter {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitStrategy for LinearJitter {
    fn wait(&self, min: Duration, max: Duration, attempt: usize, _: Option<&Response>) -> Duration {
        let steps = attempt as u128 + 1;
        if max <= min {
            return from_nanos(min.as_nanos().saturating_mul(steps));
        }
        let span = max.as_nanos() - min.as_nanos();
        let jittered = self.source.fraction_of(span) + min.as_nanos();
        cap(jittered.saturating_mul(steps), max)
    }
}

/// Uniform draw over `[0, attempt * 2s - attempt ns)` plus `min`, capped at `max`.
///
/// The range is empty on the first attempt, which yields exactly `min`.
#[derive(Debug)]
pub struct FullJitter {
    source: JitterSource,
}

const FULL_JITTER_UNIT: Duration = Duration::from_secs(2);

impl FullJitter {
    pub fn new() -> Self {
        Self {
            source: JitterSource::from_entropy(),
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            source: JitterSource::seeded(seed),
        }
    }
}

impl Default for FullJitter {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitStrategy for FullJitter {
    fn wait(&self, min: Duration, max: Duration, attempt: usize, _: Option<&Response>) -> Duration {
        let attempt = attempt as u128;
        let range = attempt
            .saturating_mul(FULL_JITTER_UNIT.as_nanos())
            .saturating_sub(attempt);
        let draw = if range == 0 {
            0
        } else {
            self.source.below(range)
        };
        cap(draw.saturating_add(min.as_nanos()), max)
    }
}

/// `min * 2^attempt` plus a uniform addend below `base - min`, capped at `max`.
#[derive(Debug)]
pub struct ExponentialJitter {
    source: JitterSource,
}

impl ExponentialJitter {
    pub fn new() -> Self {
        Self {
            source: JitterSource::from_entropy(),
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            source: JitterSource::seeded(seed),
        }
    }
}

impl Default for ExponentialJitter {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitStrategy for ExponentialJitter {
    fn wait(&self, min: Duration, max: Duration, attempt: usize, _: Option<&Response>) -> Duration {
        let base = exponential_nanos(min, attempt);
        let span = base.saturating_sub(min.as_nanos());
        cap(base.saturating_add(self.source.fraction_of(span)), max)
    }
}

/// Random source owned by one strategy instance. The mutex lets a single
/// instance serve concurrent calls.
#[derive(Debug)]
struct JitterSource(Mutex<StdRng>);

impl JitterSource {
    fn from_entropy() -> Self {
        Self(Mutex::new(StdRng::from_entropy()))
    }

    fn seeded(seed: u64) -> Self {
        Self(Mutex::new(StdRng::seed_from_u64(seed)))
    }

    /// `uniform[0, 1) * span`, truncated to whole nanoseconds.
    fn fraction_of(&self, span: u128) -> u128 {
        if span == 0 {
            return 0;
        }
        let unit: f64 = self.0.lock().unwrap_or_else(PoisonError::into_inner).gen();
        // Float-to-int casts saturate, so large spans cannot overflow here.
        ((unit * span as f64) as u128).min(span - 1)
    }

    /// Uniform draw in `[0, bound)`; `bound` must be positive.
    fn below(&self, bound: u128) -> u128 {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gen_range(0..bound)
    }
}

fn exponential_nanos(min: Duration, attempt: usize) -> u128 {
    let factor = if attempt >= 127 {
        u128::MAX
    } else {
        1u128 << attempt
    };
    min.as_nanos().saturating_mul(factor)
}

fn cap(raw_nanos: u128, max: Duration) -> Duration {
    if raw_nanos >= max.as_nanos() {
        max
    } else {
        from_nanos(raw_nanos)
    }
}

fn from_nanos(nanos: u128) -> Duration {
    const NANOS_PER_SEC: u128 = 1_000_000_000;
    let secs = u64::try_from(nanos / NANOS_PER_SEC).unwrap_or(u64::MAX);
    Duration::new(secs, (nanos % NANOS_PER_SEC) as u32)
}
