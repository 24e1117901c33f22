use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the retry delay grows with the number of consumed attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

/// Retry delay policy for a connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub kind: BackoffKind,
    pub delay: Duration,
    /// Upper jitter bound as a multiple of the computed delay. Values <= 1 disable jitter.
    pub jitter_factor: f64,
    pub max_delay: Option<Duration>,
}

impl BackoffPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            delay,
            jitter_factor: 1.0,
            max_delay: None,
        }
    }

    pub fn exponential(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            delay,
            jitter_factor: 1.0,
            max_delay: None,
        }
    }

    /// Set the jitter factor
    pub fn jitter(mut self, factor: f64) -> Self {
        self.jitter_factor = factor;
        self
    }

    /// Cap the computed delay before jitter is applied
    pub fn max_delay(mut self, cap: Duration) -> Self {
        self.max_delay = Some(cap);
        self
    }

    /// Delay before the next attempt, given how many attempts were consumed.
    pub fn delay_for(&self, attempt_index: u32) -> Duration {
        let base_ms = duration_ms(self.delay);
        let mut computed = match self.kind {
            BackoffKind::Fixed => base_ms,
            BackoffKind::Exponential => {
                base_ms.saturating_mul(2_u64.saturating_pow(attempt_index))
            }
        };

        if let Some(cap) = self.max_delay {
            computed = computed.min(duration_ms(cap));
        }

        Duration::from_millis(apply_jitter(computed, self.jitter_factor))
    }
}

/// Retry delay for `attempt_index` under `policy`. No policy means the job is
/// eligible again immediately.
pub fn delay(attempt_index: u32, policy: Option<&BackoffPolicy>) -> Duration {
    match policy {
        Some(policy) => policy.delay_for(attempt_index),
        None => Duration::ZERO,
    }
}

fn apply_jitter(base_ms: u64, factor: f64) -> u64 {
    if factor.is_nan() || factor <= 1.0 || base_ms == 0 {
        return base_ms;
    }

    let upper = (base_ms as f64 * factor).floor();
    let upper = if upper >= u64::MAX as f64 {
        u64::MAX
    } else {
        upper as u64
    };

    rand::rng().random_range(base_ms..=upper)
}

/// Uniform random delay in `[0, interval)`, added on requeue so that jobs
/// released together do not all become eligible on the same poll.
pub fn requeue_jitter(interval: Duration) -> Duration {
    let ms = duration_ms(interval);
    if ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..ms))
}

/// Uniform random delay in `[0, max]`.
pub fn random_up_to(max: Duration) -> Duration {
    let ms = duration_ms(max);
    if ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..=ms))
}

/// 32-bit polynomial string hash (`h * 31 + c`, wrapping). Stable across
/// processes and platforms, unlike `std::hash`.
pub fn string_hash(value: &str) -> u32 {
    value
        .chars()
        .fold(0_u32, |hash, c| hash.wrapping_mul(31).wrapping_add(c as u32))
}

/// Deterministic first-poll offset for a worker loop, in `[0, interval)`.
///
/// Processes of the same fleet hash to different offsets through their
/// process id, spreading their first polls without any coordination.
pub fn initial_offset(
    worker_name: &str,
    connection: &str,
    process_id: u32,
    interval: Duration,
) -> Duration {
    let interval_ms = duration_ms(interval);
    if interval_ms == 0 {
        return Duration::ZERO;
    }
    let key = format!("{}:{}:{}", worker_name, connection, process_id);
    Duration::from_millis(string_hash(&key) as u64 % interval_ms)
}

pub(crate) fn duration_ms(duration: Duration) -> u64 {
    duration.as_millis().min(u64::MAX as u128) as u64
}
