//! Restart supervision with exponential backoff
//!
//! Used by the automation bridge to rebuild script instances that panic.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

/// Restart policy configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RestartPolicy {
    /// Maximum number of restarts before giving up
    pub max_restarts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Fraction of the delay added as random jitter (0.0 disables it)
    pub jitter: f64,
    /// A run that stays up this long resets the restart count
    pub restart_window: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: 0.1,
            restart_window: Duration::from_secs(300),
        }
    }
}

impl RestartPolicy {
    /// Policy without jitter, for predictable delays
    pub fn fixed(self) -> Self {
        Self { jitter: 0.0, ..self }
    }
}

/// Restart bookkeeping for one supervised instance
#[derive(Debug)]
pub struct Supervisor {
    policy: RestartPolicy,
    restart_count: u32,
    current_backoff: Duration,
    last_stable_time: Option<Instant>,
}

impl Supervisor {
    pub fn new(policy: RestartPolicy) -> Self {
        let initial_backoff = policy.initial_backoff;
        Self {
            policy,
            restart_count: 0,
            current_backoff: initial_backoff,
            last_stable_time: None,
        }
    }

    /// Called when the instance (re)starts
    pub fn on_start(&mut self) {
        self.last_stable_time = Some(Instant::now());
    }

    /// Called when the instance crashes. Returns the delay before the next
    /// restart, or `None` once the restart budget is spent.
    pub fn on_crash(&mut self) -> Option<Duration> {
        if let Some(stable_time) = self.last_stable_time {
            if stable_time.elapsed() >= self.policy.restart_window {
                self.reset();
            }
        }

        self.restart_count += 1;
        if self.restart_count > self.policy.max_restarts {
            return None;
        }

        let base = self.current_backoff;
        self.current_backoff = Duration::from_secs_f64(
            (base.as_secs_f64() * self.policy.backoff_multiplier)
                .min(self.policy.max_backoff.as_secs_f64()),
        );

        Some(base + self.jitter(base))
    }

    fn jitter(&self, base: Duration) -> Duration {
        if self.policy.jitter <= 0.0 {
            return Duration::ZERO;
        }
        let factor = rand::thread_rng().gen_range(0.0..self.policy.jitter);
        base.mul_f64(factor)
    }

    pub fn reset(&mut self) {
        self.restart_count = 0;
        self.current_backoff = self.policy.initial_backoff;
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }

    /// Whether the restart budget is spent
    pub fn is_exhausted(&self) -> bool {
        self.restart_count >= self.policy.max_restarts
    }
}
