// Copyright (c) James Kassemi, SC, US. All rights reserved.
use rand::Rng;
use std::{thread, time::Duration};

use crate::config::ConflictRetryConfig;

/// Jittered exponential backoff for transient failures such as optimistic version conflicts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_pct: f64,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: usize,
        base_delay_ms: u64,
        max_delay_ms: u64,
        jitter_pct: f64,
    ) -> Self {
        let clamped_attempts = max_attempts.max(1);
        let clamped_base = base_delay_ms.max(1);
        let clamped_max_delay = max_delay_ms.max(clamped_base);
        let clamped_jitter = jitter_pct.clamp(0.0, 1.0);
        Self {
            max_attempts: clamped_attempts,
            base_delay_ms: clamped_base,
            max_delay_ms: clamped_max_delay,
            jitter_pct: clamped_jitter,
        }
    }

    pub fn from_config(config: &ConflictRetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            config.base_delay_ms,
            config.max_delay_ms,
            config.jitter_pct,
        )
    }

    /// Single attempt, no waiting.
    pub fn none() -> Self {
        Self::new(1, 1, 1, 0.0)
    }

    fn next_delay(&self, attempt: usize) -> Duration {
        let exp = 2_u64.saturating_pow(attempt as u32);
        let mut delay = self.base_delay_ms.saturating_mul(exp);
        if delay > self.max_delay_ms {
            delay = self.max_delay_ms;
        }
        let jitter = if self.jitter_pct > 0.0 {
            let mut rng = rand::thread_rng();
            let spread = (delay as f64 * self.jitter_pct) as i64;
            let delta = rng.gen_range(-spread..=spread);
            delay.saturating_add_signed(delta)
        } else {
            delay
        };
        Duration::from_millis(jitter)
    }

    /// Runs `op` until it succeeds, `is_transient` rejects the error, or attempts run out.
    pub fn retry<F, T, E, P>(&self, mut op: F, is_transient: P) -> Result<T, E>
    where
        F: FnMut(usize) -> Result<T, E>,
        P: Fn(&E) -> bool,
    {
        let mut attempt = 0;
        loop {
            match op(attempt) {
                Ok(val) => return Ok(val),
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.max_attempts || !is_transient(&err) {
                        return Err(err);
                    }
                    let delay = self.next_delay(attempt - 1);
                    log::debug!("retrying after transient failure (attempt {attempt}, {delay:?})");
                    thread::sleep(delay);
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ConflictRetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn new_clamps_input_parameters() {
        let policy = RetryPolicy::new(0, 0, 0, 2.0);
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.base_delay_ms, 1);
        assert_eq!(policy.max_delay_ms, 1);
        assert_eq!(policy.jitter_pct, 1.0);
    }

    #[test]
    fn next_delay_doubles_and_caps() {
        let policy = RetryPolicy::new(5, 100, 500, 0.0);
        let delays: Vec<_> = (0..5).map(|attempt| policy.next_delay(attempt)).collect();
        assert_eq!(delays[0], Duration::from_millis(100));
        assert_eq!(delays[1], Duration::from_millis(200));
        assert_eq!(delays[2], Duration::from_millis(400));
        assert_eq!(delays[3], Duration::from_millis(500)); // capped
        assert_eq!(delays[4], Duration::from_millis(500));
    }

    #[test]
    fn retry_repeats_transient_failures_until_success() {
        let policy = RetryPolicy::new(3, 1, 1, 0.0);
        let attempts = Cell::new(0);
        let result: Result<&str, &str> = policy.retry(
            |attempt| {
                attempts.set(attempts.get() + 1);
                if attempt < 2 { Err("conflict") } else { Ok("ok") }
            },
            |_| true,
        );
        assert_eq!(result, Ok("ok"));
        assert_eq!(attempts.get(), 3);
    }

    #[test]
    fn retry_stops_on_permanent_error() {
        let policy = RetryPolicy::new(5, 1, 1, 0.0);
        let attempts = Cell::new(0);
        let result: Result<(), &str> = policy.retry(
            |_| {
                attempts.set(attempts.get() + 1);
                Err("invalid")
            },
            |err| *err == "conflict",
        );
        assert_eq!(result, Err("invalid"));
        assert_eq!(attempts.get(), 1);
    }

    #[test]
    fn retry_stops_after_max_attempts() {
        let policy = RetryPolicy::new(2, 1, 1, 0.0);
        let attempts = Cell::new(0);
        let result: Result<(), &str> = policy.retry(
            |_| {
                attempts.set(attempts.get() + 1);
                Err("conflict")
            },
            |_| true,
        );
        assert_eq!(result, Err("conflict"));
        assert_eq!(attempts.get(), 2);
    }
}
