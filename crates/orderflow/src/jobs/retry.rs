use crate::jobs::error_codes::ErrorCode;
use rand::Rng;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub base_seconds: i64,
    pub max_seconds: i64,
    pub jitter_pct: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_seconds: 60,
            max_seconds: 60 * 60,
            jitter_pct: 0.20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    NonRetryable,
}

pub fn classify_error(code: ErrorCode) -> ErrorClass {
    match code {
        ErrorCode::NotReady
        | ErrorCode::RenderFailed
        | ErrorCode::DeliveryFailed
        | ErrorCode::Storage
        | ErrorCode::Database
        | ErrorCode::Cancelled => ErrorClass::Retryable,
        ErrorCode::OrderNotFound
        | ErrorCode::BadArgs
        | ErrorCode::UnknownJobType
        | ErrorCode::Configuration => ErrorClass::NonRetryable,
        ErrorCode::Unknown => ErrorClass::Retryable,
    }
}

pub fn next_delay_seconds(attempt_no: i32, cfg: &RetryConfig, rng: &mut impl Rng) -> i64 {
    let attempt_no = attempt_no.max(1) as u32;

    // exponent = attempt_no - 1
    let exp = attempt_no.saturating_sub(1);

    // 2^exp; an oversized exponent saturates and the cap takes over.
    let pow2 = 1_i64.checked_shl(exp).unwrap_or(i64::MAX);

    let mut delay = cfg.base_seconds.saturating_mul(pow2);

    if delay > cfg.max_seconds {
        delay = cfg.max_seconds;
    }

    // jitter in range [-jitter_pct, +jitter_pct]
    let jitter_range = (delay as f64) * cfg.jitter_pct;
    let jitter = if jitter_range > 0.0 {
        rng.gen_range(-jitter_range..=jitter_range)
    } else {
        0.0
    };

    let jittered = (delay as f64 + jitter).round() as i64;
    jittered.clamp(0, cfg.max_seconds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn no_jitter() -> RetryConfig {
        RetryConfig {
            base_seconds: 60,
            max_seconds: 600,
            jitter_pct: 0.0,
        }
    }

    #[test]
    fn delay_doubles_per_attempt() {
        let mut rng = StdRng::seed_from_u64(7);
        let cfg = no_jitter();
        assert_eq!(next_delay_seconds(1, &cfg, &mut rng), 60);
        assert_eq!(next_delay_seconds(2, &cfg, &mut rng), 120);
        assert_eq!(next_delay_seconds(3, &cfg, &mut rng), 240);
    }

    #[test]
    fn delay_is_capped_even_for_huge_attempt_numbers() {
        let mut rng = StdRng::seed_from_u64(7);
        let cfg = no_jitter();
        assert_eq!(next_delay_seconds(5, &cfg, &mut rng), 600);
        assert_eq!(next_delay_seconds(200, &cfg, &mut rng), 600);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let mut rng = StdRng::seed_from_u64(42);
        let cfg = RetryConfig::default();
        for _ in 0..100 {
            let d = next_delay_seconds(1, &cfg, &mut rng);
            assert!((48..=72).contains(&d), "delay {d} outside jitter window");
        }
    }

    #[test]
    fn permanent_failures_are_not_retried() {
        assert_eq!(classify_error(ErrorCode::UnknownJobType), ErrorClass::NonRetryable);
        assert_eq!(classify_error(ErrorCode::OrderNotFound), ErrorClass::NonRetryable);
        assert_eq!(classify_error(ErrorCode::NotReady), ErrorClass::Retryable);
        assert_eq!(classify_error(ErrorCode::DeliveryFailed), ErrorClass::Retryable);
    }
}
