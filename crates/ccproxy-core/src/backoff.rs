use rand::Rng;
use std::time::Duration;

/// Exponential backoff with randomization. `attempt` is 1-indexed; the
/// first delayed attempt (attempt = 2) sleeps roughly `base`. Jitter is
/// a uniform draw in ±(jitter × delay ÷ 2) so concurrent retriers spread
/// out instead of thundering together.
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration, jitter: f64) -> Duration {
    let exponent = attempt.saturating_sub(2).min(16);
    let delay = base
        .saturating_mul(2u32.saturating_pow(exponent))
        .min(cap);

    if jitter <= 0.0 {
        return delay;
    }

    let delta = delay.as_secs_f64() * jitter;
    let offset = rand::thread_rng().gen_range(-0.5..=0.5) * delta;
    Duration::from_secs_f64((delay.as_secs_f64() + offset).max(0.0))
}
