use crate::config::Config;
use std::time::Duration;

/// Delay schedule for one reconnect episode.
///
/// The first attempt goes out immediately (the connection just died;
/// odds are it was a blip). Failures then back off exponentially:
/// `initial, initial·m, initial·m², …` saturating at `max`.
pub(crate) struct ReconnectBackoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    attempt: u32,
}

impl ReconnectBackoff {
    pub fn new(cfg: &Config) -> Self {
        Self {
            initial: cfg.reconnect_initial_delay(),
            max: cfg.reconnect_max_delay(),
            multiplier: cfg.reconnect_multiplier,
            attempt: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = match self.attempt {
            0 => Duration::ZERO,
            n => {
                let scaled = self.initial.as_millis() as f64 * self.multiplier.powi(n as i32 - 1);
                Duration::from_millis(scaled.min(self.max.as_millis() as f64) as u64)
            }
        };
        self.attempt = self.attempt.saturating_add(1);
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(initial_ms: u64, max_ms: u64, multiplier: f64) -> Config {
        Config {
            reconnect_initial_delay_ms: initial_ms,
            reconnect_max_delay_ms: max_ms,
            reconnect_multiplier: multiplier,
            ..Config::default()
        }
    }

    #[test]
    fn first_attempt_is_immediate() {
        let mut backoff = ReconnectBackoff::new(&cfg(100, 30_000, 2.0));
        assert_eq!(backoff.next_delay(), Duration::ZERO);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(400));
    }

    #[test]
    fn saturates_at_max() {
        let mut backoff = ReconnectBackoff::new(&cfg(100, 500, 2.0));
        for _ in 0..10 {
            let _ = backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }
}
