//! Tracing setup for the daemon, plus a throttle for failures that repeat on
//! every scheduler poll.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, Default)]
pub struct LogConfig {
    /// One JSON object per line, with span fields (`job_id`, `vm`) attached
    pub json: bool,
    /// Debug level for the daemon's own targets
    pub verbose: bool,
}

/// Filter used when `RUST_LOG` is not set.
pub fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "vmbackd=debug"
    } else {
        "vmbackd=info"
    }
}

/// Install the global subscriber. `RUST_LOG` takes precedence over
/// [`default_directive`].
pub fn init(config: LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(config.verbose)));
    let registry = tracing_subscriber::registry().with(filter);

    if config.json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_target(true),
            )
            .init();
    } else {
        registry.with(fmt::layer().with_target(false)).init();
    }
}

#[derive(Default)]
struct ThrottleState {
    last_logged: Option<Instant>,
    suppressed: u64,
}

/// Collapses a failure that recurs on every poll into one message per
/// interval.
///
/// ```ignore
/// if let Some(suppressed) = throttle.should_log() {
///     tracing::error!(error = %e, suppressed, "Schedule store unavailable");
/// }
/// ```
pub struct LogThrottle {
    interval: Duration,
    state: Mutex<ThrottleState>,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            state: Mutex::new(ThrottleState::default()),
        }
    }

    /// `Some(n)` when this occurrence should be logged, `n` being how many
    /// occurrences were swallowed since the previous message.
    pub fn should_log(&self) -> Option<u64> {
        self.should_log_at(Instant::now())
    }

    fn should_log_at(&self, now: Instant) -> Option<u64> {
        let mut state = self.lock();
        let due = state
            .last_logged
            .is_none_or(|last| now.saturating_duration_since(last) >= self.interval);

        if due {
            state.last_logged = Some(now);
            Some(std::mem::take(&mut state.suppressed))
        } else {
            state.suppressed += 1;
            None
        }
    }

    /// End a failure streak. Returns true if the streak had been reported,
    /// so the caller can log the recovery once.
    pub fn reset(&self) -> bool {
        let mut state = self.lock();
        let was_failing = state.last_logged.is_some();
        *state = ThrottleState::default();
        was_failing
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ThrottleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_switches_default_level() {
        assert_eq!(default_directive(false), "vmbackd=info");
        assert_eq!(default_directive(true), "vmbackd=debug");
    }

    #[test]
    fn counts_suppressed_occurrences() {
        let throttle = LogThrottle::new(Duration::from_secs(300));
        let start = Instant::now();

        assert_eq!(throttle.should_log_at(start), Some(0));
        assert_eq!(throttle.should_log_at(start + Duration::from_secs(60)), None);
        assert_eq!(throttle.should_log_at(start + Duration::from_secs(120)), None);
        assert_eq!(
            throttle.should_log_at(start + Duration::from_secs(300)),
            Some(2)
        );
    }

    #[test]
    fn reset_reports_streak_once() {
        let throttle = LogThrottle::new(Duration::from_secs(300));
        assert!(!throttle.reset());

        assert_eq!(throttle.should_log(), Some(0));
        assert!(throttle.reset());
        assert!(!throttle.reset());
        assert_eq!(throttle.should_log(), Some(0));
    }
}
