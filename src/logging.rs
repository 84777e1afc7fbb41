//! Tracing setup for the `vericopy` binary.
//!
//! Everything goes to stderr, human-readable or as JSON lines. Progress for
//! the caller travels on the job's event channel, never through the log.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct LogConfig {
    /// JSON lines instead of the console format
    pub json: bool,
    /// Debug level for the crate's own targets
    pub verbose: bool,
}

impl LogConfig {
    fn directive(&self) -> &'static str {
        if self.verbose {
            "vericopy=debug"
        } else {
            "vericopy=info"
        }
    }
}

/// Install the global subscriber. `RUST_LOG`, when set, wins over `config`.
pub fn init(config: LogConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.directive()));

    let json = config.json.then(|| {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_current_span(true)
            .with_span_events(FmtSpan::CLOSE)
    });
    let console = (!config.json).then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(console)
        .init();
}

/// Lets at most one caller through per interval.
///
/// Shared between tasks, so the last pass time lives in an atomic, stored
/// as milliseconds since creation plus one; zero means "never passed".
pub struct LogThrottle {
    interval: u64,
    origin: Instant,
    last: AtomicU64,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.as_millis() as u64,
            origin: Instant::now(),
            last: AtomicU64::new(0),
        }
    }

    pub fn should_log(&self) -> bool {
        let now = self.origin.elapsed().as_millis() as u64 + 1;
        let last = self.last.load(Ordering::Relaxed);
        if last != 0 && now.saturating_sub(last) < self.interval {
            return false;
        }
        // Losing the race means someone else just went through.
        self.last
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    /// Let the next call through regardless of the interval.
    pub fn reset(&self) {
        self.last.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_lowers_the_level() {
        assert_eq!(LogConfig::default().directive(), "vericopy=info");
        let verbose = LogConfig {
            verbose: true,
            ..Default::default()
        };
        assert_eq!(verbose.directive(), "vericopy=debug");
    }

    #[test]
    fn throttle_passes_once_per_interval() {
        let throttle = LogThrottle::new(Duration::from_secs(100));
        assert!(throttle.should_log());
        assert!(!throttle.should_log());
        throttle.reset();
        assert!(throttle.should_log());
    }

    #[test]
    fn zero_interval_always_passes() {
        let throttle = LogThrottle::new(Duration::ZERO);
        assert!(throttle.should_log());
        assert!(throttle.should_log());
    }
}
