//! Tracing setup for the server, and a throttle for hot-path logs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::Level;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::config::AppConfig;

#[derive(Debug, Default, Clone, Copy)]
pub struct LogConfig {
    /// One JSON object per event, with span close events for call timing
    pub json: bool,
    /// `qstream=debug` instead of `qstream=info`
    pub verbose: bool,
}

impl From<&AppConfig> for LogConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            json: config.json_logs,
            verbose: config.verbose,
        }
    }
}

impl LogConfig {
    /// `RUST_LOG` wins over the configured level.
    fn filter(&self) -> EnvFilter {
        let level = if self.verbose { Level::DEBUG } else { Level::INFO };
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("qstream={}", level.as_str().to_lowercase())))
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init(config: LogConfig) -> Result<()> {
    let json = config.json.then(|| {
        fmt::layer()
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_current_span(true)
            .with_target(true)
    });
    let console = (!config.json).then(|| {
        fmt::layer()
            .with_target(false)
            .with_file(false)
            .with_line_number(false)
    });

    tracing_subscriber::registry()
        .with(config.filter())
        .with(json)
        .with(console)
        .try_init()?;
    Ok(())
}

/// Lets one event through per interval and counts the ones it held back.
///
/// Shared by every call streaming progress, so a busy server logs a sample
/// of its chunks instead of all of them.
pub struct LogThrottle {
    interval_ms: u64,
    /// Milliseconds since `start` of the last admitted event, `u64::MAX` before the first
    last_ms: AtomicU64,
    suppressed: AtomicU64,
    start: Instant,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval_ms: interval.as_millis() as u64,
            last_ms: AtomicU64::new(u64::MAX),
            suppressed: AtomicU64::new(0),
            start: Instant::now(),
        }
    }

    /// `Some(n)` if this event should be logged, with `n` events dropped
    /// since the previous one. `None` if it should be dropped.
    pub fn admit(&self) -> Option<u64> {
        let now = self.start.elapsed().as_millis() as u64;
        let last = self.last_ms.load(Ordering::Relaxed);
        let due = last == u64::MAX || now.saturating_sub(last) >= self.interval_ms;

        if due
            && self
                .last_ms
                .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            return Some(self.suppressed.swap(0, Ordering::Relaxed));
        }
        self.suppressed.fetch_add(1, Ordering::Relaxed);
        None
    }
}
