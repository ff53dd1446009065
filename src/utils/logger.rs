use anyhow::Context;
use std::str::FromStr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};

/// Logging setup for embedding applications.
///
/// Stdout by default; set `file_dir` for rolling files. All fields can
/// come from the environment via [`from_env`](Self::from_env).
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct LoggerConfig {
    pub level: String,
    pub file_dir: Option<String>,
    pub file_prefix: Option<String>,
    /// `daily` (default), `hourly`, or `minutely`.
    pub rolling: Option<String>,
    #[serde(default)]
    pub max_files: usize,
}

impl LoggerConfig {
    /// Read `LOG_LEVEL`, `LOG_FILE_DIR`, `LOG_FILE_PREFIX` and
    /// `LOG_ROLLING`, falling back to defaults for anything unset.
    pub fn from_env() -> Self {
        Self {
            level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            file_dir: std::env::var("LOG_FILE_DIR").ok(),
            file_prefix: std::env::var("LOG_FILE_PREFIX").ok(),
            rolling: std::env::var("LOG_ROLLING").ok(),
            max_files: 2,
        }
    }

    /// Install the global subscriber. Returns the appender guard that
    /// must outlive the program when logging to files.
    pub fn init(&self) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
        let level = Level::from_str(&self.level).unwrap_or(Level::INFO);

        let Some(dir) = self.file_dir.as_deref() else {
            let _ = tracing_subscriber::fmt().with_max_level(level).try_init();
            return Ok(None);
        };

        let rotation = match self.rolling.as_deref() {
            Some("hourly") => Rotation::HOURLY,
            Some("minutely") => Rotation::MINUTELY,
            _ => Rotation::DAILY,
        };
        let appender: RollingFileAppender = RollingFileAppender::builder()
            .rotation(rotation)
            .max_log_files(self.max_files.max(1))
            .filename_prefix(self.file_prefix.as_deref().unwrap_or(""))
            .build(dir)
            .with_context(|| format!("failed to create rolling appender in {dir}"))?;

        let (writer, guard) = tracing_appender::non_blocking(appender);
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(writer)
            .try_init();
        Ok(Some(guard))
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_dir: None,
            file_prefix: None,
            rolling: Some("daily".to_string()),
            max_files: 2,
        }
    }
}

/// Per-callsite rate limiter for repetitive log messages.
///
/// Reconnect loops and health probes repeat the same complaint at high
/// frequency during an outage; one instance of this throttle sits at
/// each such callsite and lets a message through at most once per
/// interval, reporting how many were suppressed in between.
pub struct Throttle {
    last: Mutex<Instant>,
    suppressed: AtomicU64,
    interval: Duration,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        // Start in the past so the first message is emitted immediately.
        let start = Instant::now()
            .checked_sub(interval)
            .unwrap_or_else(Instant::now);
        Self {
            last: Mutex::new(start),
            suppressed: AtomicU64::new(0),
            interval,
        }
    }

    /// `Some(suppressed)` when the caller should emit, `None` when the
    /// message falls inside the quiet interval.
    pub fn poll(&self) -> Option<u64> {
        if self.interval.is_zero() {
            return Some(self.suppressed.swap(0, Ordering::Relaxed));
        }
        // Cheap pre-check without contending the lock.
        if let Ok(last) = self.last.try_lock() {
            if last.elapsed() < self.interval {
                self.suppressed.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        }

        let mut last = match self.last.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if last.elapsed() >= self.interval {
            *last = Instant::now();
            Some(self.suppressed.swap(0, Ordering::Relaxed))
        } else {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            None
        }
    }
}

/// Emit a throttled log line; the level is given as an identifier
/// (`error`, `warn`, `info`, `debug`, `trace`).
#[macro_export]
macro_rules! log_throttled {
    ($level:ident, $interval:expr, $($arg:tt)*) => {{
        // One throttle per callsite.
        static _THROTTLE: std::sync::OnceLock<$crate::utils::logger::Throttle> =
            std::sync::OnceLock::new();
        let throttle = _THROTTLE.get_or_init(|| $crate::utils::logger::Throttle::new($interval));
        if let Some(_suppressed) = throttle.poll() {
            if _suppressed > 0 {
                tracing::$level!(suppressed = _suppressed, $($arg)*);
            } else {
                tracing::$level!($($arg)*);
            }
        }
    }};
}

#[macro_export]
macro_rules! error_throttled { ($interval:expr, $($arg:tt)*) => { $crate::log_throttled!(error, $interval, $($arg)*); } }
#[macro_export]
macro_rules! warn_throttled  { ($interval:expr, $($arg:tt)*) => { $crate::log_throttled!(warn,  $interval, $($arg)*); } }
#[macro_export]
macro_rules! info_throttled  { ($interval:expr, $($arg:tt)*) => { $crate::log_throttled!(info,  $interval, $($arg)*); } }
#[macro_export]
macro_rules! debug_throttled { ($interval:expr, $($arg:tt)*) => { $crate::log_throttled!(debug, $interval, $($arg)*); } }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_suppresses_within_interval() {
        let throttle = Throttle::new(Duration::from_secs(60));
        assert_eq!(throttle.poll(), Some(0));
        assert_eq!(throttle.poll(), None);
        assert_eq!(throttle.poll(), None);
    }

    #[test]
    fn zero_interval_never_suppresses() {
        let throttle = Throttle::new(Duration::ZERO);
        assert!(throttle.poll().is_some());
        assert!(throttle.poll().is_some());
    }

    #[test]
    fn suppressed_count_is_reported_after_the_interval() {
        let throttle = Throttle::new(Duration::from_millis(20));
        assert_eq!(throttle.poll(), Some(0));
        for _ in 0..5 {
            assert_eq!(throttle.poll(), None);
        }
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(throttle.poll(), Some(5));
    }
}
