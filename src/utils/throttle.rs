//! Log throttling utility
//!
//! Limits how often the same log message is recorded. The recorder worker
//! polls a camera many times per second, so a failing collaborator would
//! otherwise print one line per loop iteration.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

struct Entry {
    last: Instant,
    suppressed: u64,
}

/// Per-key log throttler
///
/// # Example
///
/// ```rust
/// use maix_video::utils::LogThrottler;
/// use std::time::Duration;
///
/// let throttler = LogThrottler::new(Duration::from_secs(5));
/// assert!(throttler.should_log("camera_read"));
/// assert!(!throttler.should_log("camera_read"));
/// ```
pub struct LogThrottler {
    entries: Mutex<HashMap<String, Entry>>,
    interval: Duration,
}

impl LogThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            interval,
        }
    }

    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Returns `true` when the message for `key` should be emitted now.
    ///
    /// A `false` result counts as a suppressed repeat, which
    /// [`take_suppressed`](Self::take_suppressed) reports later.
    pub fn should_log(&self, key: &str) -> bool {
        self.check(key).is_some()
    }

    /// Like [`should_log`](Self::should_log), but also returns how many
    /// repeats were swallowed since the last emitted message.
    pub fn check(&self, key: &str) -> Option<u64> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if now.duration_since(entry.last) < self.interval => {
                entry.suppressed += 1;
                None
            }
            Some(entry) => {
                let suppressed = std::mem::take(&mut entry.suppressed);
                entry.last = now;
                Some(suppressed)
            }
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        last: now,
                        suppressed: 0,
                    },
                );
                Some(0)
            }
        }
    }

    /// Number of repeats swallowed for `key`, resetting the counter
    pub fn take_suppressed(&self, key: &str) -> u64 {
        self.entries
            .lock()
            .get_mut(key)
            .map(|e| std::mem::take(&mut e.suppressed))
            .unwrap_or(0)
    }

    /// Forget a key once its error condition recovers, so the next
    /// failure is logged immediately.
    pub fn clear(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    pub fn clear_all(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for LogThrottler {
    /// 5 second window
    fn default() -> Self {
        Self::with_secs(5)
    }
}

/// Throttled `tracing::warn!`
///
/// ```rust
/// use maix_video::utils::LogThrottler;
/// use maix_video::warn_throttled;
///
/// let throttler = LogThrottler::default();
/// warn_throttled!(throttler, "pop", "Camera pop failed: {}", "timeout");
/// ```
#[macro_export]
macro_rules! warn_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if let Some(suppressed) = $throttler.check($key) {
            if suppressed > 0 {
                tracing::warn!(suppressed, $($arg)*);
            } else {
                tracing::warn!($($arg)*);
            }
        }
    };
}

/// Throttled `tracing::error!`
#[macro_export]
macro_rules! error_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if let Some(suppressed) = $throttler.check($key) {
            if suppressed > 0 {
                tracing::error!(suppressed, $($arg)*);
            } else {
                tracing::error!($($arg)*);
            }
        }
    };
}

/// Throttled `tracing::info!`
#[macro_export]
macro_rules! info_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if $throttler.should_log($key) {
            tracing::info!($($arg)*);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_first_call_logs() {
        let throttler = LogThrottler::with_secs(1);
        assert!(throttler.should_log("camera"));
    }

    #[test]
    fn test_window_expiry() {
        let throttler = LogThrottler::new(Duration::from_millis(100));
        assert!(throttler.should_log("camera"));
        assert!(!throttler.should_log("camera"));
        thread::sleep(Duration::from_millis(150));
        assert!(throttler.should_log("camera"));
    }

    #[test]
    fn test_suppressed_count_reported_on_next_emit() {
        let throttler = LogThrottler::new(Duration::from_millis(80));
        assert_eq!(throttler.check("encode"), Some(0));
        assert_eq!(throttler.check("encode"), None);
        assert_eq!(throttler.check("encode"), None);
        thread::sleep(Duration::from_millis(120));
        assert_eq!(throttler.check("encode"), Some(2));
    }

    #[test]
    fn test_take_suppressed() {
        let throttler = LogThrottler::with_secs(10);
        throttler.should_log("k");
        throttler.should_log("k");
        throttler.should_log("k");
        assert_eq!(throttler.take_suppressed("k"), 2);
        assert_eq!(throttler.take_suppressed("k"), 0);
        assert_eq!(throttler.take_suppressed("missing"), 0);
    }

    #[test]
    fn test_keys_are_independent_and_clearable() {
        let throttler = LogThrottler::with_secs(10);
        assert!(throttler.should_log("a"));
        assert!(throttler.should_log("b"));
        assert!(!throttler.should_log("a"));
        assert_eq!(throttler.len(), 2);

        throttler.clear("a");
        assert!(throttler.should_log("a"));

        throttler.clear_all();
        assert!(throttler.is_empty());
        assert!(throttler.should_log("b"));
    }

    #[test]
    fn test_macros_expand() {
        let throttler = LogThrottler::default();
        warn_throttled!(throttler, "w", "warn {}", 1);
        warn_throttled!(throttler, "w", "warn {}", 2);
        error_throttled!(throttler, "e", "error {}", 1);
        info_throttled!(throttler, "i", "info");
        assert_eq!(throttler.len(), 3);
    }
}
