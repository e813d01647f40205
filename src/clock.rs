//! Timestamps and clocks
//!
//! The entitlement layer works in whole seconds since the Unix epoch
//! ([`UnixSecs`]). Presentation boundaries (UI payloads, JSON for web
//! clients) use milliseconds ([`UnixMillis`]). The two are distinct types so
//! a value can only cross between them through an explicit conversion.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Seconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnixSecs(pub u64);

/// Milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnixMillis(pub u64);

impl UnixSecs {
    /// Current wall-clock time
    pub fn now() -> Self {
        let secs = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Self(secs)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Add a duration in seconds, saturating at `u64::MAX`
    pub fn plus(self, secs: u64) -> Self {
        Self(self.0.saturating_add(secs))
    }

    /// Seconds remaining until `deadline`, zero if already passed
    pub fn until(self, deadline: UnixSecs) -> u64 {
        deadline.0.saturating_sub(self.0)
    }

    pub fn to_millis(self) -> UnixMillis {
        UnixMillis(self.0.saturating_mul(1000))
    }

    /// RFC3339 rendering for logs and CLI output
    pub fn to_rfc3339(self) -> String {
        i64::try_from(self.0)
            .ok()
            .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_else(|| self.0.to_string())
    }
}

impl UnixMillis {
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Truncates sub-second precision.
    pub fn to_secs(self) -> UnixSecs {
        UnixSecs(self.0 / 1000)
    }
}

impl fmt::Display for UnixSecs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}s", self.0)
    }
}

impl fmt::Display for UnixMillis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Source of the current time for entitlement decisions
pub trait Clock: Send + Sync {
    fn now(&self) -> UnixSecs;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> UnixSecs {
        UnixSecs::now()
    }
}

/// Manually driven clock for tests and simulations
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start: UnixSecs) -> Self {
        Self {
            now: AtomicU64::new(start.0),
        }
    }

    pub fn set(&self, now: UnixSecs) {
        self.now.store(now.0, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: u64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> UnixSecs {
        UnixSecs(self.now.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_conversion_is_explicit() {
        let secs = UnixSecs(1_700_000_000);
        let millis = secs.to_millis();
        assert_eq!(millis, UnixMillis(1_700_000_000_000));
        assert_eq!(millis.to_secs(), secs);
        assert_eq!(UnixMillis(1_700_000_000_999).to_secs(), secs);
    }

    #[test]
    fn test_plus_saturates() {
        assert_eq!(UnixSecs(u64::MAX - 1).plus(10), UnixSecs(u64::MAX));
        assert_eq!(UnixSecs(10).until(UnixSecs(4)), 0);
        assert_eq!(UnixSecs(4).until(UnixSecs(10)), 6);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(UnixSecs(100));
        clock.advance(50);
        assert_eq!(clock.now(), UnixSecs(150));
        clock.set(UnixSecs(7));
        assert_eq!(clock.now(), UnixSecs(7));
    }

    #[test]
    fn test_rfc3339() {
        assert_eq!(UnixSecs(0).to_rfc3339(), "1970-01-01T00:00:00+00:00");
    }
}
