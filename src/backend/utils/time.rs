// src/backend/utils/time.rs
use crate::error::{AfterselfError, Result};
use crate::models::common::Timestamp;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const MILLIS_PER_HOUR: u64 = 60 * 60 * 1000;
const MILLIS_PER_DAY: u64 = 24 * MILLIS_PER_HOUR;

/// Source of wall-clock time for every component.
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now(&self) -> Timestamp;
}

/// Wall-clock time anchored once to the system clock and advanced by the tokio
/// monotonic clock, so timestamps and `tokio::time::sleep` always agree (including
/// under paused test time).
#[derive(Debug, Clone)]
pub struct TokioClock {
    base: Timestamp,
    started: tokio::time::Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        let base = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self::starting_at(base)
    }

    pub fn starting_at(base: Timestamp) -> Self {
        Self {
            base,
            started: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> Timestamp {
        let elapsed = tokio::time::Instant::now().duration_since(self.started);
        self.base.saturating_add(elapsed.as_millis() as u64)
    }
}

pub fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Time remaining until `deadline`, zero if it already passed.
pub fn until(clock: &dyn Clock, deadline: Timestamp) -> Duration {
    Duration::from_millis(deadline.saturating_sub(clock.now()))
}

/// Parses the `<int><unit>` duration grammar (`h` hours, `d` days), e.g. "72h", "7d".
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let malformed = || AfterselfError::Config(format!("malformed duration {raw:?}, expected <int>h or <int>d"));

    let unit = raw.chars().last().ok_or_else(malformed)?;
    let digits = &raw[..raw.len() - unit.len_utf8()];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed());
    }
    let value: u64 = digits.parse().map_err(|_| malformed())?;
    let scale = match unit {
        'h' => MILLIS_PER_HOUR,
        'd' => MILLIS_PER_DAY,
        _ => return Err(malformed()),
    };
    value
        .checked_mul(scale)
        .map(Duration::from_millis)
        .ok_or_else(malformed)
}

/// Serde adapter for durations: reads either the human grammar ("72h") or integer
/// milliseconds, always writes integer milliseconds.
pub mod duration_serde {
    use super::{millis, parse_duration};
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Millis(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(millis(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Millis(ms) => Ok(Duration::from_millis(ms)),
            Repr::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
        }
    }
}
