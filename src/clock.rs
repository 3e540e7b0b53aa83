//! Media time representation.
//!
//! The whole audio/video path reasons in microseconds: PES presentation
//! timestamps are converted to microseconds as soon as they are decoded, the
//! QoS policy measures queue depth in microseconds, and the RTSP layer
//! schedules keep-alive windows from them. [`MediaTime`] is a thin signed
//! wrapper so the units can't get mixed up with 90 kHz ticks or nanoseconds.

use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};
use std::time::Duration;

/// A point (or span) on the media timeline, in microseconds.
///
/// Negative values are representable because stream anchoring can place
/// early samples before the zero point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MediaTime(i64);

impl MediaTime {
    /// The zero timestamp.
    pub const ZERO: MediaTime = MediaTime(0);

    /// Create a media time from microseconds.
    pub const fn from_micros(us: i64) -> Self {
        MediaTime(us)
    }

    /// Create a media time from milliseconds.
    pub const fn from_millis(ms: i64) -> Self {
        MediaTime(ms * 1_000)
    }

    /// Create a media time from whole seconds.
    pub const fn from_secs(secs: i64) -> Self {
        MediaTime(secs * 1_000_000)
    }

    /// Microseconds since the timeline origin.
    pub const fn as_micros(&self) -> i64 {
        self.0
    }

    /// Milliseconds since the timeline origin (truncating).
    pub const fn as_millis(&self) -> i64 {
        self.0 / 1_000
    }

    /// Seconds with fractional part.
    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    /// Convert to a [`Duration`]. Negative times clamp to zero.
    pub fn as_duration(&self) -> Duration {
        Duration::from_micros(self.0.max(0) as u64)
    }

    /// Saturating addition.
    pub fn saturating_add(self, other: MediaTime) -> MediaTime {
        MediaTime(self.0.saturating_add(other.0))
    }

    /// Saturating subtraction.
    pub fn saturating_sub(self, other: MediaTime) -> MediaTime {
        MediaTime(self.0.saturating_sub(other.0))
    }
}

impl Add for MediaTime {
    type Output = MediaTime;

    fn add(self, rhs: MediaTime) -> MediaTime {
        MediaTime(self.0 + rhs.0)
    }
}

impl AddAssign for MediaTime {
    fn add_assign(&mut self, rhs: MediaTime) {
        self.0 += rhs.0;
    }
}

impl Sub for MediaTime {
    type Output = MediaTime;

    fn sub(self, rhs: MediaTime) -> MediaTime {
        MediaTime(self.0 - rhs.0)
    }
}

impl SubAssign for MediaTime {
    fn sub_assign(&mut self, rhs: MediaTime) {
        self.0 -= rhs.0;
    }
}

impl fmt::Display for MediaTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}us", self.0)
    }
}

/// Convert a 33-bit 90 kHz PES timestamp into microseconds.
///
/// `us = pts * 100 / 9`, computed in 128 bits so the full 33-bit range
/// survives the multiply.
pub fn pts_to_micros(pts: u64) -> i64 {
    ((pts as i128 * 100) / 9) as i64
}
