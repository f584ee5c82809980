//! Time sources.
//!
//! Two notions of time are used by the renderer:
//! - [`FlushTime`]: wall-clock timestamps attached to content updates and compared
//!   by the SLA monitors. The epoch value is reserved as "invalid".
//! - [`Clock`]: a monotonic source used to pace interruptible rendering through a
//!   [`FrameTimeBudget`].

use std::{
    fmt,
    ops::Add,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Wall-clock timestamp in milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FlushTime(u64);

impl FlushTime {
    /// The epoch. Never a legitimate reading; a clock returning it is treated as faulty.
    pub const INVALID: FlushTime = FlushTime(0);

    pub const fn from_millis(ms: u64) -> Self {
        FlushTime(ms)
    }

    /// Current wall-clock time.
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        FlushTime(dt.timestamp_millis().max(0) as u64)
    }

    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        if !self.is_valid() {
            return None;
        }
        Utc.timestamp_millis_opt(self.0 as i64).single()
    }

    pub const fn as_millis(self) -> u64 {
        self.0
    }

    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl Default for FlushTime {
    fn default() -> Self {
        Self::INVALID
    }
}

impl Add<Duration> for FlushTime {
    type Output = FlushTime;

    fn add(self, rhs: Duration) -> FlushTime {
        let ms = u64::try_from(rhs.as_millis()).unwrap_or(u64::MAX);
        FlushTime(self.0.saturating_add(ms))
    }
}

impl fmt::Display for FlushTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_datetime() {
            Some(dt) => write!(f, "{}", dt.format("%H:%M:%S%.3f")),
            None => write!(f, "<invalid>"),
        }
    }
}

/// Timing data supplied with every flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FlushTimeInfo {
    /// When the content source produced the flush.
    pub created: FlushTime,
    /// Absolute deadline after which the content must not be shown.
    pub expiration: FlushTime,
    /// Maximum allowed time between `created` and the content being rendered.
    pub latency_limit: Option<Duration>,
}

impl FlushTimeInfo {
    pub fn created_at(created: FlushTime) -> Self {
        FlushTimeInfo {
            created,
            ..Default::default()
        }
    }

    pub fn with_expiration(mut self, expiration: FlushTime) -> Self {
        self.expiration = expiration;
        self
    }

    pub fn with_latency_limit(mut self, limit: Duration) -> Self {
        self.latency_limit = Some(limit);
        self
    }
}

/// Monotonic time source.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Clock backed by [`Instant::now`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to. Used by headless drawables and tests.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        ManualClock {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut offset) = self.offset.lock() {
            *offset += by;
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.offset.lock().map(|o| *o).unwrap_or_default()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }
}

/// Time allowance shared by all interruptible renders within one tick.
#[derive(Clone)]
pub struct FrameTimeBudget {
    clock: Arc<dyn Clock>,
    deadline: Instant,
}

impl FrameTimeBudget {
    /// Starts a budget that runs out `allowance` from now.
    pub fn start(clock: Arc<dyn Clock>, allowance: Duration) -> Self {
        let deadline = clock.now() + allowance;
        FrameTimeBudget { clock, deadline }
    }

    pub fn is_exhausted(&self) -> bool {
        self.clock.now() >= self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(self.clock.now())
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

impl fmt::Debug for FrameTimeBudget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameTimeBudget")
            .field("remaining", &self.remaining())
            .finish()
    }
}
