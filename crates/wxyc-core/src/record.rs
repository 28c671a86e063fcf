//! Persisted cache record and the clock it is judged against.
//!
//! Every cached value is wrapped in a [`CacheRecord`] and written as JSON:
//!
//!   {"value": …, "created_at": 1718000000.25, "lifespan": 30.0, "version": 1}
//!
//! `lifespan: null` means the record never expires.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Current record format.  Permanent records written with an older version
/// are dropped by [`crate::cache::Cache::purge`].
pub const RECORD_VERSION: u32 = 1;

pub const ONE_DAY: Duration = Duration::from_secs(60 * 60 * 24);
pub const THIRTY_DAYS: Duration = Duration::from_secs(60 * 60 * 24 * 30);

// ── Lifespan ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Option<f64>", into = "Option<f64>")]
pub enum Lifespan {
    Finite(Duration),
    /// Never expires (confirmed artwork).
    Forever,
}

impl Lifespan {
    pub fn secs(secs: u64) -> Self {
        Self::Finite(Duration::from_secs(secs))
    }

    pub fn is_forever(&self) -> bool {
        matches!(self, Self::Forever)
    }
}

impl From<Duration> for Lifespan {
    fn from(d: Duration) -> Self {
        Self::Finite(d)
    }
}

impl From<Option<f64>> for Lifespan {
    fn from(secs: Option<f64>) -> Self {
        match secs {
            None => Self::Forever,
            // Negative or NaN lifespans come from corrupt writers: treat as already stale.
            Some(s) => Self::Finite(Duration::try_from_secs_f64(s).unwrap_or(Duration::ZERO)),
        }
    }
}

impl From<Lifespan> for Option<f64> {
    fn from(l: Lifespan) -> Self {
        match l {
            Lifespan::Finite(d) => Some(d.as_secs_f64()),
            Lifespan::Forever => None,
        }
    }
}

// ── CacheRecord ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord<T> {
    pub value: T,
    #[serde(with = "epoch_secs")]
    pub created_at: DateTime<Utc>,
    pub lifespan: Lifespan,
    #[serde(default)]
    pub version: u32,
}

impl<T> CacheRecord<T> {
    pub fn new(value: T, lifespan: Lifespan, created_at: DateTime<Utc>) -> Self {
        Self {
            value,
            created_at,
            lifespan,
            version: RECORD_VERSION,
        }
    }

    /// `now > created_at + lifespan`.  Forever records never expire.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.lifespan {
            Lifespan::Forever => false,
            Lifespan::Finite(d) => match TimeDelta::from_std(d) {
                Ok(delta) => match self.created_at.checked_add_signed(delta) {
                    Some(deadline) => now > deadline,
                    None => false,
                },
                // Too large to represent: effectively never.
                Err(_) => false,
            },
        }
    }

    /// A permanent record written by an older format.
    pub fn is_superseded(&self) -> bool {
        self.lifespan.is_forever() && self.version < RECORD_VERSION
    }
}

mod epoch_secs {
    use chrono::{DateTime, Utc};
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(t: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(t.timestamp_micros() as f64 / 1_000_000.0)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let secs = f64::deserialize(d)?;
        if !secs.is_finite() {
            return Err(D::Error::custom("created_at is not finite"));
        }
        DateTime::from_timestamp_micros((secs * 1_000_000.0).round() as i64)
            .ok_or_else(|| D::Error::custom(format!("created_at out of range: {}", secs)))
    }
}

// ── Clock ─────────────────────────────────────────────────────────────────────

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Hand-driven clock for expiry tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(start) }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        if let Ok(delta) = TimeDelta::from_std(by) {
            *now += delta;
        }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
