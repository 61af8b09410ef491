//! Schedules and the schedule merger.
//!
//! A [`Schedule`] is one consumer's cadence for a component. Several
//! consumers share one instance, so their schedules are merged into a single
//! [`MergedSchedule`] that drives the instance's timer: it runs at least as
//! often and as long as the most demanding consumer needs.
//!
//! Durations are expressed in (possibly fractional) seconds on the wire:
//!
//! ```json
//! { "interval": 60, "duration": 10.5, "opportunistic": true, "strict": false }
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;

/// One consumer's requested cadence.
///
/// `interval` of `None` (or zero) means "fire once".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Schedule {
    pub interval: Option<Duration>,
    pub duration: Duration,
    /// Also deliver data whenever the component produces it on its own.
    pub opportunistic: bool,
    /// Ask for exact wake-ups instead of battery-friendly inexact ones.
    pub strict: bool,
}

impl Schedule {
    /// A fire-once schedule with no active duration.
    pub fn once() -> Self {
        Self::default()
    }

    /// A repeating schedule with the given interval.
    pub fn every(interval: Duration) -> Self {
        Self { interval: Some(interval), ..Self::default() }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn opportunistic(mut self, opportunistic: bool) -> Self {
        self.opportunistic = opportunistic;
        self
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// The repeating interval, or `None` for fire-once schedules.
    pub fn repeat_interval(&self) -> Option<Duration> {
        self.interval.filter(|i| !i.is_zero())
    }

    pub fn is_fire_once(&self) -> bool {
        self.repeat_interval().is_none()
    }

    /// Parse a schedule from its JSON shape, defaulting absent fields.
    pub fn from_value(value: &Value) -> Result<Self, CoreError> {
        Self::default().overlay(value)
    }

    /// Return a copy with every field present in `value` replacing ours.
    ///
    /// Used to apply a `@schedule` annotation over a declared default.
    pub fn overlay(&self, value: &Value) -> Result<Self, CoreError> {
        let raw: RawSchedule = serde_json::from_value(value.clone())
            .map_err(|e| CoreError::config(format!("malformed schedule: {e}")))?;
        let mut out = *self;
        if let Some(secs) = raw.interval {
            out.interval = match secs {
                None => None,
                Some(s) => Some(seconds("interval", s)?),
            };
        }
        if let Some(secs) = raw.duration {
            out.duration = seconds("duration", secs)?;
        }
        if let Some(o) = raw.opportunistic {
            out.opportunistic = o;
        }
        if let Some(s) = raw.strict {
            out.strict = s;
        }
        Ok(out)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(RawScheduleOut::from(self)).unwrap_or(Value::Null)
    }
}

fn seconds(field: &str, secs: f64) -> Result<Duration, CoreError> {
    Duration::try_from_secs_f64(secs)
        .map_err(|_| CoreError::config(format!("schedule {field} must be a non-negative number of seconds, got {secs}")))
}

/// Wire shape. `interval: null` is distinct from an absent interval when
/// overlaying, hence the double option.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSchedule {
    #[serde(default, deserialize_with = "present")]
    interval: Option<Option<f64>>,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    opportunistic: Option<bool>,
    #[serde(default)]
    strict: Option<bool>,
}

fn present<'de, D>(deserializer: D) -> Result<Option<Option<f64>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Option::<f64>::deserialize(deserializer).map(Some)
}

#[derive(Serialize)]
struct RawScheduleOut {
    interval: Option<f64>,
    duration: f64,
    opportunistic: bool,
    strict: bool,
}

impl From<&Schedule> for RawScheduleOut {
    fn from(s: &Schedule) -> Self {
        Self {
            interval: s.repeat_interval().map(|d| d.as_secs_f64()),
            duration: s.duration.as_secs_f64(),
            opportunistic: s.opportunistic,
            strict: s.strict,
        }
    }
}

impl Serialize for Schedule {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        RawScheduleOut::from(self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Schedule {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Schedule::from_value(&value).map_err(serde::de::Error::custom)
    }
}

// ── Merge ────────────────────────────────────────────────────────────────────

/// The cadence that satisfies every consumer of one descriptor.
///
/// Opportunistic delivery is deliberately absent: each request registers for
/// it on its own, the merged schedule only drives the timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MergedSchedule {
    #[serde(serialize_with = "opt_secs")]
    pub interval: Option<Duration>,
    #[serde(serialize_with = "secs")]
    pub duration: Duration,
    pub strict: bool,
}

impl MergedSchedule {
    pub fn is_fire_once(&self) -> bool {
        self.interval.is_none()
    }
}

fn secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

fn opt_secs<S: serde::Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
    match d {
        Some(d) => s.serialize_some(&d.as_secs_f64()),
        None => s.serialize_none(),
    }
}

/// Merge schedules. Returns `None` for an empty input.
///
/// - interval: shortest repeating interval; fire-once only if all are,
/// - duration: longest,
/// - strict: if any is strict.
pub fn merge<'a, I>(schedules: I) -> Option<MergedSchedule>
where
    I: IntoIterator<Item = &'a Schedule>,
{
    let mut merged: Option<MergedSchedule> = None;
    for s in schedules {
        let m = merged.get_or_insert(MergedSchedule {
            interval: None,
            duration: Duration::ZERO,
            strict: false,
        });
        m.interval = match (m.interval, s.repeat_interval()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        m.duration = m.duration.max(s.duration);
        m.strict |= s.strict;
    }
    merged
}
