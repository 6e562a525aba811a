//! Context-dependent cache lifetimes.
//!
//! A TTL starts from a per-[`DataType`] base and is scaled by the context
//! the payload was fetched in:
//!
//! | Condition | Multiplier |
//! |---|---|
//! | night hours (default 22:00–06:00 local) | ×1.5 |
//! | severe / fast-changing conditions | ×0.5 |
//! | forecast horizon ≤ 6 h | ×0.75 |
//! | forecast horizon ≤ 48 h | ×1.0 |
//! | forecast horizon ≤ 168 h | ×1.5 |
//! | forecast horizon > 168 h | ×2.0 |
//!
//! The result is clamped to `[min_ttl, max_ttl]`. Two identical requests
//! made at different times of day can therefore receive different TTLs.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Offset, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::DataType;

/// Base TTL for a data type when no override is configured.
pub fn default_base_ttl(data_type: DataType) -> Duration {
    let secs = match data_type {
        DataType::Current => 15 * 60,
        DataType::Forecast => 60 * 60,
        DataType::Alert => 5 * 60,
        DataType::Historical => 24 * 3600,
        DataType::Geocode => 7 * 24 * 3600,
        DataType::Route => 30 * 60,
        DataType::Activity => 15 * 60,
        DataType::Completion => 60 * 60,
        DataType::Generic => 10 * 60,
    };
    Duration::from_secs(secs)
}

/// Radius within which a cached result can answer a nearby request.
///
/// Only location-bound weather data is reusable by proximity.
pub fn default_reuse_radius_km(data_type: DataType) -> Option<f64> {
    match data_type {
        DataType::Current => Some(10.0),
        DataType::Forecast => Some(20.0),
        DataType::Alert => Some(5.0),
        DataType::Historical => Some(20.0),
        _ => None,
    }
}

/// Inputs to a TTL decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TtlContext {
    pub data_type: DataType,
    pub at: DateTime<Utc>,
    pub severe: bool,
    pub horizon_hours: Option<u32>,
}

/// TTL rules for one service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TtlPolicy {
    /// Base TTL overrides in seconds, by data type.
    #[serde(default)]
    pub base_secs: HashMap<DataType, u64>,
    /// Reuse radius overrides in kilometres, by data type.
    #[serde(default)]
    pub reuse_radius_km: HashMap<DataType, f64>,
    /// First night hour (local). Default: 22.
    #[serde(default = "default_night_start")]
    pub night_start_hour: u32,
    /// First day hour (local). Default: 6.
    #[serde(default = "default_night_end")]
    pub night_end_hour: u32,
    #[serde(default = "default_night_multiplier")]
    pub night_multiplier: f64,
    #[serde(default = "default_severe_multiplier")]
    pub severe_multiplier: f64,
    /// Offset of "local" time from UTC, in minutes. Default: 0.
    #[serde(default)]
    pub utc_offset_minutes: i32,
    #[serde(default = "default_min_ttl")]
    pub min_ttl_secs: u64,
    #[serde(default = "default_max_ttl")]
    pub max_ttl_secs: u64,
}

fn default_night_start() -> u32 {
    22
}

fn default_night_end() -> u32 {
    6
}

fn default_night_multiplier() -> f64 {
    1.5
}

fn default_severe_multiplier() -> f64 {
    0.5
}

fn default_min_ttl() -> u64 {
    60
}

fn default_max_ttl() -> u64 {
    7 * 24 * 3600
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            base_secs: HashMap::new(),
            reuse_radius_km: HashMap::new(),
            night_start_hour: default_night_start(),
            night_end_hour: default_night_end(),
            night_multiplier: default_night_multiplier(),
            severe_multiplier: default_severe_multiplier(),
            utc_offset_minutes: 0,
            min_ttl_secs: default_min_ttl(),
            max_ttl_secs: default_max_ttl(),
        }
    }
}

impl TtlPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the base TTL for one data type.
    pub fn base(mut self, data_type: DataType, ttl: Duration) -> Self {
        self.base_secs.insert(data_type, ttl.as_secs());
        self
    }

    /// Override the reuse radius for one data type.
    pub fn reuse_radius(mut self, data_type: DataType, km: f64) -> Self {
        self.reuse_radius_km.insert(data_type, km);
        self
    }

    pub fn utc_offset_minutes(mut self, minutes: i32) -> Self {
        self.utc_offset_minutes = minutes;
        self
    }

    pub fn base_ttl(&self, data_type: DataType) -> Duration {
        self.base_secs
            .get(&data_type)
            .map(|s| Duration::from_secs(*s))
            .unwrap_or_else(|| default_base_ttl(data_type))
    }

    pub fn reuse_radius_for(&self, data_type: DataType) -> Option<f64> {
        self.reuse_radius_km
            .get(&data_type)
            .copied()
            .or_else(|| default_reuse_radius_km(data_type))
    }

    /// Whether `at` falls in the configured night hours.
    pub fn is_night(&self, at: DateTime<Utc>) -> bool {
        let offset =
            FixedOffset::east_opt(self.utc_offset_minutes * 60).unwrap_or_else(|| Utc.fix());
        let hour = at.with_timezone(&offset).hour();
        let (start, end) = (self.night_start_hour % 24, self.night_end_hour % 24);
        if start <= end {
            (start..end).contains(&hour)
        } else {
            hour >= start || hour < end
        }
    }

    /// TTL for a payload fetched in `ctx`.
    pub fn ttl_for(&self, ctx: &TtlContext) -> Duration {
        let mut secs = self.base_ttl(ctx.data_type).as_secs_f64();
        if self.is_night(ctx.at) {
            secs *= self.night_multiplier;
        }
        if ctx.severe {
            secs *= self.severe_multiplier;
        }
        if let Some(h) = ctx.horizon_hours {
            secs *= horizon_multiplier(h);
        }
        let min = self.min_ttl_secs as f64;
        let max = (self.max_ttl_secs as f64).max(min);
        if secs.is_nan() {
            return Duration::from_secs(self.min_ttl_secs);
        }
        Duration::try_from_secs_f64(secs.clamp(min, max))
            .unwrap_or_else(|_| Duration::from_secs(self.max_ttl_secs.max(self.min_ttl_secs)))
    }

    /// Reject multipliers that would make [`ttl_for`](Self::ttl_for) meaningless.
    pub fn validate(&self) -> std::result::Result<(), String> {
        for (name, value) in [
            ("night_multiplier", self.night_multiplier),
            ("severe_multiplier", self.severe_multiplier),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(format!("{name} must be a positive finite number, got {value}"));
            }
        }
        if let Some((data_type, km)) = self
            .reuse_radius_km
            .iter()
            .find(|(_, km)| !km.is_finite() || **km <= 0.0)
        {
            return Err(format!(
                "reuse radius for {data_type:?} must be positive, got {km}"
            ));
        }
        Ok(())
    }
}

fn horizon_multiplier(hours: u32) -> f64 {
    match hours {
        0..=6 => 0.75,
        7..=48 => 1.0,
        49..=168 => 1.5,
        _ => 2.0,
    }
}

/// Whether a payload reports severe or fast-changing conditions.
///
/// Recognises a non-empty top-level `alerts` array, `"severe": true`, and
/// `"severity"` of `"severe"` or `"extreme"`.
pub fn payload_signals_severe(payload: &Value) -> bool {
    if payload
        .get("alerts")
        .and_then(Value::as_array)
        .is_some_and(|a| !a.is_empty())
    {
        return true;
    }
    if payload.get("severe").and_then(Value::as_bool) == Some(true) {
        return true;
    }
    matches!(
        payload.get("severity").and_then(Value::as_str),
        Some(s) if s.eq_ignore_ascii_case("severe") || s.eq_ignore_ascii_case("extreme")
    )
}

/// Forecast horizon read from params (`hours`, `horizon_hours` or `days`).
pub fn horizon_from_params(params: &Value) -> Option<u32> {
    let as_u32 = |v: &Value| v.as_u64().and_then(|n| u32::try_from(n).ok());
    params
        .get("horizon_hours")
        .and_then(as_u32)
        .or_else(|| params.get("hours").and_then(as_u32))
        .or_else(|| {
            params
                .get("days")
                .and_then(as_u32)
                .map(|d| d.saturating_mul(24))
        })
}
