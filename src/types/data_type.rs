//! Payload categories that drive cache lifetime and proximity reuse.

use serde::{Deserialize, Serialize};

/// Kind of data a provider operation returns.
///
/// Each kind has its own base TTL and, for location-bound weather data,
/// a radius inside which a cached result can answer a nearby request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    /// Current conditions.
    Current,
    /// Forecasts (hourly or daily).
    Forecast,
    /// Severe weather alerts.
    Alert,
    /// Past observations; effectively immutable.
    Historical,
    /// Address ↔ coordinate lookups.
    Geocode,
    /// Route planning results.
    Route,
    /// Fitness activity data.
    Activity,
    /// Language-model assistant completions.
    Completion,
    /// Anything else.
    #[default]
    Generic,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Current => "current",
            DataType::Forecast => "forecast",
            DataType::Alert => "alert",
            DataType::Historical => "historical",
            DataType::Geocode => "geocode",
            DataType::Route => "route",
            DataType::Activity => "activity",
            DataType::Completion => "completion",
            DataType::Generic => "generic",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
