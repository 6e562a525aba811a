//! Per-call options and call outcomes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{DataType, GeoPoint};

/// Options for a single [`Orchestrator::execute`](crate::Orchestrator::execute) call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallOptions {
    /// Skip cache lookup and write for this call.
    #[serde(default)]
    pub bypass_cache: bool,
    /// Never consult the fallback chain; errors propagate as-is.
    #[serde(default)]
    pub disable_fallback: bool,
    /// Quota units this call consumes. Default: 1.
    #[serde(default = "default_cost")]
    pub cost: u32,
    /// Overrides the service's configured data type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<DataType>,
    /// Geo anchor for proximity reuse. Read from params when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo: Option<GeoPoint>,
    /// Caller knows conditions are severe or fast-changing.
    #[serde(default)]
    pub severe: bool,
    /// Forecast horizon, for TTL scaling. Read from params when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub horizon_hours: Option<u32>,
}

fn default_cost() -> u32 {
    1
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            bypass_cache: false,
            disable_fallback: false,
            cost: default_cost(),
            data_type: None,
            geo: None,
            severe: false,
            horizon_hours: None,
        }
    }
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bypass_cache(mut self, bypass: bool) -> Self {
        self.bypass_cache = bypass;
        self
    }

    pub fn disable_fallback(mut self, disable: bool) -> Self {
        self.disable_fallback = disable;
        self
    }

    pub fn cost(mut self, cost: u32) -> Self {
        self.cost = cost;
        self
    }

    pub fn data_type(mut self, data_type: DataType) -> Self {
        self.data_type = Some(data_type);
        self
    }

    pub fn geo(mut self, point: GeoPoint) -> Self {
        self.geo = Some(point);
        self
    }

    pub fn severe(mut self, severe: bool) -> Self {
        self.severe = severe;
        self
    }

    pub fn horizon_hours(mut self, hours: u32) -> Self {
        self.horizon_hours = Some(hours);
        self
    }
}

/// Where a payload returned by the orchestrator came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "provider")]
pub enum ResponseSource {
    /// Fresh adapter call.
    Network,
    /// Unexpired cache entry.
    Cache,
    /// Expired cache entry served by the fallback chain.
    StaleCache,
    /// Configured static payload served by the fallback chain.
    Static,
    /// Backup provider called by the fallback chain.
    Backup(String),
}

impl ResponseSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseSource::Network => "network",
            ResponseSource::Cache => "cache",
            ResponseSource::StaleCache => "stale_cache",
            ResponseSource::Static => "static",
            ResponseSource::Backup(_) => "backup",
        }
    }

    /// True for anything produced by the fallback chain.
    pub fn is_fallback(&self) -> bool {
        matches!(
            self,
            ResponseSource::StaleCache | ResponseSource::Static | ResponseSource::Backup(_)
        )
    }
}

/// Payload plus its provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub payload: Value,
    pub source: ResponseSource,
}

impl Outcome {
    pub(crate) fn new(payload: Value, source: ResponseSource) -> Self {
        Self { payload, source }
    }
}
