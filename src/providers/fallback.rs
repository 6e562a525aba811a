//! Degraded-response strategies.
//!
//! When a call cannot be served normally (quota rejection or exhausted
//! retries), the stages of a service's [`FallbackPolicy`] are tried in
//! order and the first one that yields a payload wins. If none does, the
//! original error propagates.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One fallback strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FallbackStage {
    /// Most recent cached payload for the same request, even if expired.
    StaleCache,
    /// A fixed payload.
    Static { payload: Value },
    /// The same operation against another registered service, with its own
    /// fallback disabled.
    BackupProvider { provider: String },
}

impl FallbackStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackStage::StaleCache => "stale_cache",
            FallbackStage::Static { .. } => "static",
            FallbackStage::BackupProvider { .. } => "backup",
        }
    }
}

/// Ordered fallback stages for a service. Empty means errors propagate.
///
/// ```rust
/// # use skirnir::FallbackPolicy;
/// # use serde_json::json;
/// let policy = FallbackPolicy::new()
///     .stale_cache()
///     .static_payload(json!({"temp": null, "degraded": true}));
/// assert_eq!(policy.stages.len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FallbackPolicy {
    #[serde(default)]
    pub stages: Vec<FallbackStage>,
}

impl FallbackPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stale_cache(mut self) -> Self {
        self.stages.push(FallbackStage::StaleCache);
        self
    }

    pub fn static_payload(mut self, payload: Value) -> Self {
        self.stages.push(FallbackStage::Static { payload });
        self
    }

    pub fn backup_provider(mut self, provider: impl Into<String>) -> Self {
        self.stages.push(FallbackStage::BackupProvider {
            provider: provider.into(),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Backup providers named by this policy.
    pub fn backups(&self) -> impl Iterator<Item = &str> {
        self.stages.iter().filter_map(|s| match s {
            FallbackStage::BackupProvider { provider } => Some(provider.as_str()),
            _ => None,
        })
    }
}
