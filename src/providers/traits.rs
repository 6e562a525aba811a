//! The adapter contract every provider implements.
//!
//! Adapters are thin: they translate an operation name plus JSON params into
//! one upstream call and report failures as a [`ProviderError`] carrying the
//! HTTP status when there is one. Quotas, retries, credential rotation,
//! caching and fallback are all handled above the adapter by the
//! [`Orchestrator`](crate::Orchestrator).
//!
//! # Example
//!
//! ```ignore
//! #[async_trait]
//! impl ProviderAdapter for WeatherAdapter {
//!     fn name(&self) -> &str { "weather" }
//!     fn operations(&self) -> Vec<String> { vec!["current".into(), "forecast".into()] }
//!     async fn invoke(&self, req: AdapterRequest<'_>) -> Result<Value, ProviderError> {
//!         // ... one upstream request
//!     }
//! }
//! ```

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ProviderError;

/// One upstream call.
#[derive(Debug, Clone, Copy)]
pub struct AdapterRequest<'a> {
    pub operation: &'a str,
    pub params: &'a Value,
    /// Credential chosen from the service's key pool, if it has one.
    pub credential: Option<&'a str>,
}

/// A provider the orchestrator can call.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Provider name for logging/debugging.
    fn name(&self) -> &str;

    /// Operations this adapter understands.
    fn operations(&self) -> Vec<String>;

    fn supports(&self, operation: &str) -> bool {
        self.operations().iter().any(|op| op == operation)
    }

    /// Perform the call. Must not retry internally.
    async fn invoke(&self, request: AdapterRequest<'_>) -> Result<Value, ProviderError>;
}
