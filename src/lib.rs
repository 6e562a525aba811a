//! Skirnir - resilient orchestration layer for external data provider APIs
//!
//! Every outbound call goes through one [`Orchestrator`], which consults the
//! adaptive cache first, enforces per-provider quotas, retries transient
//! failures with exponential backoff, rotates credentials that keep failing
//! authentication, and degrades to stale data, static payloads or a backup
//! provider when the primary cannot answer. Batches of location-bound
//! requests are clustered so that nearby points share one upstream call.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use serde_json::json;
//! use skirnir::providers::HttpAdapter;
//! use skirnir::{
//!     CachePolicy, CallOptions, DataType, FallbackPolicy, Orchestrator, RateLimitPolicy,
//!     RetryPolicy, ServicePolicy,
//! };
//!
//! #[tokio::main]
//! async fn main() -> skirnir::Result<()> {
//!     let weather = HttpAdapter::new("weather", "https://api.example.com/v1")?
//!         .get("current", "/current");
//!
//!     let orchestrator = Orchestrator::builder()
//!         .register_service(
//!             "weather",
//!             Arc::new(weather),
//!             ServicePolicy::new()
//!                 .retry(RetryPolicy::new().max_retries(2))
//!                 .rate_limit(RateLimitPolicy::new().window("daily", Duration::from_secs(86_400), 1_000))
//!                 .fallback(FallbackPolicy::new().stale_cache())
//!                 .cache(CachePolicy::for_data_type(DataType::Current))
//!                 .key_env("WEATHER_API_KEY"),
//!         )
//!         .build()
//!         .await?;
//!
//!     let current = orchestrator
//!         .execute("weather", "current", json!({"lat": 59.91, "lon": 10.75}), &CallOptions::new())
//!         .await?;
//!     println!("{current}");
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod geo;
pub mod notify;
pub mod orchestrator;
pub mod providers;
pub mod quota;
pub mod store;
pub mod telemetry;
pub mod types;

/// Crate version from Cargo metadata.
pub const PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

// Re-export main types at crate root
pub use cache::{AdaptiveCache, CacheConfig, TtlPolicy};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::OrchestratorConfig;
pub use error::{ProviderError, Result, SkirnirError};
pub use geo::{ClusterOptions, OptimizedBatch, optimize_requests, reconstruct};
pub use notify::{ChannelNotifier, Notification, NotificationLevel, Notifier, TracingNotifier};
pub use orchestrator::{
    MaintenanceConfig, MaintenanceHandle, MetricsSnapshot, Orchestrator, OrchestratorBuilder,
};
pub use providers::{
    AdapterRequest, CachePolicy, FallbackPolicy, FallbackStage, KeyPool, ProviderAdapter,
    RetryPolicy, ServicePolicy,
};
pub use quota::{QuotaTracker, QuotaWindow, RateLimitPolicy};
pub use store::{DurableStore, MemoryStore};
pub use types::{CallOptions, DataType, GeoPoint, Outcome, ResponseSource};
