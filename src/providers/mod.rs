//! Provider adapters and the per-service policies that govern them.
//!
//! - [`ProviderAdapter`]: the contract a provider implements.
//! - [`ServicePolicy`] / [`ServiceDescriptor`]: retry, quota, fallback,
//!   cache and timeout settings bound to an adapter at registration.
//! - [`KeyPool`]: credential rotation on repeated auth failures.
//! - [`retry`]: backoff and the retry/fallback/throw decision.

pub mod fallback;
#[cfg(feature = "http")]
pub mod http;
pub mod keys;
pub mod registry;
pub mod retry;
pub mod traits;

pub use fallback::{FallbackPolicy, FallbackStage};
#[cfg(feature = "http")]
pub use http::{CredentialPlacement, HttpAdapter};
pub use keys::{DEFAULT_KEY_ERROR_THRESHOLD, KeyLease, KeyPool, KeyStatus};
pub use registry::{CachePolicy, ServiceDescriptor, ServicePolicy, ServiceRegistry};
pub use retry::{Decision, RetryPolicy, decide};
pub use traits::{AdapterRequest, ProviderAdapter};
