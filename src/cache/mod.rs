//! Caching subsystem.
//!
//! - [`AdaptiveCache`]: the two-tier response cache consulted by the
//!   orchestrator before any quota or network work.
//! - [`key`]: deterministic keys that ignore volatile params.
//! - [`ttl`]: context-dependent lifetimes (data type, night, severity,
//!   forecast horizon).

mod adaptive;
pub mod key;
pub mod ttl;

pub use adaptive::{
    AdaptiveCache, CacheConfig, CacheEntry, CacheStats, CacheTier, LookupOptions, Resolved,
};
pub use key::CacheKey;
pub use ttl::{TtlContext, TtlPolicy};
