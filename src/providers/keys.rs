//! Credential pools with auth-failure tracking.
//!
//! A pool serves one key at a time. Auth failures (401/403) count against the
//! serving key; once a key's consecutive failures exceed the threshold it is
//! deactivated and the pool moves on. If every key ends up inactive the
//! whole pool is reset so one bad credential can never lock a provider out
//! for good.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tracing::{debug, warn};

use crate::notify::{Notification, NotificationLevel, Notifier};
use crate::telemetry;

/// Consecutive auth failures a key may accumulate before deactivation.
pub const DEFAULT_KEY_ERROR_THRESHOLD: u32 = 10;

struct PoolKey {
    secret: Arc<SecretString>,
    is_active: bool,
    error_count: u32,
    last_used: Option<DateTime<Utc>>,
}

struct PoolState {
    keys: Vec<PoolKey>,
    current_index: usize,
}

impl PoolState {
    fn next_active_from(&self, start: usize) -> Option<usize> {
        let n = self.keys.len();
        (0..n)
            .map(|i| (start + i) % n)
            .find(|&i| self.keys[i].is_active)
    }

    fn reset_all(&mut self) {
        for key in &mut self.keys {
            key.is_active = true;
            key.error_count = 0;
        }
        self.current_index = 0;
    }
}

/// A credential handed out for one call.
#[derive(Clone)]
pub struct KeyLease {
    index: usize,
    secret: Arc<SecretString>,
}

impl KeyLease {
    /// Position of the key in its pool.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn expose(&self) -> &str {
        self.secret.expose_secret()
    }

    /// First and last few characters, for logs.
    pub fn preview(&self) -> String {
        let value = self.expose();
        let chars: Vec<char> = value.chars().collect();
        if chars.len() > 8 {
            let head: String = chars[..4].iter().collect();
            let tail: String = chars[chars.len() - 4..].iter().collect();
            format!("{head}...{tail}")
        } else {
            "****".to_owned()
        }
    }
}

impl std::fmt::Debug for KeyLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyLease")
            .field("index", &self.index)
            .field("key", &self.preview())
            .finish()
    }
}

/// Snapshot of one key's health. Never includes the secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyStatus {
    pub index: usize,
    pub is_active: bool,
    pub error_count: u32,
    pub last_used: Option<DateTime<Utc>>,
}

/// The credentials available for one provider.
pub struct KeyPool {
    provider: String,
    threshold: u32,
    state: Mutex<PoolState>,
    notifier: Arc<dyn Notifier>,
}

impl KeyPool {
    pub fn new(
        provider: impl Into<String>,
        keys: impl IntoIterator<Item = SecretString>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let keys = keys
            .into_iter()
            .map(|secret| PoolKey {
                secret: Arc::new(secret),
                is_active: true,
                error_count: 0,
                last_used: None,
            })
            .collect();
        Self {
            provider: provider.into(),
            threshold: DEFAULT_KEY_ERROR_THRESHOLD,
            state: Mutex::new(PoolState {
                keys,
                current_index: 0,
            }),
            notifier,
        }
    }

    pub fn with_threshold(mut self, threshold: u32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn len(&self) -> usize {
        self.lock().keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Index of the key currently being served.
    pub fn current_index(&self) -> usize {
        self.lock().current_index
    }

    /// Pick the key for the next call. `None` only for an empty pool.
    pub fn acquire(&self, now: DateTime<Utc>) -> Option<KeyLease> {
        let (lease, reset) = {
            let mut state = self.lock();
            if state.keys.is_empty() {
                return None;
            }
            let mut reset = false;
            let index = match state.next_active_from(state.current_index) {
                Some(i) => i,
                None => {
                    state.reset_all();
                    reset = true;
                    0
                }
            };
            state.current_index = index;
            let key = &mut state.keys[index];
            key.last_used = Some(now);
            (
                KeyLease {
                    index,
                    secret: key.secret.clone(),
                },
                reset,
            )
        };
        if reset {
            self.announce_reset();
        }
        Some(lease)
    }

    /// The call made with `lease` succeeded.
    pub fn report_success(&self, lease: &KeyLease) {
        if let Some(key) = self.lock().keys.get_mut(lease.index) {
            key.error_count = 0;
        }
    }

    /// The call made with `lease` was rejected as unauthorised.
    ///
    /// Returns whether this failure deactivated the key.
    pub fn report_auth_failure(&self, lease: &KeyLease) -> bool {
        let deactivated = {
            let mut state = self.lock();
            let threshold = self.threshold;
            let Some(key) = state.keys.get_mut(lease.index) else {
                return false;
            };
            key.error_count = key.error_count.saturating_add(1);
            let count = key.error_count;
            debug!(provider = %self.provider, key = lease.index, count, "auth failure");
            if key.is_active && count > threshold {
                key.is_active = false;
                if state.current_index == lease.index
                    && let Some(next) = state.next_active_from(lease.index + 1)
                {
                    state.current_index = next;
                }
                true
            } else {
                false
            }
        };
        if deactivated {
            warn!(provider = %self.provider, key = %lease.preview(), "deactivating credential");
            metrics::counter!(telemetry::KEYS_DEACTIVATED_TOTAL, "provider" => self.provider.clone())
                .increment(1);
            self.notifier.notify(Notification::new(
                NotificationLevel::Warning,
                "keys",
                self.provider.clone(),
                format!(
                    "credential #{} deactivated after {} consecutive auth failures",
                    lease.index + 1,
                    self.threshold + 1
                ),
            ));
        }
        deactivated
    }

    /// Periodic maintenance: rotate to the next active key, or reset the
    /// pool if none is left.
    pub fn sweep(&self) {
        let reset = {
            let mut state = self.lock();
            if state.keys.is_empty() {
                return;
            }
            let start = state.current_index + 1;
            match state.next_active_from(start) {
                Some(next) => {
                    state.current_index = next;
                    false
                }
                None => {
                    state.reset_all();
                    true
                }
            }
        };
        if reset {
            self.announce_reset();
        }
    }

    pub fn status(&self) -> Vec<KeyStatus> {
        self.lock()
            .keys
            .iter()
            .enumerate()
            .map(|(index, k)| KeyStatus {
                index,
                is_active: k.is_active,
                error_count: k.error_count,
                last_used: k.last_used,
            })
            .collect()
    }

    fn announce_reset(&self) {
        warn!(provider = %self.provider, "all credentials inactive, resetting pool");
        self.notifier.notify(Notification::new(
            NotificationLevel::Critical,
            "keys",
            self.provider.clone(),
            "all credentials were inactive; pool reset",
        ));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for KeyPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPool")
            .field("provider", &self.provider)
            .field("threshold", &self.threshold)
            .field("keys", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::ChannelNotifier;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn pool(n: usize) -> (KeyPool, tokio::sync::mpsc::Receiver<Notification>) {
        let (notifier, rx) = ChannelNotifier::new(16);
        let keys = (0..n).map(|i| SecretString::new(format!("secret-key-{i:04}")));
        (KeyPool::new("weather", keys, Arc::new(notifier)), rx)
    }

    #[test]
    fn serves_current_key_until_it_fails() {
        let (pool, _rx) = pool(3);
        for _ in 0..5 {
            assert_eq!(pool.acquire(now()).unwrap().index(), 0);
        }
    }

    #[test]
    fn deactivates_after_threshold_and_rotates() {
        let (pool, mut rx) = pool(3);
        for i in 0..11 {
            let lease = pool.acquire(now()).unwrap();
            assert_eq!(lease.index(), 0);
            assert_eq!(pool.report_auth_failure(&lease), i == 10);
        }
        assert_eq!(pool.acquire(now()).unwrap().index(), 1);
        assert!(!pool.status()[0].is_active);
        assert_eq!(rx.try_recv().unwrap().level, NotificationLevel::Warning);
    }

    #[test]
    fn success_resets_error_count() {
        let (pool, _rx) = pool(1);
        let lease = pool.acquire(now()).unwrap();
        for _ in 0..10 {
            pool.report_auth_failure(&lease);
        }
        pool.report_success(&lease);
        assert!(!pool.report_auth_failure(&lease));
        assert_eq!(pool.status()[0].error_count, 1);
    }

    #[test]
    fn all_inactive_resets_pool() {
        let (pool, mut rx) = pool(2);
        let pool = pool.with_threshold(0);
        let a = pool.acquire(now()).unwrap();
        pool.report_auth_failure(&a);
        let b = pool.acquire(now()).unwrap();
        assert_eq!(b.index(), 1);
        pool.report_auth_failure(&b);
        assert!(pool.status().iter().all(|k| !k.is_active));

        let c = pool.acquire(now()).unwrap();
        assert_eq!(c.index(), 0);
        assert!(pool.status().iter().all(|k| k.is_active && k.error_count == 0));
        let levels: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|n| n.level)
            .collect();
        assert!(levels.contains(&NotificationLevel::Critical));
    }

    #[test]
    fn sweep_rotates_and_resets() {
        let (pool, _rx) = pool(3);
        pool.sweep();
        assert_eq!(pool.current_index(), 1);
        pool.sweep();
        pool.sweep();
        assert_eq!(pool.current_index(), 0);
    }

    #[test]
    fn lease_debug_hides_secret() {
        let (pool, _rx) = pool(1);
        let lease = pool.acquire(now()).unwrap();
        let dbg = format!("{lease:?}");
        assert!(!dbg.contains("secret-key-0000"));
        assert!(dbg.contains("secr...0000"));
    }

    #[test]
    fn empty_pool_yields_nothing() {
        let (pool, _rx) = pool(0);
        assert!(pool.acquire(now()).is_none());
        pool.sweep();
    }
}
