//! Multi-window quota tracking.
//!
//! Each provider carries any number of independent *fixed* windows (for
//! example 15 minutes and 24 hours). The orchestrator reserves units with
//! [`QuotaTracker::try_reserve`] before each attempt, so the check and the
//! charge happen under one lock. A window's count resets to zero once
//! `now - window_start > window_length`, at which point `window_start`
//! moves to `now`. A burst straddling a boundary can briefly reach twice the
//! nominal limit.
//!
//! # Alerts
//!
//! Charging a window ([`QuotaTracker::try_reserve`] or
//! [`QuotaTracker::record`]) raises a warning at 80% and a critical
//! notification at 95% of any window's limit. Each level fires once per
//! window instance.
//!
//! # Persistence
//!
//! Counters and history are written to the durable store in batches by
//! [`QuotaTracker::persist`] (driven periodically by the orchestrator's
//! maintenance task). [`QuotaTracker::restore`] treats a missing or corrupt
//! snapshot as empty state.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::{Clock, elapsed};
use crate::notify::{Notification, NotificationLevel, Notifier};
use crate::store::DurableStore;
use crate::{Result, SkirnirError};

/// Store key for the persisted snapshot.
pub const QUOTA_STATE_KEY: &str = "skirnir:quota:state";

/// Default number of usage records kept per provider.
pub const DEFAULT_HISTORY_CAPACITY: usize = 1_000;

const WARNING_RATIO: f64 = 0.80;
const CRITICAL_RATIO: f64 = 0.95;
const SNAPSHOT_VERSION: u32 = 1;

/// One fixed window in a provider's rate-limit policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaWindow {
    /// Label used in errors and alerts (e.g. `"15m"`, `"daily"`).
    pub name: String,
    /// Window length in seconds.
    pub length_secs: u64,
    /// Units allowed per window.
    pub limit: u64,
}

impl QuotaWindow {
    pub fn new(name: impl Into<String>, length: Duration, limit: u64) -> Self {
        Self {
            name: name.into(),
            length_secs: length.as_secs(),
            limit,
        }
    }

    pub fn length(&self) -> Duration {
        Duration::from_secs(self.length_secs)
    }
}

/// Rate-limit policy for one provider. No windows means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    #[serde(default)]
    pub windows: Vec<QuotaWindow>,
}

impl RateLimitPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn window(mut self, name: impl Into<String>, length: Duration, limit: u64) -> Self {
        self.windows.push(QuotaWindow::new(name, length, limit));
        self
    }
}

/// Usage of one fixed window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaCounter {
    pub provider: String,
    pub window: String,
    pub window_start: DateTime<Utc>,
    pub window_length_secs: u64,
    pub count: u64,
    pub limit: u64,
    /// Highest alert already raised in this window instance.
    #[serde(default)]
    pub alerted: Option<NotificationLevel>,
}

impl QuotaCounter {
    fn new(provider: &str, window: &QuotaWindow, now: DateTime<Utc>) -> Self {
        Self {
            provider: provider.to_owned(),
            window: window.name.clone(),
            window_start: now,
            window_length_secs: window.length_secs,
            count: 0,
            limit: window.limit,
            alerted: None,
        }
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        elapsed(self.window_start, now) > Duration::from_secs(self.window_length_secs)
    }

    /// Count as it would read after applying the reset rule at `now`.
    fn effective_count(&self, now: DateTime<Utc>) -> u64 {
        if self.is_expired(now) { 0 } else { self.count }
    }

    fn reset_if_expired(&mut self, now: DateTime<Utc>) {
        if self.is_expired(now) {
            debug!(provider = %self.provider, window = %self.window, "quota window reset");
            self.count = 0;
            self.window_start = now;
            self.alerted = None;
        }
    }
}

/// A single recorded provider call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub at: DateTime<Utc>,
    pub cost: u32,
    pub success: bool,
    pub response_time_ms: u64,
}

/// Read-only view of one window, for dashboards and pre-flight checks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowUsage {
    pub window: String,
    pub count: u64,
    pub limit: u64,
    pub remaining: u64,
    pub resets_at: DateTime<Utc>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct ProviderQuota {
    counters: Vec<QuotaCounter>,
    history: VecDeque<UsageRecord>,
}

#[derive(Serialize, Deserialize)]
struct QuotaSnapshot {
    version: u32,
    providers: HashMap<String, ProviderQuota>,
}

/// Per-provider fixed-window quota tracker.
///
/// All state sits behind one `Mutex` that is never held across an await,
/// so concurrent callers on a multi-threaded runtime never lose updates.
pub struct QuotaTracker {
    state: Mutex<HashMap<String, ProviderQuota>>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    history_capacity: usize,
    dirty: AtomicBool,
}

impl QuotaTracker {
    pub fn new(clock: Arc<dyn Clock>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
            clock,
            notifier,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            dirty: AtomicBool::new(false),
        }
    }

    /// Override the per-provider history capacity.
    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity.max(1);
        self
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ProviderQuota>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Install a provider's windows.
    ///
    /// Counters restored from a snapshot are kept when a window of the same
    /// name still exists; its length and limit come from `policy`.
    pub fn register(&self, provider: &str, policy: &RateLimitPolicy) {
        let now = self.clock.now();
        let mut state = self.lock();
        let entry = state.entry(provider.to_owned()).or_default();
        let previous = std::mem::take(&mut entry.counters);
        entry.counters = policy
            .windows
            .iter()
            .map(|w| {
                match previous.iter().find(|c| c.window == w.name) {
                    Some(restored) => QuotaCounter {
                        window_length_secs: w.length_secs,
                        limit: w.limit,
                        ..restored.clone()
                    },
                    None => QuotaCounter::new(provider, w, now),
                }
            })
            .collect();
    }

    /// Whether `cost` more units fit in every window. Never mutates.
    pub fn can_proceed(&self, provider: &str, cost: u32) -> bool {
        self.check(provider, cost).is_ok()
    }

    /// Like [`can_proceed`](Self::can_proceed) but names the blocking window.
    pub fn check(&self, provider: &str, cost: u32) -> Result<()> {
        let now = self.clock.now();
        let state = self.lock();
        match state.get(provider) {
            Some(quota) => blocking_window(provider, quota, cost, now),
            None => Ok(()),
        }
    }

    /// Check and charge `cost` against every window in one step.
    ///
    /// Either every window is charged or none is. Concurrent callers can
    /// never reserve more than a window's limit between them.
    pub fn try_reserve(&self, provider: &str, cost: u32) -> Result<()> {
        let now = self.clock.now();
        let alerts = {
            let mut state = self.lock();
            let Some(quota) = state.get_mut(provider) else {
                return Ok(());
            };
            blocking_window(provider, quota, cost, now)?;
            charge(provider, quota, cost, now)
        };
        self.dirty.store(true, Ordering::Relaxed);
        self.raise(alerts);
        Ok(())
    }

    /// Record the outcome of a call already charged by
    /// [`try_reserve`](Self::try_reserve). Only the history changes.
    pub fn record_outcome(&self, provider: &str, cost: u32, success: bool, response_time_ms: u64) {
        let now = self.clock.now();
        {
            let mut state = self.lock();
            let quota = state.entry(provider.to_owned()).or_default();
            self.push_history(quota, now, cost, success, response_time_ms);
        }
        self.dirty.store(true, Ordering::Relaxed);
    }

    /// Charge one provider call against every window and record it.
    pub fn record(&self, provider: &str, cost: u32, success: bool, response_time_ms: u64) {
        let now = self.clock.now();
        let alerts = {
            let mut state = self.lock();
            let quota = state.entry(provider.to_owned()).or_default();
            let alerts = charge(provider, quota, cost, now);
            self.push_history(quota, now, cost, success, response_time_ms);
            alerts
        };
        self.dirty.store(true, Ordering::Relaxed);
        self.raise(alerts);
    }

    fn push_history(
        &self,
        quota: &mut ProviderQuota,
        now: DateTime<Utc>,
        cost: u32,
        success: bool,
        response_time_ms: u64,
    ) {
        quota.history.push_back(UsageRecord {
            at: now,
            cost,
            success,
            response_time_ms,
        });
        while quota.history.len() > self.history_capacity {
            quota.history.pop_front();
        }
    }

    fn raise(&self, alerts: Vec<Notification>) {
        for alert in alerts {
            self.notifier.notify(alert);
        }
    }

    /// Snapshot of every window for a provider.
    pub fn usage(&self, provider: &str) -> Vec<WindowUsage> {
        let now = self.clock.now();
        let state = self.lock();
        state
            .get(provider)
            .map(|q| {
                q.counters
                    .iter()
                    .map(|c| {
                        let (count, start) = if c.is_expired(now) {
                            (0, now)
                        } else {
                            (c.count, c.window_start)
                        };
                        WindowUsage {
                            window: c.window.clone(),
                            count,
                            limit: c.limit,
                            remaining: c.limit.saturating_sub(count),
                            resets_at: start + chrono::Duration::seconds(c.window_length_secs as i64),
                        }
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Recorded calls for a provider, oldest first.
    pub fn history(&self, provider: &str) -> Vec<UsageRecord> {
        self.lock()
            .get(provider)
            .map(|q| q.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Write the current state to the store if anything changed.
    pub async fn persist(&self, store: &dyn DurableStore) -> Result<()> {
        if !self.dirty.swap(false, Ordering::Relaxed) {
            return Ok(());
        }
        let snapshot = QuotaSnapshot {
            version: SNAPSHOT_VERSION,
            providers: self.lock().clone(),
        };
        let value = serde_json::to_value(&snapshot)?;
        if let Err(e) = store.set(QUOTA_STATE_KEY, value, None).await {
            self.dirty.store(true, Ordering::Relaxed);
            return Err(e);
        }
        debug!(store = store.name(), "persisted quota state");
        Ok(())
    }

    /// Load persisted state. Missing or unreadable state leaves counters empty.
    pub async fn restore(&self, store: &dyn DurableStore) {
        let snapshot = match store.get(QUOTA_STATE_KEY).await {
            Ok(Some(value)) => match serde_json::from_value::<QuotaSnapshot>(value) {
                Ok(s) if s.version == SNAPSHOT_VERSION => s,
                Ok(s) => {
                    warn!(version = s.version, "unsupported quota snapshot version, starting empty");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "corrupt quota snapshot, starting empty");
                    return;
                }
            },
            Ok(None) => {
                debug!("no persisted quota state");
                return;
            }
            Err(e) => {
                warn!(error = %e, "could not read quota state, starting empty");
                return;
            }
        };
        let restored = snapshot.providers.len();
        let mut state = self.lock();
        for (provider, mut quota) in snapshot.providers {
            while quota.history.len() > self.history_capacity {
                quota.history.pop_front();
            }
            let entry = state.entry(provider).or_default();
            // Keep registered window definitions; adopt restored counts.
            if entry.counters.is_empty() {
                entry.counters = quota.counters;
            } else {
                for counter in &mut entry.counters {
                    if let Some(r) = quota.counters.iter().find(|r| r.window == counter.window) {
                        counter.window_start = r.window_start;
                        counter.count = r.count;
                        counter.alerted = r.alerted;
                    }
                }
            }
            entry.history = quota.history;
        }
        info!(providers = restored, "restored quota state");
    }
}

fn blocking_window(provider: &str, quota: &ProviderQuota, cost: u32, now: DateTime<Utc>) -> Result<()> {
    match quota
        .counters
        .iter()
        .find(|c| c.effective_count(now) + u64::from(cost) > c.limit)
    {
        Some(counter) => Err(SkirnirError::RateLimitExceeded {
            provider: provider.to_owned(),
            window: counter.window.clone(),
        }),
        None => Ok(()),
    }
}

/// Add `cost` to every window, returning the alerts newly crossed.
fn charge(
    provider: &str,
    quota: &mut ProviderQuota,
    cost: u32,
    now: DateTime<Utc>,
) -> Vec<Notification> {
    let mut alerts = Vec::new();
    for counter in &mut quota.counters {
        counter.reset_if_expired(now);
        counter.count += u64::from(cost);
        if let Some(level) = threshold_level(counter.count, counter.limit)
            && counter.alerted.is_none_or(|prev| level > prev)
        {
            counter.alerted = Some(level);
            alerts.push(Notification::new(
                level,
                "quota",
                provider,
                format!(
                    "{} of {} units used in the {} window",
                    counter.count, counter.limit, counter.window
                ),
            ));
        }
    }
    alerts
}

fn threshold_level(count: u64, limit: u64) -> Option<NotificationLevel> {
    if limit == 0 {
        return Some(NotificationLevel::Critical);
    }
    let ratio = count as f64 / limit as f64;
    if ratio >= CRITICAL_RATIO {
        Some(NotificationLevel::Critical)
    } else if ratio >= WARNING_RATIO {
        Some(NotificationLevel::Warning)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_levels() {
        assert_eq!(threshold_level(79, 100), None);
        assert_eq!(threshold_level(80, 100), Some(NotificationLevel::Warning));
        assert_eq!(threshold_level(94, 100), Some(NotificationLevel::Warning));
        assert_eq!(threshold_level(95, 100), Some(NotificationLevel::Critical));
        assert_eq!(threshold_level(0, 0), Some(NotificationLevel::Critical));
    }

    #[test]
    fn window_policy_builder() {
        let policy = RateLimitPolicy::new()
            .window("15m", Duration::from_secs(900), 100)
            .window("daily", Duration::from_secs(86_400), 1_000);
        assert_eq!(policy.windows.len(), 2);
        assert_eq!(policy.windows[0].length(), Duration::from_secs(900));
    }
}
