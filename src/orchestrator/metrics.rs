//! In-process call statistics.
//!
//! Exported counters go through the `metrics` facade (see
//! [`telemetry`](crate::telemetry)); this module keeps the small rolling
//! windows the orchestrator answers [`service_metrics`] from.
//!
//! [`service_metrics`]: crate::Orchestrator::service_metrics

use std::collections::{HashMap, VecDeque};

use serde::Serialize;

/// Response-time samples kept for the global window.
pub const GLOBAL_SAMPLE_WINDOW: usize = 100;

/// Response-time samples kept per provider.
pub const PROVIDER_SAMPLE_WINDOW: usize = 20;

/// Counters plus a bounded ring of response times.
#[derive(Debug, Clone)]
pub struct MetricsWindow {
    capacity: usize,
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    cache_hits: u64,
    quota_rejections: u64,
    fallbacks: u64,
    retries: u64,
    response_times_ms: VecDeque<u64>,
}

/// Read-only copy of a [`MetricsWindow`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub cache_hits: u64,
    pub quota_rejections: u64,
    pub fallbacks: u64,
    pub retries: u64,
    /// Mean of the retained samples; 0 when there are none.
    pub average_response_time_ms: f64,
    pub samples: usize,
}

impl MetricsSnapshot {
    /// Successful share of completed requests, 0 when idle.
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.successful_requests as f64 / self.total_requests as f64
        }
    }
}

impl MetricsWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            cache_hits: 0,
            quota_rejections: 0,
            fallbacks: 0,
            retries: 0,
            response_times_ms: VecDeque::with_capacity(capacity),
        }
    }

    pub fn record_success(&mut self) {
        self.total_requests += 1;
        self.successful_requests += 1;
    }

    pub fn record_failure(&mut self) {
        self.total_requests += 1;
        self.failed_requests += 1;
    }

    pub fn record_cache_hit(&mut self) {
        self.cache_hits += 1;
    }

    pub fn record_quota_rejection(&mut self) {
        self.quota_rejections += 1;
    }

    pub fn record_fallback(&mut self) {
        self.fallbacks += 1;
    }

    pub fn record_retry(&mut self) {
        self.retries += 1;
    }

    /// Add a sample, dropping the oldest beyond capacity.
    pub fn record_response_time(&mut self, ms: u64) {
        if self.response_times_ms.len() == self.capacity {
            self.response_times_ms.pop_front();
        }
        self.response_times_ms.push_back(ms);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let samples = self.response_times_ms.len();
        let average_response_time_ms = if samples == 0 {
            0.0
        } else {
            self.response_times_ms.iter().sum::<u64>() as f64 / samples as f64
        };
        MetricsSnapshot {
            total_requests: self.total_requests,
            successful_requests: self.successful_requests,
            failed_requests: self.failed_requests,
            cache_hits: self.cache_hits,
            quota_rejections: self.quota_rejections,
            fallbacks: self.fallbacks,
            retries: self.retries,
            average_response_time_ms,
            samples,
        }
    }
}

/// The global window plus one window per provider.
#[derive(Debug)]
pub(crate) struct MetricsBook {
    global: MetricsWindow,
    providers: HashMap<String, MetricsWindow>,
}

impl Default for MetricsBook {
    fn default() -> Self {
        Self {
            global: MetricsWindow::new(GLOBAL_SAMPLE_WINDOW),
            providers: HashMap::new(),
        }
    }
}

impl MetricsBook {
    /// Apply `f` to the global window and `provider`'s window.
    pub(crate) fn update(&mut self, provider: &str, f: impl Fn(&mut MetricsWindow)) {
        f(&mut self.global);
        f(self
            .providers
            .entry(provider.to_owned())
            .or_insert_with(|| MetricsWindow::new(PROVIDER_SAMPLE_WINDOW)));
    }

    pub(crate) fn snapshot(&self, provider: Option<&str>) -> MetricsSnapshot {
        match provider {
            None => self.global.snapshot(),
            Some(p) => self
                .providers
                .get(p)
                .map(MetricsWindow::snapshot)
                .unwrap_or_default(),
        }
    }

    pub(crate) fn reset(&mut self, provider: Option<&str>) {
        match provider {
            None => *self = Self::default(),
            Some(p) => {
                self.providers.remove(p);
            }
        }
    }
}
