//! Background upkeep: key-pool sweeps and batched quota persistence.

use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::Orchestrator;

/// Intervals for the maintenance tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// Key-pool sweep interval. Default: 60.
    #[serde(default = "default_key_sweep_secs")]
    pub key_sweep_secs: u64,
    /// Quota persistence interval. Default: 300.
    #[serde(default = "default_quota_persist_secs")]
    pub quota_persist_secs: u64,
}

fn default_key_sweep_secs() -> u64 {
    60
}

fn default_quota_persist_secs() -> u64 {
    300
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            key_sweep_secs: default_key_sweep_secs(),
            quota_persist_secs: default_quota_persist_secs(),
        }
    }
}

/// Running maintenance tasks. Dropping the handle stops them.
#[derive(Debug)]
pub struct MaintenanceHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl MaintenanceHandle {
    /// Stop all tasks now.
    pub fn abort(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.tasks.iter().all(JoinHandle::is_finished)
    }
}

impl Drop for MaintenanceHandle {
    fn drop(&mut self) {
        self.abort();
    }
}

impl Orchestrator {
    /// Start the periodic key sweep and quota persistence.
    ///
    /// Tasks hold only a weak reference and exit once the orchestrator is
    /// dropped. Must be called inside a tokio runtime.
    pub fn spawn_maintenance(self: &Arc<Self>) -> MaintenanceHandle {
        let sweep_every = Duration::from_secs(self.maintenance.key_sweep_secs.max(1));
        let persist_every = Duration::from_secs(self.maintenance.quota_persist_secs.max(1));

        let sweep = spawn_periodic(Arc::downgrade(self), sweep_every, |o| async move {
            debug!("sweeping key pools");
            o.sweep_keys();
        });
        let persist = spawn_periodic(Arc::downgrade(self), persist_every, |o| async move {
            if let Err(e) = o.persist_quota().await {
                warn!(error = %e, "quota persistence failed");
            }
        });
        MaintenanceHandle {
            tasks: vec![sweep, persist],
        }
    }
}

fn spawn_periodic<F, Fut>(orchestrator: Weak<Orchestrator>, every: Duration, tick: F) -> JoinHandle<()>
where
    F: Fn(Arc<Orchestrator>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            let Some(o) = orchestrator.upgrade() else {
                break;
            };
            tick(o).await;
        }
    })
}
