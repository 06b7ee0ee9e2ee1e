use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ClusterConfig;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AutoscalerConfig {
    pub cluster: ClusterConfig,
    /// Period of the fixed-interval resync of every autoscaler.
    /// In seconds. Default: 15 sec
    pub resync_period: u64,
    /// Frequency that autoscaler objects are relisted from the api server.
    /// In seconds. Default: 5 sec
    pub list_period: u64,
    /// Number of reconcile workers. Different objects may be
    /// reconciled concurrently, the same object never is.
    /// Default: 1
    pub workers: usize,
    /// Lookback of the recommendation stabilization used
    /// when an autoscaler has no behavior configured,
    /// and the default scale down stabilization window otherwise.
    /// In seconds. Default: 5 min
    pub downscale_stabilization_window: u64,
    /// Minimum change (from 1.0) in the desired-to-actual metrics ratio
    /// for the autoscaler to consider scaling.
    /// Default: 0.1
    pub tolerance: f64,
    /// Period after pod start when CPU samples might be skipped.
    /// In seconds. Default: 5 min
    pub cpu_initialization_period: u64,
    /// Period after pod start during which readiness changes
    /// are treated as initial readiness.
    /// In seconds. Default: 30 sec
    pub delay_of_initial_readiness_status: u64,
    /// Deadline of a single webhook scaler call.
    /// In seconds. Default: 15 sec
    pub webhook_timeout: u64,
    /// How far before now the cron scaler starts walking a schedule.
    /// In seconds. Default: 2 min
    pub cron_lookback: u64,
    /// How long after its most recent firing a time range stays active.
    /// Should cover at least one resync period.
    /// In seconds. Default: 1 min
    pub cron_active_window: u64,
}

impl AutoscalerConfig {
    pub fn resync_period(&self) -> Duration {
        Duration::from_secs(self.resync_period)
    }

    pub fn list_period(&self) -> Duration {
        Duration::from_secs(self.list_period)
    }

    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_secs(self.webhook_timeout)
    }
}

impl Default for AutoscalerConfig {
    fn default() -> Self {
        AutoscalerConfig {
            cluster: ClusterConfig::default(),
            resync_period: 15,
            list_period: 5,
            workers: 1,
            downscale_stabilization_window: 300,
            tolerance: 0.1,
            cpu_initialization_period: 300,
            delay_of_initial_readiness_status: 30,
            webhook_timeout: 15,
            cron_lookback: 120,
            cron_active_window: 60,
        }
    }
}
