use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    COORDINATOR_MIN_INTERVAL, DEFAULT_EXECUTOR_WORKERS, DEFAULT_SUB_TASK_TIMEOUT,
    MAINTAINER_MAX_ACTIVE_TIME, SCHEDULER_ERROR_INTERVAL, SCHEDULER_INTERVAL,
    SYNCHRONIZER_INTERVAL, UPSTREAM_RESYNC_INTERVAL,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub workers: usize,
    pub default_timeout_seconds: u64,
    pub resync_interval_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_EXECUTOR_WORKERS,
            default_timeout_seconds: DEFAULT_SUB_TASK_TIMEOUT.as_secs(),
            resync_interval_ms: UPSTREAM_RESYNC_INTERVAL.as_millis() as u64,
        }
    }
}

impl ExecutorConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.workers == 0 {
            return Err(anyhow::anyhow!("执行器工作协程数必须大于0"));
        }
        if self.default_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("子任务默认超时时间必须大于0"));
        }
        if self.resync_interval_ms == 0 {
            return Err(anyhow::anyhow!("上报重试间隔必须大于0"));
        }
        Ok(())
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_seconds)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_millis(self.resync_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub interval_ms: u64,
    pub error_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_ms: SCHEDULER_INTERVAL.as_millis() as u64,
            error_interval_ms: SCHEDULER_ERROR_INTERVAL.as_millis() as u64,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.interval_ms == 0 {
            return Err(anyhow::anyhow!("调度间隔必须大于0"));
        }
        if self.error_interval_ms == 0 {
            return Err(anyhow::anyhow!("调度错误重试间隔必须大于0"));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn error_interval(&self) -> Duration {
        Duration::from_millis(self.error_interval_ms)
    }
}

/// 协调器与成员同步配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub min_interval_ms: u64,
    pub max_active_time_ms: u64,
    pub sync_interval_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: COORDINATOR_MIN_INTERVAL.as_millis() as u64,
            max_active_time_ms: MAINTAINER_MAX_ACTIVE_TIME.as_millis() as u64,
            sync_interval_ms: SYNCHRONIZER_INTERVAL.as_millis() as u64,
        }
    }
}

impl CoordinatorConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.min_interval_ms == 0 {
            return Err(anyhow::anyhow!("协调周期必须大于0"));
        }
        // 续约周期必须明显短于租约，否则维护者会自己失去租约
        if self.max_active_time_ms <= self.min_interval_ms * 3 {
            return Err(anyhow::anyhow!(
                "租约时长({}ms)必须大于协调周期({}ms)的3倍",
                self.max_active_time_ms,
                self.min_interval_ms
            ));
        }
        if self.sync_interval_ms == 0 {
            return Err(anyhow::anyhow!("成员同步周期必须大于0"));
        }
        Ok(())
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn max_active_time(&self) -> Duration {
        Duration::from_millis(self.max_active_time_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_follow_constants() {
        let executor = ExecutorConfig::default();
        assert_eq!(executor.workers, 8);
        assert!(executor.validate().is_ok());

        let coordinator = CoordinatorConfig::default();
        assert_eq!(coordinator.max_active_time(), MAINTAINER_MAX_ACTIVE_TIME);
        assert!(coordinator.validate().is_ok());
    }

    #[test]
    fn test_lease_must_outlive_renewal() {
        let coordinator = CoordinatorConfig {
            min_interval_ms: 1000,
            max_active_time_ms: 2000,
            sync_interval_ms: 1000,
        };
        assert!(coordinator.validate().is_err());
    }
}
