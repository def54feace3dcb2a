use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::RPC_TIMEOUT;

/// 代理自身配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// 对外服务的IP，同时作为代理身份的一部分
    pub ip: String,
    pub port: u16,
    /// 代理home目录，包含 bin/ lib/ etc/ run/
    pub home: String,
    /// 升级模式下等待旧进程退出的最长时间
    pub upgrade_wait_seconds: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            ip: "127.0.0.1".to_string(),
            port: 2886,
            home: ".".to_string(),
            upgrade_wait_seconds: 60,
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ip.is_empty() {
            return Err(anyhow::anyhow!("IP地址不能为空"));
        }
        if self.ip.parse::<std::net::IpAddr>().is_err() {
            return Err(anyhow::anyhow!("IP地址格式无效: {}", self.ip));
        }
        if self.port == 0 {
            return Err(anyhow::anyhow!("端口必须大于0"));
        }
        if self.home.is_empty() {
            return Err(anyhow::anyhow!("home目录不能为空"));
        }
        Ok(())
    }

    pub fn home_path(&self) -> PathBuf {
        PathBuf::from(&self.home)
    }

    pub fn run_dir(&self) -> PathBuf {
        self.home_path().join("run")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.run_dir().join("agent.pid")
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// 代理间RPC配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub timeout_seconds: u64,
    pub cors_enabled: bool,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: RPC_TIMEOUT.as_secs(),
            cors_enabled: false,
        }
    }
}

impl RpcConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.timeout_seconds == 0 {
            return Err(anyhow::anyhow!("RPC超时时间必须大于0"));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}
