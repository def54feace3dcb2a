use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    agent::{AgentConfig, RpcConfig},
    engine::{CoordinatorConfig, ExecutorConfig, SchedulerConfig},
    observability::ObservabilityConfig,
    store::{ClusterStoreConfig, StoreConfig},
};

/// 代理配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub local_store: StoreConfig,
    pub cluster_store: ClusterStoreConfig,
    pub executor: ExecutorConfig,
    pub scheduler: SchedulerConfig,
    pub coordinator: CoordinatorConfig,
    pub rpc: RpcConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序：
    /// 1. 默认配置
    /// 2. 配置文件（TOML格式）
    /// 3. 环境变量覆盖（前缀: AGENT__）
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder().add_source(
            ConfigBuilder::try_from(&AppConfig::default()).context("构建默认配置失败")?,
        );

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = ["etc/agent.toml", "agent.toml"];
            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("AGENT")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    /// 从TOML字符串加载配置
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;

        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    pub fn validate(&self) -> Result<()> {
        self.agent.validate().context("代理配置验证失败")?;
        self.local_store.validate().context("本地存储配置验证失败")?;
        self.cluster_store
            .validate()
            .context("集群存储配置验证失败")?;
        self.executor.validate().context("执行器配置验证失败")?;
        self.scheduler.validate().context("调度器配置验证失败")?;
        self.coordinator.validate().context("协调器配置验证失败")?;
        self.rpc.validate().context("RPC配置验证失败")?;
        self.observability
            .validate()
            .context("可观测性配置验证失败")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.executor.workers, 8);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = AppConfig::from_toml(
            r#"
            [agent]
            ip = "10.0.0.5"
            port = 2900

            [scheduler]
            interval_ms = 500
            "#,
        )
        .unwrap();

        assert_eq!(config.agent.ip, "10.0.0.5");
        assert_eq!(config.agent.port, 2900);
        assert_eq!(config.scheduler.interval_ms, 500);
        assert_eq!(config.executor.workers, 8);
    }

    #[test]
    fn test_invalid_ip_is_rejected() {
        let result = AppConfig::from_toml(
            r#"
            [agent]
            ip = "not-an-ip"
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
            [agent]
            home = "/opt/agent"

            [observability]
            log_format = "json"
            "#
        )
        .unwrap();

        let config = AppConfig::load(file.path().to_str()).unwrap();
        assert_eq!(config.agent.home, "/opt/agent");
        assert_eq!(config.observability.log_format, super::super::LogFormat::Json);
    }

    #[test]
    fn test_missing_file_is_error() {
        assert!(AppConfig::load(Some("/nonexistent/agent.toml")).is_err());
    }

    #[test]
    fn test_toml_round_trip_hides_password() {
        let mut config = AppConfig::default();
        config.cluster_store.password = Some("secret".to_string());
        let text = config.to_toml().unwrap();
        assert!(!text.contains("secret"));
    }
}
