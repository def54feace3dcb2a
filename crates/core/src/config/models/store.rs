use serde::{Deserialize, Serialize};

/// 本地存储配置
///
/// `url` 为空时使用 `<home>/etc/agent.db`。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub url: Option<String>,
    pub max_connections: u32,
    pub connection_timeout_seconds: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 5,
            connection_timeout_seconds: 30,
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(url) = &self.url {
            if !url.starts_with("sqlite:") {
                return Err(anyhow::anyhow!("本地存储URL必须是SQLite格式: {}", url));
            }
        }
        if self.max_connections == 0 {
            return Err(anyhow::anyhow!("最大连接数必须大于0"));
        }
        if self.connection_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("连接超时时间必须大于0"));
        }
        Ok(())
    }

    pub fn resolve_url(&self, home: &str) -> String {
        match &self.url {
            Some(url) => url.clone(),
            None => format!(
                "sqlite://{}/etc/agent.db?mode=rwc",
                home.trim_end_matches('/')
            ),
        }
    }
}

/// 集群存储配置
///
/// 集群存储只在 CLUSTER 代理上可用，通常由"初始化集群"任务写入本地存储，
/// 这里的 `url` 仅用于启动时显式指定。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterStoreConfig {
    pub url: Option<String>,
    /// 数据库root密码，通常来自 `--root-password` 或 `AGENT_ROOT_PASSWORD`
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub max_connections: u32,
    pub connection_timeout_seconds: u64,
}

impl Default for ClusterStoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            password: None,
            max_connections: 10,
            connection_timeout_seconds: 10,
        }
    }
}

impl ClusterStoreConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(url) = &self.url {
            if !url.starts_with("mysql://") && !url.starts_with("sqlite:") {
                return Err(anyhow::anyhow!("集群存储URL格式无效: {}", url));
            }
        }
        if self.max_connections == 0 {
            return Err(anyhow::anyhow!("最大连接数必须大于0"));
        }
        if self.connection_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("连接超时时间必须大于0"));
        }
        Ok(())
    }

    /// 把密码填入不带密码的 `mysql://user@host` 形式URL
    pub fn with_password(&self, url: &str) -> String {
        let Some(password) = self.password.as_deref().filter(|p| !p.is_empty()) else {
            return url.to_string();
        };
        let Some(rest) = url.strip_prefix("mysql://") else {
            return url.to_string();
        };
        match rest.split_once('@') {
            Some((user, host)) if !user.contains(':') => {
                format!("mysql://{user}:{password}@{host}")
            }
            _ => url.to_string(),
        }
    }
}
