use std::sync::Arc;
use std::time::Duration;

use sqlx::any::{install_default_drivers, AnyPoolOptions};
use sqlx::AnyPool;
use tracing::{debug, info};

use agent_core::config::{ClusterStoreConfig, StoreConfig};
use agent_core::{AgentError, AgentResult};
use agent_domain::StoreScope;

use super::schema;
use super::SqlStore;

/// 数据库类型，决定SQL方言
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseType {
    Sqlite,
    Mysql,
}

impl DatabaseType {
    pub fn from_url(url: &str) -> AgentResult<Self> {
        if url.starts_with("sqlite:") {
            Ok(DatabaseType::Sqlite)
        } else if url.starts_with("mysql://") {
            Ok(DatabaseType::Mysql)
        } else {
            Err(AgentError::Configuration(format!(
                "不支持的数据库URL: {}",
                mask_url(url)
            )))
        }
    }

    /// 当前时间的毫秒数
    pub fn now_expr(&self) -> &'static str {
        match self {
            DatabaseType::Sqlite => {
                "CAST(ROUND((julianday('now') - 2440587.5) * 86400000.0) AS INTEGER)"
            }
            DatabaseType::Mysql => "CAST(UNIX_TIMESTAMP(NOW(6)) * 1000 AS SIGNED)",
        }
    }

    pub fn insert_ignore(&self) -> &'static str {
        match self {
            DatabaseType::Sqlite => "INSERT OR IGNORE",
            DatabaseType::Mysql => "INSERT IGNORE",
        }
    }

    /// 生成带占位符的upsert语句，`keys` 之外的列在冲突时被覆盖
    pub fn upsert(&self, table: &str, columns: &[&str], keys: &[&str]) -> String {
        let placeholders = vec!["?"; columns.len()].join(", ");
        let updates = columns
            .iter()
            .filter(|c| !keys.contains(c))
            .map(|c| match self {
                DatabaseType::Sqlite => format!("{c} = excluded.{c}"),
                DatabaseType::Mysql => format!("{c} = VALUES({c})"),
            })
            .collect::<Vec<_>>()
            .join(", ");
        let conflict = match self {
            DatabaseType::Sqlite => format!("ON CONFLICT({}) DO UPDATE SET", keys.join(", ")),
            DatabaseType::Mysql => "ON DUPLICATE KEY UPDATE".to_string(),
        };
        format!(
            "INSERT INTO {table} ({}) VALUES ({placeholders}) {conflict} {updates}",
            columns.join(", ")
        )
    }

    pub(crate) fn auto_increment_key(&self) -> &'static str {
        match self {
            DatabaseType::Sqlite => "INTEGER PRIMARY KEY AUTOINCREMENT",
            DatabaseType::Mysql => "BIGINT PRIMARY KEY AUTO_INCREMENT",
        }
    }

    pub(crate) fn text_type(&self) -> &'static str {
        match self {
            DatabaseType::Sqlite => "TEXT",
            DatabaseType::Mysql => "LONGTEXT",
        }
    }
}

/// 数据库连接管理器
pub struct DatabaseManager {
    pool: AnyPool,
    db_type: DatabaseType,
    display_url: String,
}

impl DatabaseManager {
    pub async fn connect(
        url: &str,
        max_connections: u32,
        connect_timeout: Duration,
    ) -> AgentResult<Self> {
        install_default_drivers();
        let db_type = DatabaseType::from_url(url)?;

        // 内存数据库每个连接都是独立的库
        let max_connections = if url.contains(":memory:") || url.contains("mode=memory") {
            1
        } else {
            max_connections
        };

        let pool = AnyPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(connect_timeout)
            .connect(url)
            .await?;

        info!("数据库连接成功: {}", mask_url(url));
        Ok(Self {
            pool,
            db_type,
            display_url: mask_url(url),
        })
    }

    /// 建表；集群存储额外写入维护者记录的初始行
    pub async fn init_schema(&self, scope: StoreScope) -> AgentResult<()> {
        for statement in schema::create_statements(self.db_type) {
            sqlx::query(&statement).execute(&self.pool).await?;
        }
        if scope == StoreScope::Cluster {
            sqlx::query(&schema::seed_maintainer(self.db_type))
                .execute(&self.pool)
                .await?;
        }
        debug!("数据库表结构就绪: {} ({:?})", self.display_url, scope);
        Ok(())
    }

    pub async fn health_check(&self) -> AgentResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn db_type(&self) -> DatabaseType {
        self.db_type
    }

    pub fn store(&self, scope: StoreScope) -> Arc<SqlStore> {
        SqlStore::new(self.pool.clone(), self.db_type, scope)
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!("数据库连接已关闭: {}", self.display_url);
    }

    /// 打开本地存储，数据库文件不存在时创建
    pub async fn open_local(config: &StoreConfig, home: &str) -> AgentResult<Arc<SqlStore>> {
        let url = config.resolve_url(home);
        if let Some(dir) = sqlite_parent_dir(&url) {
            std::fs::create_dir_all(&dir).map_err(|e| {
                AgentError::StoreUnavailable(format!("创建本地存储目录失败 {dir}: {e}"))
            })?;
        }
        let manager = Self::connect(
            &url,
            config.max_connections,
            Duration::from_secs(config.connection_timeout_seconds),
        )
        .await?;
        manager.init_schema(StoreScope::Local).await?;
        Ok(manager.store(StoreScope::Local))
    }

    /// 打开集群存储，`url` 中缺少密码时使用配置中的root密码
    pub async fn open_cluster(config: &ClusterStoreConfig, url: &str) -> AgentResult<Arc<SqlStore>> {
        let url = config.with_password(url);
        let manager = Self::connect(
            &url,
            config.max_connections,
            Duration::from_secs(config.connection_timeout_seconds),
        )
        .await?;
        manager.init_schema(StoreScope::Cluster).await?;
        Ok(manager.store(StoreScope::Cluster))
    }
}

fn sqlite_parent_dir(url: &str) -> Option<String> {
    let path = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))?;
    let path = path.split('?').next()?;
    if path.is_empty() || path.contains(":memory:") {
        return None;
    }
    let parent = std::path::Path::new(path).parent()?;
    let parent = parent.to_string_lossy().to_string();
    (!parent.is_empty()).then_some(parent)
}

/// 隐藏URL中的密码，用于日志
pub fn mask_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    match rest.split_once('@') {
        Some((credentials, host)) => match credentials.split_once(':') {
            Some((user, _)) => format!("{scheme}://{user}:***@{host}"),
            None => url.to_string(),
        },
        None => url.to_string(),
    }
}

/// 数据库拒绝了账号或密码
pub fn is_access_denied(err: &AgentError) -> bool {
    match err {
        AgentError::Database(sqlx::Error::Database(db)) => {
            db.code().as_deref() == Some("28000") || db.message().contains("Access denied")
        }
        AgentError::Database(e) => e.to_string().contains("Access denied"),
        _ => false,
    }
}
