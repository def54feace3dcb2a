use async_trait::async_trait;

use agent_core::config::ClusterStoreConfig;
use agent_core::AgentResult;
use agent_domain::{ClusterConnector, ClusterStores};

use super::manager::DatabaseManager;

/// 按URL打开集群存储并建表
pub struct SqlClusterConnector {
    config: ClusterStoreConfig,
}

impl SqlClusterConnector {
    pub fn new(config: ClusterStoreConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ClusterConnector for SqlClusterConnector {
    async fn connect(&self, database_url: &str) -> AgentResult<ClusterStores> {
        let store = DatabaseManager::open_cluster(&self.config, database_url).await?;
        Ok(ClusterStores::from_store(store))
    }
}
