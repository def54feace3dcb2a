pub mod connector;
pub mod manager;
pub mod mapping;
pub mod schema;
pub mod sql_agent_store;
pub mod sql_task_store;

use std::sync::Arc;

use sqlx::AnyPool;

use agent_domain::StoreScope;

pub use connector::SqlClusterConnector;
pub use manager::{is_access_denied, mask_url, DatabaseManager, DatabaseType};

/// 基于sqlx Any驱动的存储实现
///
/// 本地存储（SQLite）与集群存储（MySQL兼容）共用一套SQL，
/// 方言差异集中在 [`DatabaseType`]。
pub struct SqlStore {
    pool: AnyPool,
    db_type: DatabaseType,
    scope: StoreScope,
}

impl SqlStore {
    pub fn new(pool: AnyPool, db_type: DatabaseType, scope: StoreScope) -> Arc<Self> {
        Arc::new(Self {
            pool,
            db_type,
            scope,
        })
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn db_type(&self) -> DatabaseType {
        self.db_type
    }

    /// 数据库端的当前时间（毫秒）表达式
    fn now_expr(&self) -> &'static str {
        self.db_type.now_expr()
    }
}
