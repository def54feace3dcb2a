//! 存储抽象
//!
//! 本地存储与集群存储使用同一套表结构，因此共享同一组接口：
//! - [`TaskStore`]：DAG / 节点 / 子任务、子任务日志、任务映射
//! - [`AgentStore`]：集群成员表
//! - [`MaintainerStore`]：维护者租约（仅集群存储）
//! - [`LocalMetaStore`]：自身身份记录与键值表（仅本地存储）
//!
//! 子任务状态迁移都是单行比较并交换，条件不满足时返回
//! [`AgentError::ConflictingState`](agent_core::AgentError::ConflictingState)。

use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use agent_core::AgentResult;

use crate::context::TaskContext;
use crate::entities::{
    AgentInstance, AgentKey, DagInstance, MaintainerRecord, NodeInstance, Operator,
    RemoteSubTask, StoreScope, SubTaskInstance, SubTaskLog, SubTaskUpdate, TaskMapping, TaskState,
};
use crate::template::DagTemplate;

#[async_trait]
pub trait TaskStore: Send + Sync {
    fn scope(&self) -> StoreScope;

    /// 当前时间（毫秒）：集群存储读取数据库时钟，本地存储读取OS时钟
    async fn now(&self) -> AgentResult<i64>;

    // ---- DAG ----

    /// 一次性创建DAG、节点与全部子任务
    async fn create_dag(
        &self,
        template: &DagTemplate,
        context: &TaskContext,
        default_agent: &AgentKey,
    ) -> AgentResult<DagInstance>;
    async fn get_dag(&self, id: i64) -> AgentResult<Option<DagInstance>>;
    async fn get_unfinished_dags(&self) -> AgentResult<Vec<DagInstance>>;
    async fn get_recent_dags(&self, limit: i64) -> AgentResult<Vec<DagInstance>>;
    /// 进入终态时写入 end_time 并清除 maintenance 标记
    async fn update_dag_state(&self, id: i64, state: TaskState) -> AgentResult<()>;
    /// 以 (operator, state) 为条件修改DAG的操作类型
    async fn set_dag_operator(
        &self,
        dag: &DagInstance,
        operator: Operator,
        state: TaskState,
    ) -> AgentResult<()>;
    async fn update_dag_context(&self, id: i64, context: &TaskContext) -> AgentResult<()>;

    // ---- 节点 ----

    async fn get_nodes(&self, dag_id: i64) -> AgentResult<Vec<NodeInstance>>;
    async fn update_node(&self, node: &NodeInstance) -> AgentResult<()>;

    // ---- 子任务 ----

    async fn get_sub_task(&self, id: i64) -> AgentResult<Option<SubTaskInstance>>;
    async fn get_sub_tasks(&self, node_id: i64) -> AgentResult<Vec<SubTaskInstance>>;
    /// READY 或 RUNNING 的子任务，用于执行器崩溃恢复
    async fn get_unfinished_sub_tasks(&self) -> AgentResult<Vec<SubTaskInstance>>;
    /// 以 (state, operator, execute_times) 为条件重置为 READY
    async fn set_sub_task_ready(
        &self,
        task: &SubTaskInstance,
        operator: Operator,
        execute_times: i64,
        context: &TaskContext,
    ) -> AgentResult<()>;
    /// READY -> RUNNING
    async fn start_sub_task(&self, id: i64, execute_times: i64, operator: Operator)
        -> AgentResult<()>;
    /// READY/RUNNING -> 终态
    async fn finish_sub_task(
        &self,
        id: i64,
        execute_times: i64,
        operator: Operator,
        state: TaskState,
        context: &TaskContext,
    ) -> AgentResult<()>;
    /// 调度器使用：未完成 -> FAILED
    async fn set_sub_task_failed(&self, id: i64, execute_times: i64) -> AgentResult<()>;
    /// 调度器使用：非RUNNING -> PASS
    async fn set_sub_task_pass(&self, id: i64, execute_times: i64) -> AgentResult<()>;
    async fn set_sub_task_operator(
        &self,
        id: i64,
        execute_times: i64,
        operator: Operator,
    ) -> AgentResult<()>;
    /// 应用执行代理上报的状态（集群存储）
    async fn apply_sub_task_update(&self, update: &SubTaskUpdate) -> AgentResult<()>;

    // ---- 镜像与映射（本地存储）----

    /// 把集群子任务镜像到本地，返回本地子任务id；同一次执行重复调用是幂等的
    async fn create_local_by_remote(&self, remote: &RemoteSubTask) -> AgentResult<i64>;
    async fn get_mapping(&self, local_task_id: i64) -> AgentResult<Option<TaskMapping>>;
    async fn get_mapping_by_remote(&self, remote_task_id: i64)
        -> AgentResult<Option<TaskMapping>>;
    async fn set_mapping_synced(&self, local_task_id: i64, execute_times: i64) -> AgentResult<()>;
    async fn get_unsynced_mappings(&self) -> AgentResult<Vec<TaskMapping>>;

    // ---- 日志 ----

    async fn append_log(&self, sub_task_id: i64, execute_times: i64, content: &str)
        -> AgentResult<()>;
    async fn get_logs(&self, sub_task_id: i64) -> AgentResult<Vec<SubTaskLog>>;
}

/// 成员表：集群存储中为权威数据，本地存储中为同步得到的镜像
#[async_trait]
pub trait AgentStore: Send + Sync {
    async fn list_agents(&self) -> AgentResult<Vec<AgentInstance>>;
    async fn get_agent(&self, key: &AgentKey) -> AgentResult<Option<AgentInstance>>;
    async fn upsert_agent(&self, agent: &AgentInstance) -> AgentResult<()>;
    async fn delete_agent(&self, key: &AgentKey) -> AgentResult<bool>;
}

#[async_trait]
pub trait MaintainerStore: Send + Sync {
    /// 读取维护者记录，附带数据库当前时间
    async fn get_maintainer(&self) -> AgentResult<MaintainerRecord>;
    /// 续约：仅当持有者是自己时成功
    async fn renew_lease(&self, holder: &AgentKey) -> AgentResult<bool>;
    /// 接管：仅当租约已过期时成功
    async fn take_over(&self, holder: &AgentKey, max_active_ms: i64) -> AgentResult<bool>;
    /// 释放租约，其他代理可立即接管
    async fn release_lease(&self, holder: &AgentKey) -> AgentResult<bool>;
}

#[async_trait]
pub trait LocalMetaStore: Send + Sync {
    async fn load_self(&self) -> AgentResult<Option<AgentInstance>>;
    async fn save_self(&self, agent: &AgentInstance) -> AgentResult<()>;
    async fn get_kv(&self, key: &str) -> AgentResult<Option<String>>;
    async fn set_kv(&self, key: &str, value: &str) -> AgentResult<()>;
    async fn delete_kv(&self, key: &str) -> AgentResult<()>;
}

/// 本地存储的各个视图
#[derive(Clone)]
pub struct LocalStores {
    pub tasks: Arc<dyn TaskStore>,
    pub agents: Arc<dyn AgentStore>,
    pub meta: Arc<dyn LocalMetaStore>,
}

impl LocalStores {
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: TaskStore + AgentStore + LocalMetaStore + 'static,
    {
        Self {
            tasks: store.clone(),
            agents: store.clone(),
            meta: store,
        }
    }
}

/// 集群存储的各个视图
#[derive(Clone)]
pub struct ClusterStores {
    pub tasks: Arc<dyn TaskStore>,
    pub agents: Arc<dyn AgentStore>,
    pub maintainer: Arc<dyn MaintainerStore>,
}

impl ClusterStores {
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: TaskStore + AgentStore + MaintainerStore + 'static,
    {
        Self {
            tasks: store.clone(),
            agents: store.clone(),
            maintainer: store,
        }
    }
}

/// 集群存储插槽
///
/// 只有CLUSTER代理持有集群存储；初始化集群时接入，离开集群时断开。
/// 所有访问先取快照，为空时调用方按"稍后重试"处理。
#[derive(Clone, Default)]
pub struct ClusterStoreSlot {
    inner: Arc<RwLock<Option<ClusterStores>>>,
}

impl ClusterStoreSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<ClusterStores> {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_attached(&self) -> bool {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    pub fn attach(&self, stores: ClusterStores) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = Some(stores);
    }

    pub fn detach(&self) -> Option<ClusterStores> {
        self.inner.write().unwrap_or_else(|e| e.into_inner()).take()
    }
}
