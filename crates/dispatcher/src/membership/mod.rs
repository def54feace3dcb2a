//! 集群成员管理
//!
//! 加入、初始化集群与离开集群都以本地DAG的形式执行，每一步是一个内置子任务，
//! 失败后可以通过DAG操作重试或回滚。子任务通过 [`AgentServices`] 访问代理的
//! 身份、存储与对端客户端。

mod service;
mod tasks;

use std::any::Any;
use std::sync::Arc;

use agent_core::AgentResult;
use agent_domain::{
    ClusterConnector, ClusterStoreSlot, IdentityManager, LocalStores, PeerClient,
    TaskEnvironment, TaskRegistry,
};

use crate::coordinator::Coordinator;
use crate::synchronizer::AgentSynchronizer;

pub use service::AgentService;
pub use tasks::{
    AttachFollowersTask, BecomeClusterTask, ConnectClusterStoreTask, JoinMasterTask,
    JoinSelfTask, LeaveClusterTask, RegisterClusterAgentsTask, SuspendCoordinatorTask,
};

/// 本地键值表中记录集群存储地址的键
pub const CLUSTER_STORE_URL_KEY: &str = "cluster_store_url";

/// 内置子任务的执行环境
pub struct AgentServices {
    pub identity: Arc<IdentityManager>,
    pub local: LocalStores,
    pub slot: ClusterStoreSlot,
    pub connector: Arc<dyn ClusterConnector>,
    pub peers: Arc<dyn PeerClient>,
    pub coordinator: Arc<Coordinator>,
    pub synchronizer: Arc<AgentSynchronizer>,
}

impl TaskEnvironment for AgentServices {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// 注册全部内置子任务
pub fn register_builtin_tasks(registry: &TaskRegistry) -> AgentResult<()> {
    registry.register_task::<JoinSelfTask>()?;
    registry.register_task::<JoinMasterTask>()?;
    registry.register_task::<ConnectClusterStoreTask>()?;
    registry.register_task::<RegisterClusterAgentsTask>()?;
    registry.register_task::<AttachFollowersTask>()?;
    registry.register_task::<BecomeClusterTask>()?;
    registry.register_task::<SuspendCoordinatorTask>()?;
    registry.register_task::<LeaveClusterTask>()?;
    Ok(())
}
