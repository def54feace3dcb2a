use async_trait::async_trait;

use agent_core::AgentResult;

use crate::entities::{
    AgentInstance, AgentKey, AllAgentsSyncData, CancelSubTask, ClusterAttachParam,
    JoinMasterParam, RemoteLog, RemoteSubTask, SubTaskUpdate,
};
use crate::events::MaintainerView;
use crate::repositories::ClusterStores;

/// 代理间RPC
///
/// 对端返回409时实现应转换为 `ConflictingState`，调用方据此判断
/// "对方已经前进，本地放弃"。
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// `POST /rpc/v1/task/sub_task`，返回对端本地子任务id
    async fn submit_sub_task(&self, target: &AgentKey, task: &RemoteSubTask) -> AgentResult<i64>;
    /// `PATCH /rpc/v1/task/sub_task`
    async fn update_sub_task(&self, target: &AgentKey, update: &SubTaskUpdate) -> AgentResult<()>;
    /// `DELETE /rpc/v1/task/sub_task`
    async fn cancel_sub_task(&self, target: &AgentKey, cancel: &CancelSubTask) -> AgentResult<()>;
    /// `POST /rpc/v1/task/log`
    async fn push_log(&self, target: &AgentKey, log: &RemoteLog) -> AgentResult<()>;
    /// `GET /rpc/v1/maintainer`
    async fn get_maintainer(&self, target: &AgentKey) -> AgentResult<MaintainerView>;
    /// `POST /rpc/v1/maintainer/update`
    async fn push_agents(&self, target: &AgentKey, data: &AllAgentsSyncData) -> AgentResult<()>;
    /// `POST /rpc/v1/agent/join`，返回主代理信息
    async fn join_master(
        &self,
        target: &AgentKey,
        param: &JoinMasterParam,
    ) -> AgentResult<AgentInstance>;
    /// `POST /rpc/v1/agent/cluster`
    async fn attach_cluster(&self, target: &AgentKey, param: &ClusterAttachParam)
        -> AgentResult<()>;
}

/// 根据URL连接集群存储
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    async fn connect(&self, database_url: &str) -> AgentResult<ClusterStores>;
}
