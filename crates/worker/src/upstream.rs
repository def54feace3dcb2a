use async_trait::async_trait;

use agent_core::AgentResult;
use agent_domain::{RemoteLog, SubTaskUpdate};

/// 镜像子任务的上游
///
/// 实现方决定把上报写入集群存储（自己是维护者时）还是发给维护者。
/// 返回 `ConflictingState` 表示上游已经前进，执行器据此放弃本地结果。
#[async_trait]
pub trait UpstreamReporter: Send + Sync {
    async fn report(&self, update: &SubTaskUpdate) -> AgentResult<()>;

    async fn push_log(&self, log: &RemoteLog) -> AgentResult<()>;
}
