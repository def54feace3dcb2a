use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use agent_core::AgentResult;
use agent_domain::{AgentKey, CancelSubTask, PeerClient, StoreScope, SubTaskInstance};
use agent_infrastructure::metrics;
use agent_worker::ExecutorPool;

/// 子任务的投递目标
///
/// 投递与取消都必须可重复调用：调度器每个周期都会对仍处于READY的子任务
/// 重新投递，对仍在运行的已取消子任务重新发送取消。
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    async fn dispatch(&self, task: &SubTaskInstance) -> AgentResult<()>;
    async fn cancel(&self, task: &SubTaskInstance) -> AgentResult<()>;
}

/// 本地调度器：直接交给本进程的执行器
pub struct LocalDispatcher {
    pool: Arc<ExecutorPool>,
}

impl LocalDispatcher {
    pub fn new(pool: Arc<ExecutorPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskDispatcher for LocalDispatcher {
    async fn dispatch(&self, task: &SubTaskInstance) -> AgentResult<()> {
        if self.pool.add_task(task.id) {
            metrics::record_dispatch(StoreScope::Local, false);
        }
        Ok(())
    }

    async fn cancel(&self, task: &SubTaskInstance) -> AgentResult<()> {
        self.pool.cancel(task.id);
        Ok(())
    }
}

/// 集群调度器：按子任务的执行代理投递，自己执行的走与RPC接收相同的路径
pub struct ClusterDispatcher {
    pool: Arc<ExecutorPool>,
    peers: Arc<dyn PeerClient>,
    self_key: AgentKey,
}

impl ClusterDispatcher {
    pub fn new(pool: Arc<ExecutorPool>, peers: Arc<dyn PeerClient>, self_key: AgentKey) -> Self {
        Self {
            pool,
            peers,
            self_key,
        }
    }
}

#[async_trait]
impl TaskDispatcher for ClusterDispatcher {
    async fn dispatch(&self, task: &SubTaskInstance) -> AgentResult<()> {
        let remote = task.to_remote();
        if task.execute_agent == self.self_key {
            self.pool.accept_remote(&remote).await?;
            metrics::record_dispatch(StoreScope::Cluster, false);
            return Ok(());
        }
        let local_id = self
            .peers
            .submit_sub_task(&task.execute_agent, &remote)
            .await?;
        metrics::record_dispatch(StoreScope::Cluster, true);
        debug!(
            sub_task_id = task.id,
            agent = %task.execute_agent,
            "子任务已投递到对端，对端本地id {}",
            local_id
        );
        Ok(())
    }

    async fn cancel(&self, task: &SubTaskInstance) -> AgentResult<()> {
        if task.execute_agent == self.self_key {
            return self
                .pool
                .cancel_remote(task.id, task.execute_times)
                .await;
        }
        let cancel = CancelSubTask {
            remote_task_id: task.id,
            execute_times: task.execute_times,
        };
        self.peers.cancel_sub_task(&task.execute_agent, &cancel).await
    }
}
