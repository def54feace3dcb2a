//! 任务引擎的组装
//!
//! 调度器、协调器、同步器与执行器之间只通过角色总线、集群存储插槽和存储接口
//! 互相引用，在这里一次性组装，不使用全局变量。

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use agent_core::config::{CoordinatorConfig, ExecutorConfig, SchedulerConfig};
use agent_core::{AgentError, AgentResult};
use agent_domain::{
    AgentIdentity, AgentInstance, AgentKey, AllAgentsSyncData, CancelSubTask, ClusterAttachParam,
    ClusterConnector, ClusterStoreSlot, IdentityManager, JoinMasterParam, LocalStores,
    MaintainerView, PeerClient, RemoteLog, RemoteSubTask, RoleBus, SubTaskUpdate, TaskRegistry,
};
use agent_worker::ExecutorPool;

use crate::controller::DagController;
use crate::coordinator::Coordinator;
use crate::membership::{register_builtin_tasks, AgentService, AgentServices};
use crate::reporter::ClusterUpstream;
use crate::scheduler::{ClusterDispatcher, LocalDispatcher, StoreSource, TaskScheduler};
use crate::synchronizer::AgentSynchronizer;

/// 组装引擎所需的外部依赖
pub struct EngineDeps {
    pub identity: Arc<IdentityManager>,
    pub local: LocalStores,
    pub registry: Arc<TaskRegistry>,
    pub peers: Arc<dyn PeerClient>,
    pub connector: Arc<dyn ClusterConnector>,
    pub executor: ExecutorConfig,
    pub scheduler: SchedulerConfig,
    pub coordinator: CoordinatorConfig,
}

/// `GET /api/v1/status` 的返回值
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    pub agent: AgentInstance,
    pub coordinator: MaintainerView,
    pub cluster_store_attached: bool,
}

pub struct Engine {
    identity: Arc<IdentityManager>,
    local: LocalStores,
    slot: ClusterStoreSlot,
    bus: RoleBus,
    coordinator: Arc<Coordinator>,
    synchronizer: Arc<AgentSynchronizer>,
    pool: Arc<ExecutorPool>,
    local_scheduler: Arc<TaskScheduler>,
    cluster_scheduler: Arc<TaskScheduler>,
    controller: Arc<DagController>,
    agent_service: Arc<AgentService>,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(deps: EngineDeps) -> AgentResult<Self> {
        register_builtin_tasks(&deps.registry)?;

        let self_key = deps.identity.self_key().clone();
        let slot = ClusterStoreSlot::new();
        let bus = RoleBus::new();

        let coordinator = Arc::new(Coordinator::new(
            self_key.clone(),
            slot.clone(),
            deps.local.agents.clone(),
            deps.peers.clone(),
            bus.clone(),
            deps.coordinator.clone(),
        ));
        let synchronizer = Arc::new(AgentSynchronizer::new(
            self_key.clone(),
            slot.clone(),
            deps.local.clone(),
            deps.peers.clone(),
            bus.clone(),
            deps.coordinator.sync_interval(),
        ));
        let services = Arc::new(AgentServices {
            identity: deps.identity.clone(),
            local: deps.local.clone(),
            slot: slot.clone(),
            connector: deps.connector,
            peers: deps.peers.clone(),
            coordinator: coordinator.clone(),
            synchronizer: synchronizer.clone(),
        });

        let upstream = Arc::new(ClusterUpstream::new(
            slot.clone(),
            deps.peers.clone(),
            bus.clone(),
            self_key.clone(),
        ));
        let pool = Arc::new(ExecutorPool::new(
            deps.local.tasks.clone(),
            deps.registry,
            services.clone(),
            upstream,
            self_key.clone(),
            deps.executor,
        ));

        let local_scheduler = Arc::new(TaskScheduler::new(
            StoreSource::Local(deps.local.tasks.clone()),
            Arc::new(LocalDispatcher::new(pool.clone())),
            deps.scheduler.clone(),
        ));
        let cluster_scheduler = Arc::new(TaskScheduler::new(
            StoreSource::Cluster(slot.clone()),
            Arc::new(ClusterDispatcher::new(pool.clone(), deps.peers, self_key)),
            deps.scheduler,
        ));

        let controller = Arc::new(DagController::new(deps.local.tasks.clone(), slot.clone()));
        let agent_service = Arc::new(AgentService::new(services, controller.clone()));

        Ok(Self {
            identity: deps.identity,
            local: deps.local,
            slot,
            bus,
            coordinator,
            synchronizer,
            pool,
            local_scheduler,
            cluster_scheduler,
            controller,
            agent_service,
            shutdown: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        })
    }

    /// 启动执行器、两个调度器、协调器与同步器
    ///
    /// 调用前应完成集群存储的恢复或接管，非集群代理的协调器保持暂停。
    pub async fn start(&self) -> AgentResult<()> {
        if !self.identity.identity().await.is_cluster() {
            self.coordinator.suspend().await?;
        }
        self.pool.start().await?;

        let mut handles = self.handles.lock().await;
        handles.push(tokio::spawn(
            self.local_scheduler
                .clone()
                .run(None, self.shutdown.child_token()),
        ));
        handles.push(tokio::spawn(self.cluster_scheduler.clone().run(
            Some(self.bus.subscribe()),
            self.shutdown.child_token(),
        )));
        handles.push(tokio::spawn(
            self.coordinator.clone().run(self.shutdown.child_token()),
        ));
        handles.push(tokio::spawn(
            self.synchronizer
                .clone()
                .run(self.bus.subscribe(), self.shutdown.child_token()),
        ));
        info!(agent = %self.self_key(), "任务引擎已启动");
        Ok(())
    }

    /// 停止全部后台循环，正在执行的子任务以"executor stopped"失败结束
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let handles = std::mem::take(&mut *self.handles.lock().await);
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("后台任务异常退出: {}", e);
            }
        }
        self.pool.stop().await;
        info!(agent = %self.self_key(), "任务引擎已停止");
    }

    pub fn self_key(&self) -> &AgentKey {
        self.identity.self_key()
    }

    pub fn identity(&self) -> &Arc<IdentityManager> {
        &self.identity
    }

    pub fn controller(&self) -> &Arc<DagController> {
        &self.controller
    }

    pub fn agents(&self) -> &Arc<AgentService> {
        &self.agent_service
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn pool(&self) -> &Arc<ExecutorPool> {
        &self.pool
    }

    pub fn slot(&self) -> &ClusterStoreSlot {
        &self.slot
    }

    pub async fn status(&self) -> AgentStatus {
        AgentStatus {
            agent: self.identity.current().await,
            coordinator: self.coordinator.view(),
            cluster_store_attached: self.slot.is_attached(),
        }
    }

    /// 本地成员表（集群代理上为同步得到的镜像）
    pub async fn list_agents(&self) -> AgentResult<Vec<AgentInstance>> {
        self.local.agents.list_agents().await
    }

    // ---- 对端请求 ----

    /// 接收集群子任务，返回本地镜像id
    pub async fn accept_sub_task(&self, remote: &RemoteSubTask) -> AgentResult<i64> {
        self.identity.require(&[AgentIdentity::Cluster]).await?;
        if remote.execute_agent != *self.self_key() {
            return Err(AgentError::invalid_param(format!(
                "子任务 {} 的执行代理是 {}",
                remote.remote_task_id, remote.execute_agent
            )));
        }
        self.pool.accept_remote(remote).await
    }

    /// 执行代理上报的状态，写入集群存储
    pub async fn update_sub_task(&self, update: &SubTaskUpdate) -> AgentResult<()> {
        let stores = self
            .slot
            .get()
            .ok_or_else(|| AgentError::StoreUnavailable("未接入集群存储".to_string()))?;
        stores.tasks.apply_sub_task_update(update).await
    }

    pub async fn cancel_sub_task(&self, cancel: &CancelSubTask) -> AgentResult<()> {
        self.pool
            .cancel_remote(cancel.remote_task_id, cancel.execute_times)
            .await
    }

    pub async fn append_remote_log(&self, log: &RemoteLog) -> AgentResult<()> {
        let stores = self
            .slot
            .get()
            .ok_or_else(|| AgentError::StoreUnavailable("未接入集群存储".to_string()))?;
        stores
            .tasks
            .append_log(log.remote_task_id, log.execute_times, &log.content)
            .await
    }

    pub fn maintainer_view(&self) -> MaintainerView {
        self.coordinator.view()
    }

    pub async fn apply_agents(&self, data: &AllAgentsSyncData) -> AgentResult<bool> {
        self.identity.require(&[AgentIdentity::Cluster]).await?;
        self.synchronizer.apply(data).await
    }

    pub async fn join_master(&self, param: JoinMasterParam) -> AgentResult<AgentInstance> {
        self.agent_service.handle_join_master(param).await
    }

    pub async fn attach_cluster(&self, param: ClusterAttachParam) -> AgentResult<()> {
        self.agent_service.handle_attach_cluster(param).await
    }
}
