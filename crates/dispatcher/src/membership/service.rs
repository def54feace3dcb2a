use std::sync::Arc;

use tracing::{info, warn};

use agent_core::{AgentError, AgentResult};
use agent_domain::{
    AgentIdentity, AgentInstance, AgentKey, ClusterAttachParam, DagDetail, DagTemplate,
    JoinMasterParam, StoreScope, TaskContext, TemplateBuilder,
};

use super::tasks::{
    AttachFollowersTask, BecomeClusterTask, ConnectClusterStoreTask, JoinMasterTask,
    JoinSelfTask, LeaveClusterTask, RegisterClusterAgentsTask, SuspendCoordinatorTask,
};
use super::{AgentServices, CLUSTER_STORE_URL_KEY};
use crate::controller::DagController;

/// 成员管理入口：对外的操作创建本地DAG，对端的请求直接处理
pub struct AgentService {
    services: Arc<AgentServices>,
    controller: Arc<DagController>,
}

impl AgentService {
    pub fn new(services: Arc<AgentServices>, controller: Arc<DagController>) -> Self {
        Self {
            services,
            controller,
        }
    }

    fn self_key(&self) -> &AgentKey {
        self.services.identity.self_key()
    }

    pub async fn current(&self) -> AgentInstance {
        self.services.identity.current().await
    }

    async fn submit(&self, template: DagTemplate, context: TaskContext) -> AgentResult<DagDetail> {
        self.controller
            .create(StoreScope::Local, &template, &context, self.self_key())
            .await
    }

    /// 单代理自举：SINGLE -> MASTER
    pub async fn join_self(&self, zone: String) -> AgentResult<DagDetail> {
        if zone.is_empty() {
            return Err(AgentError::invalid_param("zone不能为空"));
        }
        self.services
            .identity
            .require(&[AgentIdentity::Single])
            .await?;

        let template = TemplateBuilder::new("Join self")
            .add_node(JoinSelfTask)
            .build()?;
        let context = TaskContext::new().with_param("zone", zone)?;
        self.submit(template, context).await
    }

    /// 加入主代理：SINGLE -> FOLLOWER
    pub async fn join_master(
        &self,
        master_ip: String,
        master_port: u16,
        zone: String,
    ) -> AgentResult<DagDetail> {
        if zone.is_empty() || master_ip.is_empty() {
            return Err(AgentError::invalid_param("主代理地址和zone不能为空"));
        }
        if AgentKey::new(master_ip.clone(), master_port) == *self.self_key() {
            return Err(AgentError::invalid_param("不能加入自己"));
        }
        self.services
            .identity
            .require(&[AgentIdentity::Single])
            .await?;

        let template = TemplateBuilder::new("Join to master")
            .add_node(JoinMasterTask)
            .build()?;
        let context = TaskContext::new()
            .with_param("master_ip", master_ip)?
            .with_param("master_port", master_port)?
            .with_param("zone", zone)?;
        self.submit(template, context).await
    }

    /// 初始化集群：接入集群存储、注册成员、通知跟随者，最后 MASTER -> CLUSTER
    ///
    /// 失败时自动回滚已经完成的步骤。
    pub async fn init_cluster(&self, database_url: String) -> AgentResult<DagDetail> {
        if database_url.is_empty() {
            return Err(AgentError::invalid_param("database_url不能为空"));
        }
        self.services
            .identity
            .require(&[AgentIdentity::Master])
            .await?;

        let template = TemplateBuilder::new("Init cluster")
            .maintenance(true)
            .add_node(ConnectClusterStoreTask)
            .add_node(RegisterClusterAgentsTask)
            .add_node(AttachFollowersTask)
            .add_node(BecomeClusterTask)
            .build()?;
        let context = TaskContext::new().with_param("database_url", database_url)?;
        self.submit(template, context).await
    }

    /// 离开集群：CLUSTER -> SINGLE
    pub async fn leave_cluster(&self) -> AgentResult<DagDetail> {
        self.services
            .identity
            .require(&[AgentIdentity::Cluster])
            .await?;

        let template = TemplateBuilder::new("Leave cluster")
            .add_node(SuspendCoordinatorTask)
            .add_node(LeaveClusterTask)
            .build()?;
        self.submit(template, TaskContext::new()).await
    }

    /// 主代理处理跟随者的加入请求，返回自己的信息
    pub async fn handle_join_master(&self, param: JoinMasterParam) -> AgentResult<AgentInstance> {
        self.services
            .identity
            .require(&[AgentIdentity::Master])
            .await?;
        let master = self.services.identity.current().await;
        if param.agent.key() == master.key() {
            return Err(AgentError::invalid_param("不能加入自己"));
        }

        let mut follower = param.agent;
        follower.identity = AgentIdentity::Follower;
        follower.master = Some(master.key());
        self.services.local.agents.upsert_agent(&follower).await?;
        info!(follower = %follower.key(), zone = %follower.zone, "跟随者已加入");
        Ok(master)
    }

    /// 跟随者按主代理的要求接入集群存储：FOLLOWER -> CLUSTER
    pub async fn handle_attach_cluster(&self, param: ClusterAttachParam) -> AgentResult<()> {
        let services = &self.services;
        let identity = services.identity.identity().await;
        if identity == AgentIdentity::Cluster && services.slot.is_attached() {
            // 主代理重试初始化时会再次通知
            return Ok(());
        }
        services
            .identity
            .require(&[AgentIdentity::Follower])
            .await?;

        let stores = services.connector.connect(&param.database_url).await?;
        services.slot.attach(stores);
        services
            .local
            .meta
            .set_kv(CLUSTER_STORE_URL_KEY, &param.database_url)
            .await?;
        services.identity.transit(AgentIdentity::Cluster).await?;
        services.coordinator.resume();
        info!("已按主代理要求加入集群");
        Ok(())
    }

    /// 启动时恢复集群存储连接，返回是否为集群代理
    pub async fn restore_cluster(&self) -> AgentResult<bool> {
        let services = &self.services;
        if !services.identity.identity().await.is_cluster() {
            return Ok(false);
        }
        let url = services
            .local
            .meta
            .get_kv(CLUSTER_STORE_URL_KEY)
            .await?
            .ok_or_else(|| AgentError::Configuration("集群代理缺少集群存储地址".to_string()))?;
        let stores = services.connector.connect(&url).await?;
        services.slot.attach(stores);
        services.coordinator.resume();
        Ok(true)
    }

    /// 接管启动：集群成员表中存在自己时 UNIDENTIFIED -> TAKE-OVER -> CLUSTER
    pub async fn take_over(&self, database_url: &str) -> AgentResult<()> {
        let services = &self.services;
        services
            .identity
            .require(&[AgentIdentity::Unidentified])
            .await?;

        let stores = services.connector.connect(database_url).await?;
        let me = stores
            .agents
            .get_agent(self.self_key())
            .await?
            .ok_or_else(|| AgentError::not_found("集群成员", self.self_key()))?;

        services
            .identity
            .transit_with(AgentIdentity::TakeOver, |agent| {
                agent.zone = me.zone.clone();
            })
            .await?;
        services.slot.attach(stores.clone());
        services
            .local
            .meta
            .set_kv(CLUSTER_STORE_URL_KEY, database_url)
            .await?;
        for agent in stores.agents.list_agents().await? {
            if let Err(e) = services.local.agents.upsert_agent(&agent).await {
                warn!(agent = %agent.key(), "写入本地成员表失败: {}", e);
            }
        }
        services.identity.transit(AgentIdentity::Cluster).await?;
        services.coordinator.resume();
        info!(agent = %self.self_key(), "已接管集群代理身份");
        Ok(())
    }
}
