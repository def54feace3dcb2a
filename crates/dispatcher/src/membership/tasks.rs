use async_trait::async_trait;
use tracing::info;

use agent_core::{AgentError, AgentResult};
use agent_domain::{
    AgentIdentity, AgentKey, ClusterAttachParam, ClusterStores, ExecutionContext, JoinMasterParam,
    SubTask,
};

use super::{AgentServices, CLUSTER_STORE_URL_KEY};

fn cluster_stores(services: &AgentServices) -> AgentResult<ClusterStores> {
    services
        .slot
        .get()
        .ok_or_else(|| AgentError::StoreUnavailable("未接入集群存储".to_string()))
}

/// SINGLE -> MASTER，并把自己写入本地成员表
#[derive(Default)]
pub struct JoinSelfTask;

#[async_trait]
impl SubTask for JoinSelfTask {
    fn kind(&self) -> &'static str {
        "join_self"
    }

    fn name(&self) -> String {
        "Join self".to_string()
    }

    async fn execute(&self, ctx: &ExecutionContext) -> AgentResult<()> {
        let services = ctx.env_as::<AgentServices>()?;
        let zone: String = ctx.get_param("zone")?;

        let agent = services
            .identity
            .transit_with(AgentIdentity::Master, |agent| agent.zone = zone.clone())
            .await?;
        services.local.agents.upsert_agent(&agent).await?;
        ctx.set_data("master", agent.key())?;
        ctx.log(format!("已成为主代理, zone {zone}"));
        Ok(())
    }
}

/// 向主代理注册自己，然后 SINGLE -> FOLLOWER
#[derive(Default)]
pub struct JoinMasterTask;

#[async_trait]
impl SubTask for JoinMasterTask {
    fn kind(&self) -> &'static str {
        "join_master"
    }

    fn name(&self) -> String {
        "Join to master".to_string()
    }

    async fn execute(&self, ctx: &ExecutionContext) -> AgentResult<()> {
        let services = ctx.env_as::<AgentServices>()?;
        let zone: String = ctx.get_param("zone")?;
        let master_key = AgentKey::new(
            ctx.get_param::<String>("master_ip")?,
            ctx.get_param::<u16>("master_port")?,
        );

        let me = services
            .identity
            .update(|agent| agent.zone = zone.clone())
            .await?;
        ctx.check_cancel()?;
        let master = services
            .peers
            .join_master(
                &master_key,
                &JoinMasterParam {
                    agent: me,
                    token: String::new(),
                },
            )
            .await?;
        ctx.log(format!("主代理 {master_key} 已接受加入请求"));

        services.local.agents.upsert_agent(&master).await?;
        let me = services
            .identity
            .transit_with(AgentIdentity::Follower, |agent| {
                agent.master = Some(master_key.clone());
            })
            .await?;
        services.local.agents.upsert_agent(&me).await?;
        Ok(())
    }
}

/// 接入集群存储并记录其地址
#[derive(Default)]
pub struct ConnectClusterStoreTask;

#[async_trait]
impl SubTask for ConnectClusterStoreTask {
    fn kind(&self) -> &'static str {
        "connect_cluster_store"
    }

    fn name(&self) -> String {
        "Connect cluster store".to_string()
    }

    async fn execute(&self, ctx: &ExecutionContext) -> AgentResult<()> {
        let services = ctx.env_as::<AgentServices>()?;
        let url: String = ctx.get_param("database_url")?;

        let stores = services.connector.connect(&url).await?;
        services.slot.attach(stores);
        services
            .local
            .meta
            .set_kv(CLUSTER_STORE_URL_KEY, &url)
            .await?;
        ctx.log("集群存储已接入");
        Ok(())
    }

    async fn rollback(&self, ctx: &ExecutionContext) -> AgentResult<()> {
        let services = ctx.env_as::<AgentServices>()?;
        if services.identity.identity().await.is_cluster() {
            return Err(AgentError::conflict("已经成为集群代理，不能断开集群存储"));
        }
        services.slot.detach();
        services.local.meta.delete_kv(CLUSTER_STORE_URL_KEY).await?;
        ctx.log("集群存储已断开");
        Ok(())
    }

    fn can_rollback(&self) -> bool {
        true
    }
}

/// 把本地成员表写入集群成员表
#[derive(Default)]
pub struct RegisterClusterAgentsTask;

#[async_trait]
impl SubTask for RegisterClusterAgentsTask {
    fn kind(&self) -> &'static str {
        "register_cluster_agents"
    }

    fn name(&self) -> String {
        "Register cluster agents".to_string()
    }

    async fn execute(&self, ctx: &ExecutionContext) -> AgentResult<()> {
        let services = ctx.env_as::<AgentServices>()?;
        let stores = cluster_stores(services)?;

        let members = services.local.agents.list_agents().await?;
        for mut agent in members {
            agent.identity = AgentIdentity::Cluster;
            agent.master = None;
            stores.agents.upsert_agent(&agent).await?;
            ctx.log(format!("注册集群成员 {}", agent.key()));
        }
        Ok(())
    }

    async fn rollback(&self, ctx: &ExecutionContext) -> AgentResult<()> {
        let services = ctx.env_as::<AgentServices>()?;
        let Some(stores) = services.slot.get() else {
            return Ok(());
        };
        for agent in services.local.agents.list_agents().await? {
            stores.agents.delete_agent(&agent.key()).await?;
        }
        Ok(())
    }

    fn can_rollback(&self) -> bool {
        true
    }
}

/// 通知每个跟随者接入集群存储
#[derive(Default)]
pub struct AttachFollowersTask;

#[async_trait]
impl SubTask for AttachFollowersTask {
    fn kind(&self) -> &'static str {
        "attach_followers"
    }

    fn name(&self) -> String {
        "Attach followers".to_string()
    }

    async fn execute(&self, ctx: &ExecutionContext) -> AgentResult<()> {
        let services = ctx.env_as::<AgentServices>()?;
        let param = ClusterAttachParam {
            database_url: ctx.get_param("database_url")?,
        };
        let self_key = services.identity.self_key();

        for agent in services.local.agents.list_agents().await? {
            let key = agent.key();
            if key == *self_key {
                continue;
            }
            ctx.check_cancel()?;
            services.peers.attach_cluster(&key, &param).await?;
            ctx.log(format!("跟随者 {key} 已接入集群存储"));
        }
        Ok(())
    }
}

/// MASTER -> CLUSTER，并开始参与维护者选举
#[derive(Default)]
pub struct BecomeClusterTask;

#[async_trait]
impl SubTask for BecomeClusterTask {
    fn kind(&self) -> &'static str {
        "become_cluster"
    }

    fn name(&self) -> String {
        "Become cluster".to_string()
    }

    async fn execute(&self, ctx: &ExecutionContext) -> AgentResult<()> {
        let services = ctx.env_as::<AgentServices>()?;
        services.identity.transit(AgentIdentity::Cluster).await?;
        services.coordinator.resume();
        info!(agent = %services.identity.self_key(), "已成为集群代理");
        Ok(())
    }
}

/// 暂停维护者选举，是维护者时释放租约
#[derive(Default)]
pub struct SuspendCoordinatorTask;

#[async_trait]
impl SubTask for SuspendCoordinatorTask {
    fn kind(&self) -> &'static str {
        "suspend_coordinator"
    }

    fn name(&self) -> String {
        "Suspend coordinator".to_string()
    }

    async fn execute(&self, ctx: &ExecutionContext) -> AgentResult<()> {
        let services = ctx.env_as::<AgentServices>()?;
        services.coordinator.suspend().await?;
        ctx.log("维护者选举已暂停");
        Ok(())
    }

    async fn rollback(&self, ctx: &ExecutionContext) -> AgentResult<()> {
        let services = ctx.env_as::<AgentServices>()?;
        if services.identity.identity().await.is_cluster() {
            services.coordinator.resume();
        }
        Ok(())
    }

    fn can_rollback(&self) -> bool {
        true
    }
}

/// 从集群成员表删除自己，断开集群存储，CLUSTER -> SINGLE
#[derive(Default)]
pub struct LeaveClusterTask;

#[async_trait]
impl SubTask for LeaveClusterTask {
    fn kind(&self) -> &'static str {
        "leave_cluster"
    }

    fn name(&self) -> String {
        "Leave cluster".to_string()
    }

    async fn execute(&self, ctx: &ExecutionContext) -> AgentResult<()> {
        let services = ctx.env_as::<AgentServices>()?;
        let self_key = services.identity.self_key();

        let stores = cluster_stores(services)?;
        stores.agents.delete_agent(self_key).await?;
        ctx.log("已从集群成员表删除");

        services.slot.detach();
        services.local.meta.delete_kv(CLUSTER_STORE_URL_KEY).await?;
        for agent in services.local.agents.list_agents().await? {
            services.local.agents.delete_agent(&agent.key()).await?;
        }
        services.synchronizer.reset_applied().await?;
        services.identity.transit(AgentIdentity::Single).await?;
        ctx.log("已离开集群");
        Ok(())
    }
}
