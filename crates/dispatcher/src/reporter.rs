use std::sync::Arc;

use async_trait::async_trait;

use agent_core::{AgentError, AgentResult};
use agent_domain::{
    AgentKey, ClusterStoreSlot, ClusterStores, PeerClient, RemoteLog, RoleBus, SubTaskUpdate,
};
use agent_worker::UpstreamReporter;

/// 镜像子任务的上游：维护者直接写集群存储，其他代理发给维护者
///
/// 不知道维护者但持有集群存储时直接写入，集群子任务行上的条件更新是唯一的仲裁者。
pub struct ClusterUpstream {
    slot: ClusterStoreSlot,
    peers: Arc<dyn PeerClient>,
    bus: RoleBus,
    self_key: AgentKey,
}

enum Route {
    Store(ClusterStores),
    Peer(AgentKey),
}

impl ClusterUpstream {
    pub fn new(
        slot: ClusterStoreSlot,
        peers: Arc<dyn PeerClient>,
        bus: RoleBus,
        self_key: AgentKey,
    ) -> Self {
        Self {
            slot,
            peers,
            bus,
            self_key,
        }
    }

    fn route(&self) -> AgentResult<Route> {
        let view = self.bus.current();
        match view.maintainer {
            Some(maintainer) if maintainer != self.self_key => Ok(Route::Peer(maintainer)),
            _ => self
                .slot
                .get()
                .map(Route::Store)
                .ok_or_else(|| AgentError::StoreUnavailable("维护者未知且未接入集群存储".to_string())),
        }
    }
}

#[async_trait]
impl UpstreamReporter for ClusterUpstream {
    async fn report(&self, update: &SubTaskUpdate) -> AgentResult<()> {
        match self.route()? {
            Route::Store(stores) => stores.tasks.apply_sub_task_update(update).await,
            Route::Peer(maintainer) => self.peers.update_sub_task(&maintainer, update).await,
        }
    }

    async fn push_log(&self, log: &RemoteLog) -> AgentResult<()> {
        match self.route()? {
            Route::Store(stores) => {
                stores
                    .tasks
                    .append_log(log.remote_task_id, log.execute_times, &log.content)
                    .await
            }
            Route::Peer(maintainer) => self.peers.push_log(&maintainer, log).await,
        }
    }
}
