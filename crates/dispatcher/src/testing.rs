//! 单元测试共用的存储与对端替身

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use agent_core::{AgentError, AgentResult};
use agent_domain::{
    AgentInstance, AgentKey, AllAgentsSyncData, CancelSubTask, ClusterAttachParam,
    JoinMasterParam, MaintainerView, PeerClient, RemoteLog, RemoteSubTask, RoleBus, StoreScope,
    SubTaskUpdate,
};
use agent_infrastructure::{DatabaseManager, SqlStore};

pub(crate) async fn sqlite_store(scope: StoreScope) -> Arc<SqlStore> {
    let manager = DatabaseManager::connect("sqlite::memory:", 1, Duration::from_secs(5))
        .await
        .unwrap();
    manager.init_schema(scope).await.unwrap();
    manager.store(scope)
}

/// 记录所有调用的对端；查询维护者时转发到登记的角色总线
#[derive(Default)]
pub(crate) struct MockPeers {
    buses: Mutex<HashMap<AgentKey, RoleBus>>,
    unreachable: Mutex<HashSet<AgentKey>>,
    master: Mutex<Option<AgentInstance>>,
    pub submitted: Mutex<Vec<(AgentKey, RemoteSubTask)>>,
    pub cancelled: Mutex<Vec<(AgentKey, CancelSubTask)>>,
    pub updates: Mutex<Vec<(AgentKey, SubTaskUpdate)>>,
    pub logs: Mutex<Vec<(AgentKey, RemoteLog)>>,
    pub pushed: Mutex<Vec<(AgentKey, AllAgentsSyncData)>>,
    pub joins: Mutex<Vec<(AgentKey, JoinMasterParam)>>,
    pub attached: Mutex<Vec<(AgentKey, ClusterAttachParam)>>,
}

impl MockPeers {
    pub fn register_bus(&self, key: AgentKey, bus: RoleBus) {
        self.buses.lock().unwrap().insert(key, bus);
    }

    pub fn unplug(&self, key: &AgentKey) {
        self.unreachable.lock().unwrap().insert(key.clone());
    }

    pub fn plug(&self, key: &AgentKey) {
        self.unreachable.lock().unwrap().remove(key);
    }

    pub fn set_master(&self, master: AgentInstance) {
        *self.master.lock().unwrap() = Some(master);
    }

    fn check(&self, target: &AgentKey) -> AgentResult<()> {
        if self.unreachable.lock().unwrap().contains(target) {
            Err(AgentError::Network(format!("{target} 不可达")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PeerClient for MockPeers {
    async fn submit_sub_task(&self, target: &AgentKey, task: &RemoteSubTask) -> AgentResult<i64> {
        self.check(target)?;
        let mut submitted = self.submitted.lock().unwrap();
        submitted.push((target.clone(), task.clone()));
        Ok(submitted.len() as i64)
    }

    async fn update_sub_task(&self, target: &AgentKey, update: &SubTaskUpdate) -> AgentResult<()> {
        self.check(target)?;
        self.updates
            .lock()
            .unwrap()
            .push((target.clone(), update.clone()));
        Ok(())
    }

    async fn cancel_sub_task(&self, target: &AgentKey, cancel: &CancelSubTask) -> AgentResult<()> {
        self.check(target)?;
        self.cancelled
            .lock()
            .unwrap()
            .push((target.clone(), cancel.clone()));
        Ok(())
    }

    async fn push_log(&self, target: &AgentKey, log: &RemoteLog) -> AgentResult<()> {
        self.check(target)?;
        self.logs.lock().unwrap().push((target.clone(), log.clone()));
        Ok(())
    }

    async fn get_maintainer(&self, target: &AgentKey) -> AgentResult<MaintainerView> {
        self.check(target)?;
        self.buses
            .lock()
            .unwrap()
            .get(target)
            .map(|bus| bus.current())
            .ok_or_else(|| AgentError::Network(format!("{target} 不可达")))
    }

    async fn push_agents(&self, target: &AgentKey, data: &AllAgentsSyncData) -> AgentResult<()> {
        self.check(target)?;
        self.pushed
            .lock()
            .unwrap()
            .push((target.clone(), data.clone()));
        Ok(())
    }

    async fn join_master(
        &self,
        target: &AgentKey,
        param: &JoinMasterParam,
    ) -> AgentResult<AgentInstance> {
        self.check(target)?;
        self.joins
            .lock()
            .unwrap()
            .push((target.clone(), param.clone()));
        self.master
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| AgentError::Network(format!("{target} 不可达")))
    }

    async fn attach_cluster(
        &self,
        target: &AgentKey,
        param: &ClusterAttachParam,
    ) -> AgentResult<()> {
        self.check(target)?;
        self.attached
            .lock()
            .unwrap()
            .push((target.clone(), param.clone()));
        Ok(())
    }
}
