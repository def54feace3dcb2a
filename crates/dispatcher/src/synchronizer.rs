//! 成员同步
//!
//! 只在维护者上运行：周期性读取集群成员表，与内存快照比较，变化时推进
//! `last_sync_time` 并把全量快照推送给每个尚未收到该版本的代理（包括自己）。
//! 接收方按 `last_sync_time` 丢弃不更新的快照，因此乱序和重复推送都是安全的。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use agent_core::{AgentError, AgentResult};
use agent_domain::{
    AgentInstance, AgentKey, AllAgentsSyncData, ClusterStoreSlot, LocalStores, MaintainerView,
    PeerClient, RoleBus,
};
use agent_infrastructure::metrics;

/// 本地键值表中记录已应用快照版本的键
pub const AGENTS_SYNC_TIME_KEY: &str = "agents_last_sync_time";

#[derive(Default)]
struct SyncState {
    snapshot: Option<BTreeMap<AgentKey, AgentInstance>>,
    last_sync_time: i64,
    /// 每个代理已确认的快照版本
    synced: HashMap<AgentKey, i64>,
}

pub struct AgentSynchronizer {
    self_key: AgentKey,
    slot: ClusterStoreSlot,
    local: LocalStores,
    peers: Arc<dyn PeerClient>,
    bus: RoleBus,
    interval: Duration,
    state: Mutex<SyncState>,
    apply_lock: Mutex<()>,
}

impl AgentSynchronizer {
    pub fn new(
        self_key: AgentKey,
        slot: ClusterStoreSlot,
        local: LocalStores,
        peers: Arc<dyn PeerClient>,
        bus: RoleBus,
        interval: Duration,
    ) -> Self {
        Self {
            self_key,
            slot,
            local,
            peers,
            bus,
            interval,
            state: Mutex::new(SyncState::default()),
            apply_lock: Mutex::new(()),
        }
    }

    /// 执行一次同步，返回本轮推送成功的代理数
    pub async fn tick(&self) -> AgentResult<usize> {
        let view = self.bus.current();
        if !view.is_maintainer() {
            return Ok(0);
        }
        let stores = self
            .slot
            .get()
            .ok_or_else(|| AgentError::StoreUnavailable("未接入集群存储".to_string()))?;
        let current: BTreeMap<AgentKey, AgentInstance> = stores
            .agents
            .list_agents()
            .await?
            .into_iter()
            .map(|agent| (agent.key(), agent))
            .collect();

        let mut state = self.state.lock().await;
        if state.snapshot.as_ref() != Some(&current) {
            state.last_sync_time = view.active_time.max(state.last_sync_time + 1);
            state.synced.retain(|key, _| current.contains_key(key));
            debug!(
                agents = current.len(),
                last_sync_time = state.last_sync_time,
                "成员快照发生变化"
            );
            state.snapshot = Some(current);
        }

        let last_sync_time = state.last_sync_time;
        let data = AllAgentsSyncData {
            maintainer: self.self_key.clone(),
            agents: state
                .snapshot
                .as_ref()
                .map(|snapshot| snapshot.values().cloned().collect())
                .unwrap_or_default(),
            last_sync_time,
        };

        let mut targets: Vec<AgentKey> = data.agents.iter().map(AgentInstance::key).collect();
        if !targets.contains(&self.self_key) {
            targets.push(self.self_key.clone());
        }
        targets.retain(|key| state.synced.get(key).copied().unwrap_or(0) < last_sync_time);
        if targets.is_empty() {
            return Ok(0);
        }

        let results = join_all(targets.iter().map(|target| {
            let data = &data;
            async move {
                if *target == self.self_key {
                    self.apply(data).await.map(|_| ())
                } else {
                    self.peers.push_agents(target, data).await
                }
            }
        }))
        .await;

        let mut pushed = 0;
        for (target, result) in targets.into_iter().zip(results) {
            match result {
                Ok(()) => {
                    metrics::record_agents_sync(true);
                    state.synced.insert(target, last_sync_time);
                    pushed += 1;
                }
                Err(e) => {
                    metrics::record_agents_sync(false);
                    warn!(agent = %target, "推送成员快照失败，下个周期重试: {}", e);
                }
            }
        }
        Ok(pushed)
    }

    /// 应用维护者下发的快照，返回是否实际应用
    pub async fn apply(&self, data: &AllAgentsSyncData) -> AgentResult<bool> {
        let _guard = self.apply_lock.lock().await;
        let applied = self.applied_sync_time().await?;
        if data.last_sync_time <= applied {
            debug!(
                incoming = data.last_sync_time,
                applied, "忽略不更新的成员快照"
            );
            return Ok(false);
        }

        let existing: HashMap<AgentKey, AgentInstance> = self
            .local
            .agents
            .list_agents()
            .await?
            .into_iter()
            .map(|agent| (agent.key(), agent))
            .collect();

        let mut changed = 0;
        for agent in &data.agents {
            if existing.get(&agent.key()) != Some(agent) {
                self.local.agents.upsert_agent(agent).await?;
                changed += 1;
            }
        }
        for key in existing.keys() {
            if !data.agents.iter().any(|agent| agent.key() == *key) {
                self.local.agents.delete_agent(key).await?;
                changed += 1;
            }
        }

        self.local
            .meta
            .set_kv(AGENTS_SYNC_TIME_KEY, &data.last_sync_time.to_string())
            .await?;
        if changed > 0 {
            info!(
                maintainer = %data.maintainer,
                agents = data.agents.len(),
                changed,
                "已应用成员快照"
            );
        }
        Ok(true)
    }

    async fn applied_sync_time(&self) -> AgentResult<i64> {
        Ok(self
            .local
            .meta
            .get_kv(AGENTS_SYNC_TIME_KEY)
            .await?
            .and_then(|value| value.parse().ok())
            .unwrap_or(0))
    }

    /// 离开集群时清除已应用的版本，重新加入后能接收新维护者的快照
    pub async fn reset_applied(&self) -> AgentResult<()> {
        let _guard = self.apply_lock.lock().await;
        self.local.meta.delete_kv(AGENTS_SYNC_TIME_KEY).await
    }

    async fn forget(&self) {
        *self.state.lock().await = SyncState::default();
    }

    /// 同步循环，只在视图为维护者期间推送
    pub async fn run(
        self: Arc<Self>,
        mut gate: watch::Receiver<MaintainerView>,
        shutdown: CancellationToken,
    ) {
        info!("成员同步器启动");
        loop {
            let is_maintainer = gate.borrow_and_update().is_maintainer();
            if !is_maintainer {
                // 重新成为维护者时需要对所有代理完整推送一次
                self.forget().await;
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = gate.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                }
            }

            if let Err(e) = self.tick().await {
                debug!("成员同步周期出错: {}", e);
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        info!("成员同步器已停止");
    }
}
