//! 维护者选举
//!
//! 角色机：FAULTY（不知道维护者）、WATCHER、MAINTAINER。每个CLUSTER代理都运行协调器，
//! 每个周期按当前角色做一次调和：
//! - MAINTAINER：续约，影响行数为0说明已经失去租约，转入初始化
//! - WATCHER：向已知维护者询问视图，对方不再声称是维护者或不可达时转入初始化
//! - FAULTY：读取租约记录，租约有效则跟随持有者，否则尝试带条件的接管
//!
//! 无法访问集群存储时依次询问其他代理，第一个可信的回答胜出。
//! 角色变化发布到 [`RoleBus`]，集群调度器和成员同步器据此启停。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use agent_core::config::CoordinatorConfig;
use agent_core::AgentResult;
use agent_domain::{
    AgentKey, AgentStore, ClusterStoreSlot, ClusterStores, CoordinatorRole, MaintainerRecord,
    MaintainerView, PeerClient, RoleBus,
};
use agent_infrastructure::metrics;

pub struct Coordinator {
    self_key: AgentKey,
    slot: ClusterStoreSlot,
    /// 本地的成员镜像，集群存储不可用时据此轮询其他代理
    local_agents: Arc<dyn AgentStore>,
    peers: Arc<dyn PeerClient>,
    bus: RoleBus,
    config: CoordinatorConfig,
    suspended: AtomicBool,
    tick_lock: Mutex<()>,
}

impl Coordinator {
    pub fn new(
        self_key: AgentKey,
        slot: ClusterStoreSlot,
        local_agents: Arc<dyn AgentStore>,
        peers: Arc<dyn PeerClient>,
        bus: RoleBus,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            self_key,
            slot,
            local_agents,
            peers,
            bus,
            config,
            suspended: AtomicBool::new(false),
            tick_lock: Mutex::new(()),
        }
    }

    pub fn view(&self) -> MaintainerView {
        self.bus.current()
    }

    pub fn bus(&self) -> &RoleBus {
        &self.bus
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    fn max_active_ms(&self) -> i64 {
        self.config.max_active_time().as_millis() as i64
    }

    /// 执行一次调和，返回调和后的视图
    pub async fn tick(&self) -> MaintainerView {
        let _guard = self.tick_lock.lock().await;
        let next = match self.slot.get() {
            Some(stores) if !self.is_suspended() => {
                let current = self.bus.current();
                match current.role {
                    CoordinatorRole::Maintainer => self.renew(&stores).await,
                    CoordinatorRole::Watcher => self.watch(&stores, &current).await,
                    CoordinatorRole::Faulty => self.init(&stores).await,
                }
            }
            _ => MaintainerView::faulty(),
        };
        self.publish(next.clone());
        next
    }

    async fn renew(&self, stores: &ClusterStores) -> MaintainerView {
        match stores.maintainer.renew_lease(&self.self_key).await {
            Ok(true) => match stores.maintainer.get_maintainer().await {
                Ok(record) if record.holder().as_ref() == Some(&self.self_key) => {
                    self.view_of(CoordinatorRole::Maintainer, &record)
                }
                Ok(_) => self.init(stores).await,
                Err(e) => {
                    debug!("续约后读取租约记录失败: {}", e);
                    self.bus.current()
                }
            },
            Ok(false) => {
                warn!(agent = %self.self_key, "维护者租约已被其他代理持有");
                self.init(stores).await
            }
            Err(e) => {
                warn!("续约失败，询问其他代理: {}", e);
                self.poll_peers().await
            }
        }
    }

    async fn watch(&self, stores: &ClusterStores, current: &MaintainerView) -> MaintainerView {
        let Some(holder) = current.maintainer.clone() else {
            return self.init(stores).await;
        };
        match self.peers.get_maintainer(&holder).await {
            Ok(reply) if reply.is_maintainer() && reply.maintainer.as_ref() == Some(&holder) => {
                MaintainerView {
                    role: CoordinatorRole::Watcher,
                    maintainer: Some(holder),
                    counter: reply.counter,
                    active_time: reply.active_time,
                }
            }
            Ok(_) => {
                debug!(maintainer = %holder, "维护者不再声称持有租约");
                self.init(stores).await
            }
            Err(e) => {
                debug!(maintainer = %holder, "询问维护者失败: {}", e);
                self.init(stores).await
            }
        }
    }

    async fn init(&self, stores: &ClusterStores) -> MaintainerView {
        let record = match stores.maintainer.get_maintainer().await {
            Ok(record) => record,
            Err(e) => {
                warn!("读取维护者记录失败，询问其他代理: {}", e);
                return self.poll_peers().await;
            }
        };

        let max_active_ms = self.max_active_ms();
        if record.is_active(max_active_ms) {
            let role = if record.holder().as_ref() == Some(&self.self_key) {
                CoordinatorRole::Maintainer
            } else {
                CoordinatorRole::Watcher
            };
            return self.view_of(role, &record);
        }

        match stores.maintainer.take_over(&self.self_key, max_active_ms).await {
            Ok(true) => {
                info!(
                    agent = %self.self_key,
                    previous = %record.ip,
                    "接管维护者租约"
                );
                match stores.maintainer.get_maintainer().await {
                    Ok(taken) => self.view_of(CoordinatorRole::Maintainer, &taken),
                    Err(_) => MaintainerView {
                        role: CoordinatorRole::Maintainer,
                        maintainer: Some(self.self_key.clone()),
                        counter: record.counter + 1,
                        active_time: record.now,
                    },
                }
            }
            Ok(false) => {
                debug!("其他代理先完成了接管");
                MaintainerView::faulty()
            }
            Err(e) => {
                warn!("接管维护者失败，询问其他代理: {}", e);
                self.poll_peers().await
            }
        }
    }

    /// 依次询问其他代理，第一个可信的回答胜出
    async fn poll_peers(&self) -> MaintainerView {
        let agents = match self.local_agents.list_agents().await {
            Ok(agents) => agents,
            Err(e) => {
                warn!("读取本地成员失败: {}", e);
                return MaintainerView::faulty();
            }
        };
        for agent in agents {
            let key = agent.key();
            if key == self.self_key {
                continue;
            }
            match self.peers.get_maintainer(&key).await {
                Ok(reply)
                    if reply.is_credible()
                        && reply.maintainer.as_ref() != Some(&self.self_key) =>
                {
                    debug!(peer = %key, "从其他代理得知维护者");
                    return MaintainerView {
                        role: CoordinatorRole::Watcher,
                        ..reply
                    };
                }
                Ok(_) => {}
                Err(e) => debug!(peer = %key, "询问维护者失败: {}", e),
            }
        }
        MaintainerView::faulty()
    }

    fn view_of(&self, role: CoordinatorRole, record: &MaintainerRecord) -> MaintainerView {
        MaintainerView {
            role,
            maintainer: record.holder(),
            counter: record.counter,
            active_time: record.active_time,
        }
    }

    fn publish(&self, view: MaintainerView) {
        let previous = self.bus.current().role;
        let role = view.role;
        let maintainer = view.maintainer.clone();
        if self.bus.publish(view) && previous != role {
            metrics::record_role_change(role);
            match maintainer {
                Some(maintainer) => info!(
                    agent = %self.self_key,
                    "协调器角色变更: {:?} -> {:?}, 维护者 {}",
                    previous, role, maintainer
                ),
                None => info!(agent = %self.self_key, "协调器角色变更: {:?} -> {:?}", previous, role),
            }
        }
    }

    /// 暂停选举；是维护者时先释放租约，让其他代理立即接管
    pub async fn suspend(&self) -> AgentResult<()> {
        let _guard = self.tick_lock.lock().await;
        self.suspended.store(true, Ordering::SeqCst);
        let released = self.release().await;
        self.publish(MaintainerView::faulty());
        info!(agent = %self.self_key, "协调器已暂停");
        released
    }

    pub fn resume(&self) {
        if self.suspended.swap(false, Ordering::SeqCst) {
            info!(agent = %self.self_key, "协调器已恢复");
        }
    }

    async fn release(&self) -> AgentResult<()> {
        if !self.bus.current().is_maintainer() {
            return Ok(());
        }
        if let Some(stores) = self.slot.get() {
            if stores.maintainer.release_lease(&self.self_key).await? {
                info!(agent = %self.self_key, "已释放维护者租约");
            }
        }
        Ok(())
    }

    /// 下一次调和前的等待时间，FAULTY时加入随机抖动以错开接管
    fn next_interval(&self, role: CoordinatorRole) -> Duration {
        let min = self.config.min_interval();
        match role {
            CoordinatorRole::Maintainer => min,
            CoordinatorRole::Watcher => min * 2,
            CoordinatorRole::Faulty => {
                let jitter = rand::rng().random_range(0..=min.as_millis() as u64);
                min + Duration::from_millis(jitter)
            }
        }
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(agent = %self.self_key, "协调器启动");
        loop {
            let view = self.tick().await;
            let delay = self.next_interval(view.role);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let _guard = self.tick_lock.lock().await;
        if let Err(e) = self.release().await {
            warn!("停止时释放维护者租约失败: {}", e);
        }
        self.publish(MaintainerView::faulty());
        info!(agent = %self.self_key, "协调器已停止");
    }
}

#[cfg(test)]
mod tests {
    use agent_domain::{AgentInstance, StoreScope};
    use agent_infrastructure::SqlStore;

    use super::*;
    use crate::testing::{sqlite_store, MockPeers};

    fn config(max_active_ms: u64) -> CoordinatorConfig {
        CoordinatorConfig {
            min_interval_ms: 20,
            max_active_time_ms: max_active_ms,
            sync_interval_ms: 20,
        }
    }

    struct Fixture {
        cluster: Arc<SqlStore>,
        peers: Arc<MockPeers>,
    }

    impl Fixture {
        async fn new() -> Self {
            Self {
                cluster: sqlite_store(StoreScope::Cluster).await,
                peers: Arc::new(MockPeers::default()),
            }
        }

        async fn coordinator(&self, port: u16, max_active_ms: u64) -> Coordinator {
            let key = AgentKey::new("127.0.0.1", port);
            let slot = ClusterStoreSlot::new();
            slot.attach(ClusterStores::from_store(self.cluster.clone()));
            let bus = RoleBus::new();
            self.peers.register_bus(key.clone(), bus.clone());
            let local = sqlite_store(StoreScope::Local).await;
            Coordinator::new(key, slot, local, self.peers.clone(), bus, config(max_active_ms))
        }
    }

    #[tokio::test]
    async fn test_first_agent_takes_over_and_renews() {
        let fixture = Fixture::new().await;
        let coordinator = fixture.coordinator(2881, 60_000).await;

        let view = coordinator.tick().await;
        assert!(view.is_maintainer());
        assert_eq!(view.maintainer, Some(AgentKey::new("127.0.0.1", 2881)));
        let taken = view.counter;

        let renewed = coordinator.tick().await;
        assert!(renewed.is_maintainer());
        assert!(renewed.counter > taken);
        let again = coordinator.tick().await;
        assert!(again.counter > renewed.counter);
    }

    #[tokio::test]
    async fn test_second_agent_watches_live_maintainer() {
        let fixture = Fixture::new().await;
        let first = fixture.coordinator(2881, 60_000).await;
        let second = fixture.coordinator(2882, 60_000).await;

        assert!(first.tick().await.is_maintainer());
        let view = second.tick().await;
        assert_eq!(view.role, CoordinatorRole::Watcher);
        assert_eq!(view.maintainer, Some(AgentKey::new("127.0.0.1", 2881)));

        // 维护者仍然在续约，继续跟随
        first.tick().await;
        let view = second.tick().await;
        assert_eq!(view.role, CoordinatorRole::Watcher);
    }

    #[tokio::test]
    async fn test_watcher_takes_over_expired_lease() {
        let fixture = Fixture::new().await;
        let first = fixture.coordinator(2881, 300).await;
        let second = fixture.coordinator(2882, 300).await;

        let taken = first.tick().await;
        assert!(taken.is_maintainer());
        assert_eq!(second.tick().await.role, CoordinatorRole::Watcher);

        // 维护者宕机：不再续约，也不再响应
        let first_key = AgentKey::new("127.0.0.1", 2881);
        fixture.peers.unplug(&first_key);
        tokio::time::sleep(Duration::from_millis(400)).await;

        let view = second.tick().await;
        assert!(view.is_maintainer());
        assert_eq!(view.maintainer, Some(AgentKey::new("127.0.0.1", 2882)));
        assert!(view.counter > taken.counter);

        // 旧维护者恢复后续约失败，转为跟随
        fixture.peers.plug(&first_key);
        let view = first.tick().await;
        assert_eq!(view.role, CoordinatorRole::Watcher);
        assert_eq!(view.maintainer, Some(AgentKey::new("127.0.0.1", 2882)));
    }

    #[tokio::test]
    async fn test_suspend_releases_lease() {
        let fixture = Fixture::new().await;
        let first = fixture.coordinator(2881, 60_000).await;
        let second = fixture.coordinator(2882, 60_000).await;

        assert!(first.tick().await.is_maintainer());
        first.suspend().await.unwrap();
        assert_eq!(first.view().role, CoordinatorRole::Faulty);
        assert_eq!(first.tick().await.role, CoordinatorRole::Faulty);

        assert!(second.tick().await.is_maintainer());

        first.resume();
        assert_eq!(first.tick().await.role, CoordinatorRole::Watcher);
    }

    #[tokio::test]
    async fn test_detached_store_is_faulty() {
        let fixture = Fixture::new().await;
        let coordinator = fixture.coordinator(2881, 60_000).await;
        coordinator.slot.detach();
        assert_eq!(coordinator.tick().await.role, CoordinatorRole::Faulty);
    }

    #[tokio::test]
    async fn test_poll_peers_when_store_unreachable() {
        let fixture = Fixture::new().await;
        let first = fixture.coordinator(2881, 60_000).await;
        assert!(first.tick().await.is_maintainer());

        let second = fixture.coordinator(2882, 60_000).await;
        second
            .local_agents
            .upsert_agent(&AgentInstance::new("127.0.0.1", 2881))
            .await
            .unwrap();
        fixture.cluster.pool().close().await;

        let view = second.tick().await;
        assert_eq!(view.role, CoordinatorRole::Watcher);
        assert_eq!(view.maintainer, Some(AgentKey::new("127.0.0.1", 2881)));
    }

    #[test]
    fn test_faulty_interval_is_jittered() {
        let interval = CoordinatorConfig {
            min_interval_ms: 100,
            max_active_time_ms: 1_000,
            sync_interval_ms: 100,
        };
        let coordinator = Coordinator::new(
            AgentKey::new("127.0.0.1", 2881),
            ClusterStoreSlot::new(),
            Arc::new(NoAgents),
            Arc::new(MockPeers::default()),
            RoleBus::new(),
            interval,
        );
        let min = Duration::from_millis(100);
        assert_eq!(coordinator.next_interval(CoordinatorRole::Maintainer), min);
        assert_eq!(coordinator.next_interval(CoordinatorRole::Watcher), min * 2);
        let faulty = coordinator.next_interval(CoordinatorRole::Faulty);
        assert!(faulty >= min && faulty <= min * 2);
    }

    struct NoAgents;

    #[async_trait::async_trait]
    impl AgentStore for NoAgents {
        async fn list_agents(&self) -> AgentResult<Vec<AgentInstance>> {
            Ok(Vec::new())
        }
        async fn get_agent(&self, _: &AgentKey) -> AgentResult<Option<AgentInstance>> {
            Ok(None)
        }
        async fn upsert_agent(&self, _: &AgentInstance) -> AgentResult<()> {
            Ok(())
        }
        async fn delete_agent(&self, _: &AgentKey) -> AgentResult<bool> {
            Ok(false)
        }
    }
}
