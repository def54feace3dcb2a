//! 多个代理在同一进程内组成集群：加入、初始化、选举、分发集群DAG、故障转移、离开

use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use agent_core::config::{ClusterStoreConfig, CoordinatorConfig, ExecutorConfig, SchedulerConfig};
use agent_core::{AgentError, AgentResult};
use agent_dispatcher::{Engine, EngineDeps};
use agent_domain::{
    AgentIdentity, AgentInstance, AgentKey, AllAgentsSyncData, CancelSubTask,
    ClusterAttachParam, DagDetail, DagType, ExecutionContext, GenericId, IdentityManager,
    JoinMasterParam, LocalStores, MaintainerView, NodeType, PeerClient, RemoteLog,
    RemoteSubTask, StoreScope, SubTask, SubTaskUpdate, TaskContext, TaskRegistry, TaskState,
    TemplateBuilder,
};
use agent_infrastructure::{DatabaseManager, SqlClusterConnector};

/// 把执行代理写入结果
#[derive(Default)]
struct EchoTask;

#[async_trait]
impl SubTask for EchoTask {
    fn kind(&self) -> &'static str {
        "echo"
    }

    async fn execute(&self, ctx: &ExecutionContext) -> AgentResult<()> {
        ctx.log(format!("echo from {}", ctx.agent()));
        ctx.set_data("agent", ctx.agent().to_string())
    }
}

/// 进程内的代理网络，RPC直接调用目标引擎
#[derive(Default)]
struct Network {
    engines: RwLock<HashMap<AgentKey, Weak<Engine>>>,
}

impl Network {
    fn register(&self, engine: &Arc<Engine>) {
        self.engines
            .write()
            .unwrap()
            .insert(engine.self_key().clone(), Arc::downgrade(engine));
    }

    /// 模拟代理宕机：之后发往它的RPC都不可达
    fn unregister(&self, key: &AgentKey) {
        self.engines.write().unwrap().remove(key);
    }

    fn engine(&self, target: &AgentKey) -> AgentResult<Arc<Engine>> {
        self.engines
            .read()
            .unwrap()
            .get(target)
            .and_then(Weak::upgrade)
            .ok_or_else(|| AgentError::Network(format!("{target} 不可达")))
    }
}

#[async_trait]
impl PeerClient for Network {
    async fn submit_sub_task(&self, target: &AgentKey, task: &RemoteSubTask) -> AgentResult<i64> {
        self.engine(target)?.accept_sub_task(task).await
    }

    async fn update_sub_task(&self, target: &AgentKey, update: &SubTaskUpdate) -> AgentResult<()> {
        self.engine(target)?.update_sub_task(update).await
    }

    async fn cancel_sub_task(&self, target: &AgentKey, cancel: &CancelSubTask) -> AgentResult<()> {
        self.engine(target)?.cancel_sub_task(cancel).await
    }

    async fn push_log(&self, target: &AgentKey, log: &RemoteLog) -> AgentResult<()> {
        self.engine(target)?.append_remote_log(log).await
    }

    async fn get_maintainer(&self, target: &AgentKey) -> AgentResult<MaintainerView> {
        Ok(self.engine(target)?.maintainer_view())
    }

    async fn push_agents(&self, target: &AgentKey, data: &AllAgentsSyncData) -> AgentResult<()> {
        self.engine(target)?.apply_agents(data).await.map(|_| ())
    }

    async fn join_master(
        &self,
        target: &AgentKey,
        param: &JoinMasterParam,
    ) -> AgentResult<AgentInstance> {
        self.engine(target)?.join_master(param.clone()).await
    }

    async fn attach_cluster(&self, target: &AgentKey, param: &ClusterAttachParam) -> AgentResult<()> {
        self.engine(target)?.attach_cluster(param.clone()).await
    }
}

async fn boot(network: &Arc<Network>, port: u16) -> Arc<Engine> {
    let manager = DatabaseManager::connect("sqlite::memory:", 1, Duration::from_secs(5))
        .await
        .unwrap();
    manager.init_schema(StoreScope::Local).await.unwrap();
    let local = LocalStores::from_store(manager.store(StoreScope::Local));

    let identity = IdentityManager::load(local.meta.clone(), AgentInstance::new("127.0.0.1", port))
        .await
        .unwrap();
    identity.transit(AgentIdentity::Single).await.unwrap();

    let registry = Arc::new(TaskRegistry::new());
    registry.register_task::<EchoTask>().unwrap();

    let engine = Arc::new(
        Engine::new(EngineDeps {
            identity: Arc::new(identity),
            local,
            registry,
            peers: network.clone(),
            connector: Arc::new(SqlClusterConnector::new(ClusterStoreConfig::default())),
            executor: ExecutorConfig {
                workers: 4,
                default_timeout_seconds: 60,
                resync_interval_ms: 50,
            },
            scheduler: SchedulerConfig {
                interval_ms: 20,
                error_interval_ms: 20,
            },
            coordinator: CoordinatorConfig {
                min_interval_ms: 50,
                max_active_time_ms: 1_000,
                sync_interval_ms: 50,
            },
        })
        .unwrap(),
    );
    network.register(&engine);
    engine.start().await.unwrap();
    engine
}

async fn wait_dag(engine: &Engine, id: GenericId) -> DagDetail {
    for _ in 0..500 {
        let detail = engine.controller().get_detail(id).await.unwrap();
        if detail.dag.is_finished() {
            return detail;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("DAG {id} 没有在预期时间内结束");
}

/// 等待所有代理对维护者达成一致
async fn wait_maintainer(engines: &[&Arc<Engine>]) -> AgentKey {
    for _ in 0..500 {
        let views: Vec<MaintainerView> = engines.iter().map(|e| e.maintainer_view()).collect();
        if let Some(maintainer) = views[0].maintainer.clone() {
            if views.iter().all(|v| v.maintainer.as_ref() == Some(&maintainer)) {
                return maintainer;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("没有选出维护者");
}

#[tokio::test]
async fn test_two_agents_form_cluster_and_run_cluster_dag() {
    let dir = TempDir::new().unwrap();
    let cluster_url = format!("sqlite://{}?mode=rwc", dir.path().join("cluster.db").display());

    let network = Arc::new(Network::default());
    let a = boot(&network, 2886).await;
    let b = boot(&network, 2887).await;

    // a 自举为主代理
    let detail = a.agents().join_self("z1".to_string()).await.unwrap();
    let detail = wait_dag(&a, detail.dag.generic_id()).await;
    assert_eq!(detail.dag.state, TaskState::Succeed);
    assert_eq!(a.identity().identity().await, AgentIdentity::Master);

    // b 加入 a
    let detail = b
        .agents()
        .join_master("127.0.0.1".to_string(), 2886, "z2".to_string())
        .await
        .unwrap();
    let detail = wait_dag(&b, detail.dag.generic_id()).await;
    assert_eq!(detail.dag.state, TaskState::Succeed);
    assert_eq!(b.identity().identity().await, AgentIdentity::Follower);
    assert_eq!(b.identity().master().await, Some(a.self_key().clone()));
    assert_eq!(a.list_agents().await.unwrap().len(), 2);

    // 初始化集群
    let detail = a.agents().init_cluster(cluster_url).await.unwrap();
    let detail = wait_dag(&a, detail.dag.generic_id()).await;
    assert_eq!(detail.dag.state, TaskState::Succeed);
    assert_eq!(a.identity().identity().await, AgentIdentity::Cluster);
    assert_eq!(b.identity().identity().await, AgentIdentity::Cluster);
    assert!(a.status().await.cluster_store_attached);
    assert!(b.status().await.cluster_store_attached);

    let maintainer = wait_maintainer(&[&a, &b]).await;
    assert!(maintainer == *a.self_key() || maintainer == *b.self_key());

    // 在两个代理上各执行一次
    let template = TemplateBuilder::new("Echo")
        .dag_type(DagType::Cluster)
        .add_fan_out_node(
            EchoTask,
            vec![a.self_key().clone(), b.self_key().clone()],
            NodeType::Parallel,
        )
        .build()
        .unwrap();
    let detail = a
        .controller()
        .create(StoreScope::Cluster, &template, &TaskContext::new(), a.self_key())
        .await
        .unwrap();
    assert_eq!(detail.generic_id, format!("c-{}", detail.dag.id));

    // 集群DAG可以从任意代理查询
    let detail = wait_dag(&b, detail.dag.generic_id()).await;
    assert_eq!(detail.dag.state, TaskState::Succeed);
    for key in [a.self_key(), b.self_key()] {
        let data: serde_json::Value = detail.dag.context.get_agent_data(key).unwrap().unwrap();
        assert_eq!(data["agent"], key.to_string());
    }
    for sub_task in &detail.nodes[0].sub_tasks {
        assert_eq!(sub_task.execute_times, 1);
        assert_eq!(sub_task.state, TaskState::Succeed);
    }

    // b 离开集群
    let detail = b.agents().leave_cluster().await.unwrap();
    let detail = wait_dag(&b, detail.dag.generic_id()).await;
    assert_eq!(detail.dag.state, TaskState::Succeed);
    assert_eq!(b.identity().identity().await, AgentIdentity::Single);
    assert!(!b.status().await.cluster_store_attached);
    assert!(b.list_agents().await.unwrap().is_empty());

    // 剩下的 a 最终成为维护者
    let maintainer = wait_maintainer(&[&a]).await;
    assert_eq!(maintainer, *a.self_key());

    a.stop().await;
    b.stop().await;
}

/// 等待存活代理对一个不同于 `old` 的维护者达成一致
async fn wait_new_maintainer(engines: &[&Arc<Engine>], old: &AgentKey) -> MaintainerView {
    for _ in 0..500 {
        let views: Vec<MaintainerView> = engines.iter().map(|e| e.maintainer_view()).collect();
        if let Some(maintainer) = views[0].maintainer.clone() {
            if maintainer != *old
                && views.iter().all(|v| v.maintainer.as_ref() == Some(&maintainer))
            {
                let holder = engines
                    .iter()
                    .find(|e| *e.self_key() == maintainer)
                    .map(|e| e.maintainer_view())
                    .unwrap();
                if holder.is_maintainer() {
                    return holder;
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("维护者没有转移");
}

#[tokio::test]
async fn test_maintainer_failover_keeps_cluster_dags_running() {
    let dir = TempDir::new().unwrap();
    let cluster_url = format!("sqlite://{}?mode=rwc", dir.path().join("cluster.db").display());

    let network = Arc::new(Network::default());
    let a = boot(&network, 2886).await;
    let b = boot(&network, 2887).await;
    let c = boot(&network, 2888).await;

    let detail = a.agents().join_self("z1".to_string()).await.unwrap();
    wait_dag(&a, detail.dag.generic_id()).await;
    for (engine, zone) in [(&b, "z2"), (&c, "z3")] {
        let detail = engine
            .agents()
            .join_master("127.0.0.1".to_string(), 2886, zone.to_string())
            .await
            .unwrap();
        let detail = wait_dag(engine, detail.dag.generic_id()).await;
        assert_eq!(detail.dag.state, TaskState::Succeed);
    }
    let detail = a.agents().init_cluster(cluster_url).await.unwrap();
    let detail = wait_dag(&a, detail.dag.generic_id()).await;
    assert_eq!(detail.dag.state, TaskState::Succeed);
    for engine in [&a, &b, &c] {
        assert_eq!(engine.identity().identity().await, AgentIdentity::Cluster);
    }

    let old = wait_maintainer(&[&a, &b, &c]).await;
    let engines = [a.clone(), b.clone(), c.clone()];
    let (down, survivors): (Vec<_>, Vec<_>) =
        engines.iter().partition(|e| *e.self_key() == old);
    let down = down[0];
    let old_counter = down.maintainer_view().counter;

    // 维护者宕机：不可达且不再续约
    network.unregister(&old);
    down.stop().await;

    let view = wait_new_maintainer(&survivors, &old).await;
    assert!(view.counter >= old_counter + 1);
    let new_maintainer = view.maintainer.unwrap();
    assert_ne!(new_maintainer, old);

    // 新维护者继续推进集群DAG
    let targets: Vec<AgentKey> = survivors.iter().map(|e| e.self_key().clone()).collect();
    let template = TemplateBuilder::new("Echo")
        .dag_type(DagType::Cluster)
        .add_fan_out_node(EchoTask, targets.clone(), NodeType::Parallel)
        .build()
        .unwrap();
    let creator = survivors[0];
    let detail = creator
        .controller()
        .create(StoreScope::Cluster, &template, &TaskContext::new(), creator.self_key())
        .await
        .unwrap();
    let detail = wait_dag(survivors[1], detail.dag.generic_id()).await;
    assert_eq!(detail.dag.state, TaskState::Succeed);
    for key in &targets {
        let data: serde_json::Value = detail.dag.context.get_agent_data(key).unwrap().unwrap();
        assert_eq!(data["agent"], key.to_string());
    }

    for engine in survivors {
        engine.stop().await;
    }
}

#[tokio::test]
async fn test_follower_cannot_init_cluster() {
    let network = Arc::new(Network::default());
    let a = boot(&network, 2886).await;
    let b = boot(&network, 2887).await;

    let detail = a.agents().join_self("z1".to_string()).await.unwrap();
    wait_dag(&a, detail.dag.generic_id()).await;
    let detail = b
        .agents()
        .join_master("127.0.0.1".to_string(), 2886, "z1".to_string())
        .await
        .unwrap();
    wait_dag(&b, detail.dag.generic_id()).await;

    let err = b
        .agents()
        .init_cluster("sqlite::memory:".to_string())
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::WrongIdentity { .. }));

    // 主代理不能再加入别人
    let err = a
        .agents()
        .join_master("127.0.0.1".to_string(), 2887, "z1".to_string())
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::WrongIdentity { .. }));

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_join_unreachable_master_fails_dag() {
    let network = Arc::new(Network::default());
    let b = boot(&network, 2887).await;

    let detail = b
        .agents()
        .join_master("127.0.0.1".to_string(), 2886, "z1".to_string())
        .await
        .unwrap();
    let detail = wait_dag(&b, detail.dag.generic_id()).await;
    assert_eq!(detail.dag.state, TaskState::Failed);
    assert_eq!(b.identity().identity().await, AgentIdentity::Single);

    b.stop().await;
}
