use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use agent_core::config::{ExecutorConfig, SchedulerConfig};
use agent_core::constants::REASON_CANCELLED;
use agent_core::{AgentError, AgentResult};
use agent_dispatcher::{DagController, LocalDispatcher, StoreSource, TaskScheduler};
use agent_domain::{
    AgentKey, DagDetail, DagInstance, ExecutionContext, NodeType, Operator, RemoteLog,
    StoreScope, SubTask, SubTaskInstance, SubTaskUpdate, TaskContext, TaskRegistry, TaskState,
    TaskStore, TemplateBuilder,
};
use agent_infrastructure::{DatabaseManager, SqlStore};
use agent_worker::{ExecutorPool, UpstreamReporter};

/// 记录执行与回滚的普通步骤
#[derive(Default)]
struct StepTask;

#[async_trait]
impl SubTask for StepTask {
    fn kind(&self) -> &'static str {
        "step"
    }

    async fn execute(&self, ctx: &ExecutionContext) -> AgentResult<()> {
        let zone: Option<String> = ctx.get_param_opt("zone")?;
        ctx.log(format!("step {}", ctx.sub_task_id()));
        ctx.set_data("zone_seen", zone)?;
        ctx.set_data("step", ctx.sub_task_id())
    }

    async fn rollback(&self, ctx: &ExecutionContext) -> AgentResult<()> {
        ctx.log("undo step");
        ctx.set_data("rolled_back", true)
    }

    fn can_rollback(&self) -> bool {
        true
    }
}

/// 第一次执行失败，重试后成功；不支持回滚
#[derive(Default)]
struct FlakyTask;

#[async_trait]
impl SubTask for FlakyTask {
    fn kind(&self) -> &'static str {
        "flaky"
    }

    async fn execute(&self, ctx: &ExecutionContext) -> AgentResult<()> {
        if ctx.execute_times() < 2 {
            return Err(AgentError::execution("端口被占用"));
        }
        ctx.set_data("recovered", true)
    }
}

/// 一直等待直到被取消
#[derive(Default)]
struct HangTask;

#[async_trait]
impl SubTask for HangTask {
    fn kind(&self) -> &'static str {
        "hang"
    }

    async fn execute(&self, ctx: &ExecutionContext) -> AgentResult<()> {
        ctx.sleep(Duration::from_secs(60)).await
    }
}

/// 记录自己是否看到了同节点前一个子任务写入的数据
#[derive(Default)]
struct PeekTask;

#[async_trait]
impl SubTask for PeekTask {
    fn kind(&self) -> &'static str {
        "peek"
    }

    async fn execute(&self, ctx: &ExecutionContext) -> AgentResult<()> {
        let seen = ctx.get_data::<i64>("step")?.is_some();
        ctx.set_data("saw_sibling", seen)
    }
}

struct NoUpstream;

#[async_trait]
impl UpstreamReporter for NoUpstream {
    async fn report(&self, _update: &SubTaskUpdate) -> AgentResult<()> {
        Ok(())
    }

    async fn push_log(&self, _log: &RemoteLog) -> AgentResult<()> {
        Ok(())
    }
}

fn self_key() -> AgentKey {
    AgentKey::new("127.0.0.1", 2886)
}

struct Harness {
    store: Arc<SqlStore>,
    pool: Arc<ExecutorPool>,
    scheduler: TaskScheduler,
    controller: DagController,
}

impl Harness {
    async fn new() -> Self {
        let manager = DatabaseManager::connect("sqlite::memory:", 1, Duration::from_secs(5))
            .await
            .unwrap();
        manager.init_schema(StoreScope::Local).await.unwrap();
        let store = manager.store(StoreScope::Local);

        let registry = Arc::new(TaskRegistry::new());
        registry.register_task::<StepTask>().unwrap();
        registry.register_task::<FlakyTask>().unwrap();
        registry.register_task::<HangTask>().unwrap();
        registry.register_task::<PeekTask>().unwrap();

        let pool = Arc::new(ExecutorPool::new(
            store.clone(),
            registry,
            Arc::new(()),
            Arc::new(NoUpstream),
            self_key(),
            ExecutorConfig {
                workers: 4,
                default_timeout_seconds: 60,
                resync_interval_ms: 50,
            },
        ));
        pool.start().await.unwrap();

        let scheduler = TaskScheduler::new(
            StoreSource::Local(store.clone()),
            Arc::new(LocalDispatcher::new(pool.clone())),
            SchedulerConfig {
                interval_ms: 20,
                error_interval_ms: 20,
            },
        );
        let controller = DagController::new(store.clone(), Default::default());
        Self {
            store,
            pool,
            scheduler,
            controller,
        }
    }

    async fn submit(&self, builder: TemplateBuilder, context: TaskContext) -> DagDetail {
        let template = builder.build().unwrap();
        self.controller
            .create(StoreScope::Local, &template, &context, &self_key())
            .await
            .unwrap()
    }

    /// 反复推进直到DAG结束
    async fn run_to_end(&self, dag_id: i64) -> DagInstance {
        for _ in 0..300 {
            self.scheduler.tick().await.unwrap();
            let dag = self.store.get_dag(dag_id).await.unwrap().unwrap();
            if dag.is_finished() {
                return dag;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("DAG {dag_id} 没有在预期时间内结束");
    }

    async fn run_until<F>(&self, dag_id: i64, mut done: F)
    where
        F: FnMut(&[SubTaskInstance]) -> bool,
    {
        for _ in 0..300 {
            self.scheduler.tick().await.unwrap();
            if done(&self.sub_tasks(dag_id).await) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("DAG {dag_id} 没有达到预期状态");
    }

    /// 执行日志异步写入，等待包含 `needle` 的一行出现
    async fn wait_log(&self, sub_task_id: i64, needle: &str) -> bool {
        for _ in 0..100 {
            let logs = self.store.get_logs(sub_task_id).await.unwrap();
            if logs.iter().any(|log| log.content.contains(needle)) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    async fn sub_tasks(&self, dag_id: i64) -> Vec<SubTaskInstance> {
        let mut tasks = Vec::new();
        for node in self.store.get_nodes(dag_id).await.unwrap() {
            tasks.extend(self.store.get_sub_tasks(node.id).await.unwrap());
        }
        tasks
    }
}

#[tokio::test]
async fn test_local_dag_runs_to_success() {
    let h = Harness::new().await;
    let detail = h
        .submit(
            TemplateBuilder::new("部署")
                .add_node(StepTask)
                .add_sequential_node("准备", vec![Box::new(StepTask), Box::new(StepTask)])
                .add_parallel_node("启动", vec![Box::new(StepTask), Box::new(StepTask)]),
            TaskContext::new().with_param("zone", "z1").unwrap(),
        )
        .await;

    let dag = h.run_to_end(detail.dag.id).await;
    assert_eq!(dag.state, TaskState::Succeed);
    assert_eq!(dag.operator, Operator::Run);
    assert!(dag.end_time > 0);

    let tasks = h.sub_tasks(dag.id).await;
    assert_eq!(tasks.len(), 5);
    for task in &tasks {
        assert_eq!(task.state, TaskState::Succeed);
        assert_eq!(task.execute_times, 1);
        // DAG参数经节点流入子任务
        assert_eq!(
            task.context.get_data::<Option<String>>("zone_seen").unwrap(),
            Some(Some("z1".to_string()))
        );
    }
    // 子任务数据经节点汇总到DAG
    assert!(dag.context.get_data::<i64>("step").unwrap().is_some());

    assert!(h.wait_log(tasks[0].id, "step").await);
}

#[tokio::test]
async fn test_sequential_order_is_respected() {
    let h = Harness::new().await;
    let detail = h
        .submit(
            TemplateBuilder::new("顺序")
                .add_sequential_node("三步", vec![Box::new(StepTask), Box::new(StepTask), Box::new(StepTask)]),
            TaskContext::new(),
        )
        .await;

    h.run_to_end(detail.dag.id).await;
    let tasks = h.sub_tasks(detail.dag.id).await;
    for pair in tasks.windows(2) {
        assert!(pair[0].end_time <= pair[1].start_time);
    }
}

#[tokio::test]
async fn test_sibling_data_merges_only_on_node_success() {
    let h = Harness::new().await;
    let detail = h
        .submit(
            TemplateBuilder::new("隔离")
                .add_sequential_node("两步", vec![Box::new(StepTask), Box::new(PeekTask)]),
            TaskContext::new(),
        )
        .await;

    let dag = h.run_to_end(detail.dag.id).await;
    assert_eq!(dag.state, TaskState::Succeed);

    let tasks = h.sub_tasks(dag.id).await;
    assert!(tasks[0].end_time <= tasks[1].start_time);
    assert_eq!(tasks[1].context.get_data::<bool>("saw_sibling").unwrap(), Some(false));

    // 节点成功后两者的数据都汇总到DAG
    assert!(dag.context.get_data::<i64>("step").unwrap().is_some());
    assert_eq!(dag.context.get_data::<bool>("saw_sibling").unwrap(), Some(false));
}

#[tokio::test]
async fn test_fan_out_node_records_agent_data() {
    let h = Harness::new().await;
    let detail = h
        .submit(
            TemplateBuilder::new("扇出").add_fan_out_node(
                StepTask,
                vec![self_key()],
                NodeType::Parallel,
            ),
            TaskContext::new(),
        )
        .await;

    let dag = h.run_to_end(detail.dag.id).await;
    assert_eq!(dag.state, TaskState::Succeed);
    let data: Option<serde_json::Value> = dag.context.get_agent_data(&self_key()).unwrap();
    assert!(data.unwrap().get("step").is_some());
}

#[tokio::test]
async fn test_failed_maintenance_dag_rolls_back_in_reverse() {
    let h = Harness::new().await;
    let detail = h
        .submit(
            TemplateBuilder::new("扩容")
                .maintenance(true)
                .add_node(StepTask)
                .add_node(StepTask)
                .add_node(FlakyTask)
                .add_node(StepTask),
            TaskContext::new(),
        )
        .await;

    let dag = h.run_to_end(detail.dag.id).await;
    assert_eq!(dag.state, TaskState::Failed);
    assert_eq!(dag.operator, Operator::Rollback);
    assert!(!dag.maintenance);

    let tasks = h.sub_tasks(dag.id).await;
    let (first, second, flaky, never) = (&tasks[0], &tasks[1], &tasks[2], &tasks[3]);
    for task in [first, second] {
        assert_eq!(task.state, TaskState::Succeed);
        assert_eq!(task.operator, Operator::Rollback);
        assert_eq!(task.execute_times, 1);
        assert_eq!(task.context.get_data::<bool>("rolled_back").unwrap(), Some(true));
    }
    // 不能回滚的失败子任务与从未执行的子任务直接跳过
    assert_eq!(flaky.state, TaskState::Pass);
    assert_eq!(never.state, TaskState::Pass);
    assert!(!never.has_run());
    // 后面的节点先回滚
    assert!(second.end_time <= first.start_time);
}

#[tokio::test]
async fn test_retry_bumps_execute_times() {
    let h = Harness::new().await;
    let detail = h
        .submit(
            TemplateBuilder::new("重启")
                .add_node(StepTask)
                .add_node(FlakyTask),
            TaskContext::new(),
        )
        .await;

    let dag = h.run_to_end(detail.dag.id).await;
    assert_eq!(dag.state, TaskState::Failed);
    assert_eq!(dag.operator, Operator::Run);
    let failed = h.sub_tasks(dag.id).await[1].clone();
    assert_eq!(failed.state, TaskState::Failed);
    assert_eq!(failed.execute_times, 1);

    h.controller
        .set_operator(dag.generic_id(), Operator::Retry)
        .await
        .unwrap();
    let dag = h.run_to_end(dag.id).await;
    assert_eq!(dag.state, TaskState::Succeed);

    let tasks = h.sub_tasks(dag.id).await;
    assert_eq!(tasks[0].execute_times, 1);
    assert_eq!(tasks[1].execute_times, 2);
    assert_eq!(tasks[1].operator, Operator::Retry);
    assert_eq!(dag.context.get_data::<bool>("recovered").unwrap(), Some(true));
}

#[tokio::test]
async fn test_explicit_rollback_after_failure() {
    let h = Harness::new().await;
    let detail = h
        .submit(
            TemplateBuilder::new("迁移")
                .add_node(StepTask)
                .add_node(FlakyTask),
            TaskContext::new(),
        )
        .await;

    let dag = h.run_to_end(detail.dag.id).await;
    assert_eq!(dag.state, TaskState::Failed);

    h.controller
        .set_operator(dag.generic_id(), Operator::Rollback)
        .await
        .unwrap();
    let dag = h.run_to_end(dag.id).await;
    assert_eq!(dag.state, TaskState::Failed);
    assert_eq!(dag.operator, Operator::Rollback);

    let tasks = h.sub_tasks(dag.id).await;
    assert!(tasks[0].is_rolled_back());
    assert_eq!(tasks[0].context.get_data::<bool>("rolled_back").unwrap(), Some(true));
    assert_eq!(tasks[1].state, TaskState::Pass);

    // 再次回滚没有需要处理的子任务，直接结束
    h.controller
        .set_operator(dag.generic_id(), Operator::Rollback)
        .await
        .unwrap();
    let dag = h.run_to_end(dag.id).await;
    assert_eq!(dag.state, TaskState::Failed);
}

#[tokio::test]
async fn test_cancel_running_dag() {
    let h = Harness::new().await;
    let detail = h
        .submit(
            TemplateBuilder::new("备份")
                .add_node(HangTask)
                .add_node(StepTask),
            TaskContext::new(),
        )
        .await;
    let dag_id = detail.dag.id;

    h.run_until(dag_id, |tasks| tasks[0].state == TaskState::Running)
        .await;
    assert!(h.pool.is_running(h.sub_tasks(dag_id).await[0].id));

    h.controller
        .set_operator(detail.dag.generic_id(), Operator::Cancel)
        .await
        .unwrap();
    let dag = h.run_to_end(dag_id).await;
    assert_eq!(dag.state, TaskState::Failed);
    assert_eq!(dag.operator, Operator::Cancel);

    let tasks = h.sub_tasks(dag_id).await;
    assert_eq!(tasks[0].state, TaskState::Failed);
    assert_eq!(tasks[1].state, TaskState::Pending);
    assert!(h.wait_log(tasks[0].id, REASON_CANCELLED).await);
}

#[tokio::test]
async fn test_tick_without_cluster_store_is_noop() {
    let h = Harness::new().await;
    let scheduler = TaskScheduler::new(
        StoreSource::Cluster(Default::default()),
        Arc::new(LocalDispatcher::new(h.pool.clone())),
        SchedulerConfig {
            interval_ms: 20,
            error_interval_ms: 20,
        },
    );
    assert_eq!(scheduler.scope(), StoreScope::Cluster);
    assert_eq!(scheduler.tick().await.unwrap(), 0);
}
