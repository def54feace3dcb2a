use std::sync::Arc;

use tracing::{debug, info};

use agent_core::{AgentError, AgentResult};
use agent_domain::{
    AgentKey, ClusterStoreSlot, DagDetail, DagInstance, DagTemplate, GenericId, NodeDetail,
    Operator, StoreScope, SubTaskInstance, SubTaskLog, TaskContext, TaskState, TaskStore,
};

/// DAG的创建、查询与人工操作
///
/// 操作只修改DAG行（以及作为重新调度标记的失败节点），实际推进由调度器完成。
pub struct DagController {
    local: Arc<dyn TaskStore>,
    slot: ClusterStoreSlot,
}

impl DagController {
    pub fn new(local: Arc<dyn TaskStore>, slot: ClusterStoreSlot) -> Self {
        Self { local, slot }
    }

    pub fn store_for(&self, scope: StoreScope) -> AgentResult<Arc<dyn TaskStore>> {
        match scope {
            StoreScope::Local => Ok(self.local.clone()),
            StoreScope::Cluster => self
                .slot
                .get()
                .map(|stores| stores.tasks)
                .ok_or_else(|| AgentError::StoreUnavailable("未接入集群存储".to_string())),
        }
    }

    pub async fn create(
        &self,
        scope: StoreScope,
        template: &DagTemplate,
        context: &TaskContext,
        default_agent: &AgentKey,
    ) -> AgentResult<DagDetail> {
        let store = self.store_for(scope)?;
        let dag = store.create_dag(template, context, default_agent).await?;
        info!(dag_id = %dag.generic_id(), "创建DAG: {}", dag.name);
        detail_of(store.as_ref(), dag).await
    }

    pub async fn get_detail(&self, id: GenericId) -> AgentResult<DagDetail> {
        let store = self.store_for(id.scope)?;
        let dag = load_dag(store.as_ref(), id).await?;
        detail_of(store.as_ref(), dag).await
    }

    pub async fn list_unfinished(&self, scope: StoreScope) -> AgentResult<Vec<DagInstance>> {
        self.store_for(scope)?.get_unfinished_dags().await
    }

    pub async fn list_recent(&self, scope: StoreScope, limit: i64) -> AgentResult<Vec<DagInstance>> {
        self.store_for(scope)?.get_recent_dags(limit).await
    }

    pub async fn sub_task_logs(&self, scope: StoreScope, id: i64) -> AgentResult<Vec<SubTaskLog>> {
        let store = self.store_for(scope)?;
        if store.get_sub_task(id).await?.is_none() {
            return Err(AgentError::not_found("子任务", id));
        }
        store.get_logs(id).await
    }

    /// 修改DAG的操作类型
    ///
    /// - CANCEL：DAG未完成，且正在运行的子任务都可以取消
    /// - RETRY：DAG已失败，且失败的子任务都可以重试
    /// - ROLLBACK：DAG已失败；不能回滚的子任务在推进时直接PASS
    /// - RUN：不接受，DAG创建时即为RUN
    pub async fn set_operator(&self, id: GenericId, operator: Operator) -> AgentResult<DagDetail> {
        let store = self.store_for(id.scope)?;
        let dag = load_dag(store.as_ref(), id).await?;
        let detail = detail_of(store.as_ref(), dag.clone()).await?;
        let sub_tasks = || detail.nodes.iter().flat_map(|node| node.sub_tasks.iter());

        match operator {
            Operator::Run => {
                return Err(AgentError::invalid_param("DAG创建后即为RUN，不能再次设置"));
            }
            Operator::Cancel => {
                if dag.is_finished() {
                    return Err(AgentError::conflict(format!("DAG {id} 已经结束")));
                }
                if let Some(task) = sub_tasks()
                    .find(|t| t.state == TaskState::Running && !t.capabilities.can_cancel)
                {
                    return Err(refuse(task, "不支持取消"));
                }
                store.set_dag_operator(&dag, Operator::Cancel, dag.state).await?;
            }
            Operator::Retry | Operator::Rollback => {
                if dag.state != TaskState::Failed {
                    return Err(AgentError::conflict(format!(
                        "DAG {id} 状态为 {}，只有失败的DAG可以{}",
                        dag.state, operator
                    )));
                }
                if operator == Operator::Retry {
                    if let Some(task) = sub_tasks()
                        .find(|t| t.state == TaskState::Failed && !t.capabilities.can_retry)
                    {
                        return Err(refuse(task, "不支持重试"));
                    }
                }
                // 失败节点置为READY，调度器据此开始新一轮
                for node in &detail.nodes {
                    if node.node.state == TaskState::Failed {
                        let mut staged = node.node.clone();
                        staged.state = TaskState::Ready;
                        store.update_node(&staged).await?;
                        debug!(node_id = staged.id, "节点等待重新调度");
                    }
                }
                store
                    .set_dag_operator(&dag, operator, TaskState::Running)
                    .await?;
            }
        }

        info!(dag_id = %id, operator = %operator, "DAG操作已更新");
        self.get_detail(id).await
    }
}

async fn load_dag(store: &dyn TaskStore, id: GenericId) -> AgentResult<DagInstance> {
    store
        .get_dag(id.id)
        .await?
        .ok_or_else(|| AgentError::not_found("DAG", id))
}

pub(crate) async fn detail_of(store: &dyn TaskStore, dag: DagInstance) -> AgentResult<DagDetail> {
    let mut nodes = Vec::new();
    for node in store.get_nodes(dag.id).await? {
        let sub_tasks = store.get_sub_tasks(node.id).await?;
        nodes.push(NodeDetail { node, sub_tasks });
    }
    Ok(DagDetail {
        generic_id: dag.generic_id().to_string(),
        dag,
        nodes,
    })
}

fn refuse(task: &SubTaskInstance, reason: &str) -> AgentError {
    AgentError::conflict(format!("子任务 {}({}) {}", task.id, task.name, reason))
}
