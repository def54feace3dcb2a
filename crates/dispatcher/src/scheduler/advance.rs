//! 按操作类型推进一个DAG
//!
//! 每次推进只依据存储中的当前状态做决定，所有写入都是带条件的单行更新；
//! 条件不满足说明别人已经推进过，本周期放弃，下个周期重新读取。
//!
//! 重新置为READY时必须改变 (operator, execute_times) 之一，执行代理据此
//! 区分新的一次执行与重复投递：
//! - 首次执行与 RETRY 使执行次数加一
//! - 首次回滚保持执行次数，只把操作改为ROLLBACK
//! - 再次回滚（上次回滚失败）使执行次数加一

use tracing::{debug, info, warn};

use agent_core::constants::{REASON_CANCELLED, REASON_TIMEOUT};
use agent_core::{AgentError, AgentResult};
use agent_domain::{
    DagInstance, NodeInstance, NodeType, Operator, SubTaskInstance, TaskContext, TaskState,
    TaskStore,
};

use super::dispatch::TaskDispatcher;

enum NodeProgress {
    Running,
    Succeed,
    Failed,
}

/// 一个调度周期内的推进器，`now` 取自所推进的存储
pub(crate) struct Advancer<'a> {
    pub(crate) store: &'a dyn TaskStore,
    pub(crate) dispatcher: &'a dyn TaskDispatcher,
    pub(crate) now: i64,
}

impl Advancer<'_> {
    pub(crate) async fn advance_dag(&self, mut dag: DagInstance) -> AgentResult<()> {
        if matches!(dag.state, TaskState::Pending | TaskState::Ready) {
            self.store
                .update_dag_state(dag.id, TaskState::Running)
                .await?;
            dag.state = TaskState::Running;
            info!(dag_id = dag.id, "DAG开始执行: {}", dag.name);
        }

        let mut nodes = Vec::new();
        for node in self.store.get_nodes(dag.id).await? {
            let tasks = self.store.get_sub_tasks(node.id).await?;
            nodes.push((node, tasks));
        }

        match dag.operator {
            Operator::Run | Operator::Retry => self.advance_forward(&mut dag, nodes).await,
            Operator::Rollback => self.advance_rollback(&dag, nodes).await,
            Operator::Cancel => self.advance_cancel(&dag, nodes).await,
        }
    }

    // ---- RUN / RETRY ----

    async fn advance_forward(
        &self,
        dag: &mut DagInstance,
        nodes: Vec<(NodeInstance, Vec<SubTaskInstance>)>,
    ) -> AgentResult<()> {
        for (mut node, mut tasks) in nodes {
            if node.state.is_success() {
                continue;
            }

            if node.state == TaskState::Pending {
                self.start_node(dag, &mut node).await?;
            } else if node.state == TaskState::Failed && node.operator == dag.operator {
                return self.fail_dag(dag).await;
            } else if node.operator != dag.operator || node.state == TaskState::Ready {
                if dag.operator == Operator::Retry {
                    self.stage_retry(&mut node, &tasks).await?;
                } else {
                    node.operator = dag.operator;
                    node.state = TaskState::Running;
                    node.end_time = 0;
                    self.store.update_node(&node).await?;
                }
                tasks = self.store.get_sub_tasks(node.id).await?;
            }

            match self.run_node(&mut node, &tasks).await? {
                NodeProgress::Running => return Ok(()),
                NodeProgress::Failed => return self.fail_dag(dag).await,
                NodeProgress::Succeed => {
                    dag.context.merge_data(&node.context);
                    self.store.update_dag_context(dag.id, &dag.context).await?;
                }
            }
        }

        self.store
            .update_dag_state(dag.id, TaskState::Succeed)
            .await?;
        info!(dag_id = dag.id, "DAG执行成功: {}", dag.name);
        Ok(())
    }

    async fn start_node(&self, dag: &DagInstance, node: &mut NodeInstance) -> AgentResult<()> {
        node.state = TaskState::Running;
        node.operator = dag.operator;
        node.context = dag.context.clone();
        node.start_time = self.now;
        node.end_time = 0;
        self.store.update_node(node).await?;
        debug!(dag_id = dag.id, node_id = node.id, "节点开始执行: {}", node.name);
        Ok(())
    }

    /// 失败的子任务：能回滚的先回滚，再以RETRY重新执行
    async fn stage_retry(&self, node: &mut NodeInstance, tasks: &[SubTaskInstance]) -> AgentResult<()> {
        for task in tasks.iter().filter(|t| t.state == TaskState::Failed) {
            let operator = if task.capabilities.can_rollback && task.has_run() {
                Operator::Rollback
            } else {
                Operator::Retry
            };
            self.stage(task, operator, &node.context).await?;
        }
        node.state = TaskState::Running;
        node.operator = Operator::Retry;
        node.end_time = 0;
        self.store.update_node(node).await?;
        info!(node_id = node.id, "节点开始重试: {}", node.name);
        Ok(())
    }

    /// 推进一个处于RUN的节点
    ///
    /// 同一节点内的子任务互相隔离：顺序节点中后面的子任务看不到前面兄弟写入的数据。
    /// 全部成功后才把子任务数据汇总到节点（扇出节点写入 `agent_data`），再由调用方流向DAG。
    async fn run_node(
        &self,
        node: &mut NodeInstance,
        tasks: &[SubTaskInstance],
    ) -> AgentResult<NodeProgress> {
        let sequential = node.node_type == NodeType::Normal;
        let mut all_success = true;
        let mut failed = false;
        let mut active = false;

        for task in tasks {
            match task.state {
                TaskState::Succeed | TaskState::Pass => {
                    // 重试前的回滚已完成，接着重新执行
                    if node.operator == Operator::Retry && task.operator == Operator::Rollback {
                        self.stage(task, Operator::Retry, &node.context).await?;
                        all_success = false;
                        active = true;
                    }
                }
                TaskState::Failed => {
                    failed = true;
                    all_success = false;
                }
                TaskState::Pending => {
                    all_success = false;
                    if failed {
                        continue;
                    }
                    self.stage(task, Operator::Run, &node.context).await?;
                    active = true;
                }
                TaskState::Ready => {
                    all_success = false;
                    active = true;
                    self.dispatch(task).await;
                }
                TaskState::Running => {
                    all_success = false;
                    if self.check_timeout(task).await? {
                        failed = true;
                    } else {
                        active = true;
                    }
                }
            }
            if sequential && !all_success {
                break;
            }
        }

        if all_success {
            for task in tasks {
                if node.is_fan_out() {
                    node.context.set_agent_data(&task.execute_agent, &task.context);
                } else {
                    node.context.merge_data(&task.context);
                }
            }
            node.state = TaskState::Succeed;
            node.end_time = self.now;
            self.store.update_node(node).await?;
            debug!(node_id = node.id, "节点执行成功: {}", node.name);
            return Ok(NodeProgress::Succeed);
        }
        if failed && !active {
            node.state = TaskState::Failed;
            node.end_time = self.now;
            self.store.update_node(node).await?;
            warn!(node_id = node.id, operator = %node.operator, "节点执行失败: {}", node.name);
            return Ok(NodeProgress::Failed);
        }
        Ok(NodeProgress::Running)
    }

    async fn fail_dag(&self, dag: &DagInstance) -> AgentResult<()> {
        if dag.maintenance && dag.operator != Operator::Rollback {
            self.store
                .set_dag_operator(dag, Operator::Rollback, TaskState::Running)
                .await?;
            warn!(dag_id = dag.id, "维护中的DAG执行失败，开始回滚: {}", dag.name);
            return Ok(());
        }
        self.store.update_dag_state(dag.id, TaskState::Failed).await?;
        warn!(dag_id = dag.id, operator = %dag.operator, "DAG执行失败: {}", dag.name);
        Ok(())
    }

    // ---- ROLLBACK ----

    async fn advance_rollback(
        &self,
        dag: &DagInstance,
        nodes: Vec<(NodeInstance, Vec<SubTaskInstance>)>,
    ) -> AgentResult<()> {
        for (mut node, mut tasks) in nodes.into_iter().rev() {
            if node.is_rolled_back() {
                continue;
            }
            if node.state == TaskState::Pending {
                self.pass_node(&mut node, &tasks).await?;
                continue;
            }
            if node.state == TaskState::Failed && node.operator == Operator::Rollback {
                return self.fail_dag(dag).await;
            }
            if node.operator != Operator::Rollback || node.state == TaskState::Ready {
                self.stage_rollback(&mut node, &tasks).await?;
                tasks = self.store.get_sub_tasks(node.id).await?;
            }

            match self.rollback_node(&mut node, &tasks).await? {
                NodeProgress::Running => return Ok(()),
                NodeProgress::Failed => return self.fail_dag(dag).await,
                NodeProgress::Succeed => {}
            }
        }

        // 回滚完成后DAG保持FAILED，操作类型为ROLLBACK
        self.store.update_dag_state(dag.id, TaskState::Failed).await?;
        info!(dag_id = dag.id, "DAG回滚完成: {}", dag.name);
        Ok(())
    }

    async fn pass_node(&self, node: &mut NodeInstance, tasks: &[SubTaskInstance]) -> AgentResult<()> {
        for task in tasks.iter().filter(|t| !t.state.is_finished()) {
            self.pass(task).await?;
        }
        node.state = TaskState::Pass;
        node.operator = Operator::Rollback;
        node.end_time = self.now;
        self.store.update_node(node).await?;
        debug!(node_id = node.id, "节点未执行，直接跳过: {}", node.name);
        Ok(())
    }

    async fn stage_rollback(&self, node: &mut NodeInstance, tasks: &[SubTaskInstance]) -> AgentResult<()> {
        // 上次回滚失败的子任务重新回滚
        for task in tasks
            .iter()
            .filter(|t| t.state == TaskState::Failed && t.operator == Operator::Rollback)
        {
            self.stage(task, Operator::Rollback, &node.context).await?;
        }
        node.state = TaskState::Running;
        node.operator = Operator::Rollback;
        node.end_time = 0;
        self.store.update_node(node).await?;
        info!(node_id = node.id, "节点开始回滚: {}", node.name);
        Ok(())
    }

    /// 顺序节点从最后一个子任务开始逐个回滚，并行节点同时回滚
    async fn rollback_node(
        &self,
        node: &mut NodeInstance,
        tasks: &[SubTaskInstance],
    ) -> AgentResult<NodeProgress> {
        let sequential = node.node_type == NodeType::Normal;
        let ordered: Vec<&SubTaskInstance> = if sequential {
            tasks.iter().rev().collect()
        } else {
            tasks.iter().collect()
        };
        let mut done = true;
        let mut failed = false;
        let mut active = false;

        for task in ordered {
            if task.is_rolled_back() {
                continue;
            }
            if task.operator == Operator::Rollback {
                done = false;
                match task.state {
                    TaskState::Ready => {
                        active = true;
                        self.dispatch(task).await;
                    }
                    TaskState::Running => {
                        if self.check_timeout(task).await? {
                            failed = true;
                        } else {
                            active = true;
                        }
                    }
                    TaskState::Failed => failed = true,
                    TaskState::Pending => {
                        self.stage(task, Operator::Rollback, &node.context).await?;
                        active = true;
                    }
                    TaskState::Succeed | TaskState::Pass => {}
                }
            } else if task.state == TaskState::Running {
                // 还在正向执行的子任务，等它结束
                done = false;
                if self.check_timeout(task).await? {
                    failed = true;
                } else {
                    active = true;
                }
            } else if !task.has_run() || !task.capabilities.can_rollback {
                self.pass(task).await?;
            } else {
                done = false;
                self.stage(task, Operator::Rollback, &node.context).await?;
                active = true;
            }
            if sequential && !done {
                break;
            }
        }

        if done {
            node.state = TaskState::Succeed;
            node.end_time = self.now;
            self.store.update_node(node).await?;
            debug!(node_id = node.id, "节点回滚完成: {}", node.name);
            return Ok(NodeProgress::Succeed);
        }
        if failed && !active {
            node.state = TaskState::Failed;
            node.end_time = self.now;
            self.store.update_node(node).await?;
            warn!(node_id = node.id, "节点回滚失败: {}", node.name);
            return Ok(NodeProgress::Failed);
        }
        Ok(NodeProgress::Running)
    }

    // ---- CANCEL ----

    async fn advance_cancel(
        &self,
        dag: &DagInstance,
        nodes: Vec<(NodeInstance, Vec<SubTaskInstance>)>,
    ) -> AgentResult<()> {
        let mut running = false;
        for (mut node, tasks) in nodes {
            if node.state.is_finished() || node.state == TaskState::Pending {
                continue;
            }
            if node.operator != Operator::Cancel {
                node.operator = Operator::Cancel;
                self.store.update_node(&node).await?;
            }

            let mut node_running = false;
            for task in &tasks {
                match task.state {
                    TaskState::Pending | TaskState::Ready => {
                        self.fail_with_reason(task, REASON_CANCELLED).await?;
                    }
                    TaskState::Running => {
                        if self.check_timeout(task).await? {
                            continue;
                        }
                        if task.operator != Operator::Cancel {
                            match self
                                .store
                                .set_sub_task_operator(task.id, task.execute_times, Operator::Cancel)
                                .await
                            {
                                Ok(()) | Err(AgentError::ConflictingState(_)) => {}
                                Err(e) => return Err(e),
                            }
                        }
                        if let Err(e) = self.dispatcher.cancel(task).await {
                            debug!(sub_task_id = task.id, "发送取消信号失败，下个周期重试: {}", e);
                        }
                        node_running = true;
                    }
                    _ => {}
                }
            }

            if !node_running {
                node.state = TaskState::Failed;
                node.end_time = self.now;
                self.store.update_node(&node).await?;
            }
            running |= node_running;
        }

        if !running {
            self.store.update_dag_state(dag.id, TaskState::Failed).await?;
            info!(dag_id = dag.id, "DAG已取消: {}", dag.name);
        }
        Ok(())
    }

    // ---- 子任务 ----

    /// 以新的操作重新置为READY并投递
    async fn stage(
        &self,
        task: &SubTaskInstance,
        operator: Operator,
        context: &TaskContext,
    ) -> AgentResult<()> {
        let execute_times = if operator == Operator::Retry
            || task.state == TaskState::Pending
            || (operator == task.operator && task.state.is_finished())
        {
            task.execute_times + 1
        } else {
            task.execute_times
        };
        match self
            .store
            .set_sub_task_ready(task, operator, execute_times, context)
            .await
        {
            Ok(()) => {}
            Err(AgentError::ConflictingState(msg)) => {
                debug!(sub_task_id = task.id, "子任务已被推进，跳过: {}", msg);
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        debug!(
            sub_task_id = task.id,
            operator = %operator,
            execute_times,
            "子任务就绪"
        );

        let mut staged = task.clone();
        staged.state = TaskState::Ready;
        staged.operator = operator;
        staged.execute_times = execute_times;
        staged.context = context.clone();
        staged.end_time = 0;
        self.dispatch(&staged).await;
        Ok(())
    }

    async fn dispatch(&self, task: &SubTaskInstance) {
        if let Err(e) = self.dispatcher.dispatch(task).await {
            match e {
                AgentError::ConflictingState(_) => {
                    debug!(sub_task_id = task.id, "执行代理拒绝投递: {}", e)
                }
                _ => warn!(
                    sub_task_id = task.id,
                    agent = %task.execute_agent,
                    "投递子任务失败，下个周期重试: {}",
                    e
                ),
            }
        }
    }

    async fn pass(&self, task: &SubTaskInstance) -> AgentResult<()> {
        match self.store.set_sub_task_pass(task.id, task.execute_times).await {
            Ok(()) | Err(AgentError::ConflictingState(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// 超时的子任务置为失败并通知执行者停止，返回是否超时
    async fn check_timeout(&self, task: &SubTaskInstance) -> AgentResult<bool> {
        if !task.is_timeout(self.now) {
            return Ok(false);
        }
        if !self.fail_with_reason(task, REASON_TIMEOUT).await? {
            return Ok(false);
        }
        warn!(
            sub_task_id = task.id,
            timeout_ms = task.timeout_ms,
            "子任务执行超时"
        );
        if let Err(e) = self.dispatcher.cancel(task).await {
            debug!(sub_task_id = task.id, "通知执行者停止失败: {}", e);
        }
        Ok(true)
    }

    async fn fail_with_reason(&self, task: &SubTaskInstance, reason: &str) -> AgentResult<bool> {
        match self
            .store
            .set_sub_task_failed(task.id, task.execute_times)
            .await
        {
            Ok(()) => {}
            Err(AgentError::ConflictingState(_)) => return Ok(false),
            Err(e) => return Err(e),
        }
        self.store
            .append_log(task.id, task.execute_times, reason)
            .await?;
        Ok(true)
    }
}
