use async_trait::async_trait;
use sqlx::any::AnyArguments;
use sqlx::query::Query;
use sqlx::{Any, AnyConnection, Row};
use tracing::{debug, instrument};

use agent_core::{AgentError, AgentResult};
use agent_domain::{
    now_millis, AgentKey, DagInstance, DagTemplate, NodeInstance, Operator,
    RemoteSubTask, StoreScope, SubTaskInstance, SubTaskLog, SubTaskUpdate, TaskContext,
    TaskMapping, TaskState, TaskStore,
};

use super::mapping::{
    flag, row_to_dag, row_to_log, row_to_mapping, row_to_node, row_to_sub_task, DAG_COLUMNS,
    NODE_COLUMNS, SUB_TASK_COLUMNS,
};
use super::{DatabaseType, SqlStore};

const UNFINISHED_STATES: &str = "('PENDING', 'READY', 'RUNNING')";

/// 执行插入并取回自增主键
///
/// SQLite 的 Any 驱动不返回 `last_insert_id`，改用 `RETURNING id`；
/// MySQL 不支持 `RETURNING`，仍读取 `last_insert_id`。
async fn insert_returning_id<'q>(
    db_type: DatabaseType,
    query: Query<'q, Any, AnyArguments<'q>>,
    conn: &mut AnyConnection,
) -> AgentResult<i64> {
    match db_type {
        DatabaseType::Sqlite => {
            let row = query.fetch_one(&mut *conn).await?;
            Ok(row.try_get("id")?)
        }
        DatabaseType::Mysql => query
            .execute(&mut *conn)
            .await?
            .last_insert_id()
            .ok_or_else(|| AgentError::internal("数据库未返回自增主键")),
    }
}

fn returning_id(db_type: DatabaseType) -> &'static str {
    match db_type {
        DatabaseType::Sqlite => " RETURNING id",
        DatabaseType::Mysql => "",
    }
}

fn port_value(agent: &AgentKey) -> i64 {
    i64::from(agent.port)
}

#[async_trait]
impl TaskStore for SqlStore {
    fn scope(&self) -> StoreScope {
        self.scope
    }

    async fn now(&self) -> AgentResult<i64> {
        match self.scope {
            StoreScope::Local => Ok(now_millis()),
            StoreScope::Cluster => {
                let row = sqlx::query(&format!("SELECT {} AS now", self.now_expr()))
                    .fetch_one(&self.pool)
                    .await?;
                Ok(row.try_get("now")?)
            }
        }
    }

    #[instrument(skip(self, template, context), fields(dag_name = %template.name))]
    async fn create_dag(
        &self,
        template: &DagTemplate,
        context: &TaskContext,
        default_agent: &AgentKey,
    ) -> AgentResult<DagInstance> {
        let empty_context = TaskContext::new().to_json()?;
        let mut tx = self.pool.begin().await?;

        let dag_sql = format!(
            "INSERT INTO dag_instance (name, dag_type, state, operator, maintenance, context, \
             start_time, end_time, create_time) VALUES (?, ?, ?, ?, ?, ?, 0, 0, {}){}",
            self.now_expr(),
            returning_id(self.db_type)
        );
        let query = sqlx::query(&dag_sql)
            .bind(&template.name)
            .bind(template.dag_type.as_str())
            .bind(TaskState::Pending.as_str())
            .bind(Operator::Run.as_str())
            .bind(flag(template.maintenance))
            .bind(context.to_json()?);
        let dag_id = insert_returning_id(self.db_type, query, &mut tx).await?;

        let node_sql = format!(
            "INSERT INTO node_instance (dag_id, seq, name, node_type, state, operator, \
             execute_agents, context, start_time, end_time) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, 0){}",
            returning_id(self.db_type)
        );
        for (node_seq, node) in template.nodes.iter().enumerate() {
            let query = sqlx::query(&node_sql)
                .bind(dag_id)
                .bind(node_seq as i64)
                .bind(&node.name)
                .bind(node.node_type.as_str())
                .bind(TaskState::Pending.as_str())
                .bind(Operator::Run.as_str())
                .bind(serde_json::to_string(&node.execute_agents)?)
                .bind(&empty_context);
            let node_id = insert_returning_id(self.db_type, query, &mut tx).await?;

            for (task_seq, (agent, task)) in node.expand(default_agent).into_iter().enumerate() {
                sqlx::query(&format!(
                    "INSERT INTO sub_task_instance ({}) VALUES \
                     (NULL, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?, ?, ?, ?, ?, 0, 0)",
                    SUB_TASK_COLUMNS
                ))
                .bind(dag_id)
                .bind(node_id)
                .bind(task_seq as i64)
                .bind(&task.kind)
                .bind(&task.name)
                .bind(TaskState::Pending.as_str())
                .bind(Operator::Run.as_str())
                .bind(&agent.ip)
                .bind(port_value(&agent))
                .bind(flag(task.capabilities.can_cancel))
                .bind(flag(task.capabilities.can_continue))
                .bind(flag(task.capabilities.can_pass))
                .bind(flag(task.capabilities.can_retry))
                .bind(flag(task.capabilities.can_rollback))
                .bind(task.timeout_ms)
                .bind(&empty_context)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        debug!("创建DAG成功: ID {}, 名称 {}", dag_id, template.name);

        self.get_dag(dag_id)
            .await?
            .ok_or_else(|| AgentError::not_found("DAG", dag_id))
    }

    async fn get_dag(&self, id: i64) -> AgentResult<Option<DagInstance>> {
        let row = sqlx::query(&format!(
            "SELECT {DAG_COLUMNS} FROM dag_instance WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_dag).transpose()
    }

    async fn get_unfinished_dags(&self) -> AgentResult<Vec<DagInstance>> {
        let rows = sqlx::query(&format!(
            "SELECT {DAG_COLUMNS} FROM dag_instance WHERE state IN {UNFINISHED_STATES} ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_dag).collect()
    }

    async fn get_recent_dags(&self, limit: i64) -> AgentResult<Vec<DagInstance>> {
        let rows = sqlx::query(&format!(
            "SELECT {DAG_COLUMNS} FROM dag_instance ORDER BY id DESC LIMIT ?"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_dag).collect()
    }

    #[instrument(skip(self), fields(dag_id = %id, state = %state))]
    async fn update_dag_state(&self, id: i64, state: TaskState) -> AgentResult<()> {
        let now = self.now_expr();
        let sql = if state.is_finished() {
            format!(
                "UPDATE dag_instance SET state = ?, end_time = {now}, maintenance = 0 WHERE id = ?"
            )
        } else {
            format!(
                "UPDATE dag_instance SET start_time = CASE WHEN start_time = 0 THEN {now} \
                 ELSE start_time END, state = ?, end_time = 0 WHERE id = ?"
            )
        };
        let result = sqlx::query(&sql)
            .bind(state.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AgentError::not_found("DAG", id));
        }
        debug!("更新DAG状态成功: ID {}, 状态 {}", id, state);
        Ok(())
    }

    #[instrument(skip(self, dag), fields(dag_id = %dag.id, operator = %operator, state = %state))]
    async fn set_dag_operator(
        &self,
        dag: &DagInstance,
        operator: Operator,
        state: TaskState,
    ) -> AgentResult<()> {
        let end_time = if state.is_finished() {
            self.now_expr()
        } else {
            "0"
        };
        let maintenance = if state.is_finished() {
            "0"
        } else {
            "maintenance"
        };
        let result = sqlx::query(&format!(
            "UPDATE dag_instance SET operator = ?, state = ?, end_time = {end_time}, \
             maintenance = {maintenance} WHERE id = ? AND operator = ? AND state = ?"
        ))
        .bind(operator.as_str())
        .bind(state.as_str())
        .bind(dag.id)
        .bind(dag.operator.as_str())
        .bind(dag.state.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AgentError::conflict(format!(
                "DAG {} 已不是 {}/{}",
                dag.id, dag.state, dag.operator
            )));
        }
        debug!(
            "修改DAG操作类型成功: ID {}, {}/{} -> {}/{}",
            dag.id, dag.state, dag.operator, state, operator
        );
        Ok(())
    }

    async fn update_dag_context(&self, id: i64, context: &TaskContext) -> AgentResult<()> {
        sqlx::query("UPDATE dag_instance SET context = ? WHERE id = ?")
            .bind(context.to_json()?)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_nodes(&self, dag_id: i64) -> AgentResult<Vec<NodeInstance>> {
        let rows = sqlx::query(&format!(
            "SELECT {NODE_COLUMNS} FROM node_instance WHERE dag_id = ? ORDER BY seq"
        ))
        .bind(dag_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_node).collect()
    }

    #[instrument(skip(self, node), fields(node_id = %node.id, state = %node.state))]
    async fn update_node(&self, node: &NodeInstance) -> AgentResult<()> {
        sqlx::query(
            "UPDATE node_instance SET state = ?, operator = ?, context = ?, start_time = ?, \
             end_time = ? WHERE id = ?",
        )
        .bind(node.state.as_str())
        .bind(node.operator.as_str())
        .bind(node.context.to_json()?)
        .bind(node.start_time)
        .bind(node.end_time)
        .bind(node.id)
        .execute(&self.pool)
        .await?;
        debug!("更新节点成功: ID {}, 状态 {}/{}", node.id, node.state, node.operator);
        Ok(())
    }

    async fn get_sub_task(&self, id: i64) -> AgentResult<Option<SubTaskInstance>> {
        let row = sqlx::query(&format!(
            "SELECT {SUB_TASK_COLUMNS} FROM sub_task_instance WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_sub_task).transpose()
    }

    async fn get_sub_tasks(&self, node_id: i64) -> AgentResult<Vec<SubTaskInstance>> {
        let rows = sqlx::query(&format!(
            "SELECT {SUB_TASK_COLUMNS} FROM sub_task_instance WHERE node_id = ? ORDER BY seq, id"
        ))
        .bind(node_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_sub_task).collect()
    }

    async fn get_unfinished_sub_tasks(&self) -> AgentResult<Vec<SubTaskInstance>> {
        let rows = sqlx::query(&format!(
            "SELECT {SUB_TASK_COLUMNS} FROM sub_task_instance \
             WHERE state IN ('READY', 'RUNNING') ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_sub_task).collect()
    }

    #[instrument(skip(self, task, context), fields(sub_task_id = %task.id, operator = %operator))]
    async fn set_sub_task_ready(
        &self,
        task: &SubTaskInstance,
        operator: Operator,
        execute_times: i64,
        context: &TaskContext,
    ) -> AgentResult<()> {
        let result = sqlx::query(
            "UPDATE sub_task_instance SET state = 'READY', operator = ?, execute_times = ?, \
             context = ?, end_time = 0 \
             WHERE id = ? AND state = ? AND operator = ? AND execute_times = ?",
        )
        .bind(operator.as_str())
        .bind(execute_times)
        .bind(context.to_json()?)
        .bind(task.id)
        .bind(task.state.as_str())
        .bind(task.operator.as_str())
        .bind(task.execute_times)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AgentError::conflict(format!(
                "子任务 {} 已不是 {}/{}/{}",
                task.id, task.state, task.operator, task.execute_times
            )));
        }
        debug!(
            "子任务就绪: ID {}, 操作 {}, 执行次数 {}",
            task.id, operator, execute_times
        );
        Ok(())
    }

    #[instrument(skip(self))]
    async fn start_sub_task(
        &self,
        id: i64,
        execute_times: i64,
        operator: Operator,
    ) -> AgentResult<()> {
        let result = sqlx::query(&format!(
            "UPDATE sub_task_instance SET state = 'RUNNING', start_time = {}, end_time = 0 \
             WHERE id = ? AND state = 'READY' AND execute_times = ? AND operator = ?",
            self.now_expr()
        ))
        .bind(id)
        .bind(execute_times)
        .bind(operator.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AgentError::conflict(format!(
                "子任务 {id} 无法启动: 不是 READY/{operator}/{execute_times}"
            )));
        }
        debug!("子任务开始执行: ID {}", id);
        Ok(())
    }

    #[instrument(skip(self, context))]
    async fn finish_sub_task(
        &self,
        id: i64,
        execute_times: i64,
        operator: Operator,
        state: TaskState,
        context: &TaskContext,
    ) -> AgentResult<()> {
        if !state.is_finished() {
            return Err(AgentError::invalid_param(format!("{state} 不是终态")));
        }
        let now = self.now_expr();
        let result = sqlx::query(&format!(
            "UPDATE sub_task_instance SET start_time = CASE WHEN start_time = 0 THEN {now} \
             ELSE start_time END, state = ?, context = ?, end_time = {now} \
             WHERE id = ? AND state IN ('READY', 'RUNNING') AND execute_times = ? \
             AND operator IN (?, 'CANCEL')"
        ))
        .bind(state.as_str())
        .bind(context.to_json()?)
        .bind(id)
        .bind(execute_times)
        .bind(operator.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AgentError::conflict(format!(
                "子任务 {id} 无法结束: 执行次数 {execute_times} 已过期或状态已变化"
            )));
        }
        debug!("子任务结束: ID {}, 状态 {}", id, state);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn set_sub_task_failed(&self, id: i64, execute_times: i64) -> AgentResult<()> {
        let result = sqlx::query(&format!(
            "UPDATE sub_task_instance SET state = 'FAILED', end_time = {} \
             WHERE id = ? AND execute_times = ? AND state IN {UNFINISHED_STATES}",
            self.now_expr()
        ))
        .bind(id)
        .bind(execute_times)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AgentError::conflict(format!(
                "子任务 {id} 已结束或执行次数已变化"
            )));
        }
        debug!("子任务置为失败: ID {}", id);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn set_sub_task_pass(&self, id: i64, execute_times: i64) -> AgentResult<()> {
        let result = sqlx::query(&format!(
            "UPDATE sub_task_instance SET state = 'PASS', end_time = {} \
             WHERE id = ? AND execute_times = ? AND state <> 'RUNNING'",
            self.now_expr()
        ))
        .bind(id)
        .bind(execute_times)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AgentError::conflict(format!(
                "子任务 {id} 正在运行或执行次数已变化"
            )));
        }
        debug!("子任务跳过: ID {}", id);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn set_sub_task_operator(
        &self,
        id: i64,
        execute_times: i64,
        operator: Operator,
    ) -> AgentResult<()> {
        let result = sqlx::query(&format!(
            "UPDATE sub_task_instance SET operator = ? \
             WHERE id = ? AND execute_times = ? AND state IN {UNFINISHED_STATES}"
        ))
        .bind(operator.as_str())
        .bind(id)
        .bind(execute_times)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AgentError::conflict(format!(
                "子任务 {id} 已结束或执行次数已变化"
            )));
        }
        Ok(())
    }

    #[instrument(skip(self, update), fields(remote_task_id = %update.remote_task_id, state = %update.state))]
    async fn apply_sub_task_update(&self, update: &SubTaskUpdate) -> AgentResult<()> {
        let now = self.now_expr();
        let result = match update.state {
            TaskState::Running => {
                sqlx::query(&format!(
                    "UPDATE sub_task_instance SET start_time = CASE WHEN state = 'RUNNING' \
                     THEN start_time ELSE {now} END, state = 'RUNNING' \
                     WHERE id = ? AND execute_times = ? AND operator IN (?, 'CANCEL') \
                     AND state IN ('READY', 'RUNNING')"
                ))
                .bind(update.remote_task_id)
                .bind(update.execute_times)
                .bind(update.operator.as_str())
                .execute(&self.pool)
                .await?
            }
            state if state.is_finished() => {
                let context_clause = if update.context.is_some() {
                    ", context = ?"
                } else {
                    ""
                };
                let sql = format!(
                    "UPDATE sub_task_instance SET start_time = CASE WHEN start_time = 0 \
                     THEN {now} ELSE start_time END, state = ?, end_time = {now}{context_clause} \
                     WHERE id = ? AND execute_times = ? AND operator IN (?, 'CANCEL') \
                     AND state IN ('READY', 'RUNNING')"
                );
                let mut query = sqlx::query(&sql).bind(state.as_str());
                if let Some(context) = &update.context {
                    query = query.bind(context.to_json()?);
                }
                query
                    .bind(update.remote_task_id)
                    .bind(update.execute_times)
                    .bind(update.operator.as_str())
                    .execute(&self.pool)
                    .await?
            }
            state => {
                return Err(AgentError::invalid_param(format!(
                    "执行代理不能上报状态 {state}"
                )))
            }
        };

        if result.rows_affected() == 0 {
            return Err(AgentError::conflict(format!(
                "子任务 {} 的第 {} 次执行已不再有效",
                update.remote_task_id, update.execute_times
            )));
        }
        debug!(
            "应用子任务上报: ID {}, 状态 {}, 来自 {}",
            update.remote_task_id, update.state, update.agent
        );
        Ok(())
    }

    #[instrument(skip(self, remote), fields(remote_task_id = %remote.remote_task_id, execute_times = %remote.execute_times))]
    async fn create_local_by_remote(&self, remote: &RemoteSubTask) -> AgentResult<i64> {
        let mut tx = self.pool.begin().await?;

        let mapping = sqlx::query(
            "SELECT local_task_id, remote_task_id, execute_times, sync_flag \
             FROM task_mapping WHERE remote_task_id = ?",
        )
        .bind(remote.remote_task_id)
        .fetch_optional(&mut *tx)
        .await?
        .as_ref()
        .map(row_to_mapping)
        .transpose()?;

        let local_id = match mapping {
            Some(mapping) => {
                let local = sqlx::query(&format!(
                    "SELECT {SUB_TASK_COLUMNS} FROM sub_task_instance WHERE id = ?"
                ))
                .bind(mapping.local_task_id)
                .fetch_optional(&mut *tx)
                .await?
                .as_ref()
                .map(row_to_sub_task)
                .transpose()?
                .ok_or_else(|| AgentError::not_found("子任务", mapping.local_task_id))?;

                if remote.execute_times < mapping.execute_times {
                    return Err(AgentError::conflict(format!(
                        "远程子任务 {} 的执行次数 {} 落后于本地 {}",
                        remote.remote_task_id, remote.execute_times, mapping.execute_times
                    )));
                }
                if remote.execute_times == mapping.execute_times
                    && remote.operator == local.operator
                {
                    // 同一次执行的重复提交
                    return Ok(local.id);
                }
                if local.state == TaskState::Running {
                    return Err(AgentError::conflict(format!(
                        "本地子任务 {} 的上一次执行仍在运行",
                        local.id
                    )));
                }

                sqlx::query(
                    "UPDATE sub_task_instance SET kind = ?, name = ?, state = 'READY', \
                     operator = ?, execute_times = ?, can_cancel = ?, can_continue = ?, \
                     can_pass = ?, can_retry = ?, can_rollback = ?, timeout_ms = ?, \
                     context = ?, end_time = 0 WHERE id = ?",
                )
                .bind(&remote.kind)
                .bind(&remote.name)
                .bind(remote.operator.as_str())
                .bind(remote.execute_times)
                .bind(flag(remote.capabilities.can_cancel))
                .bind(flag(remote.capabilities.can_continue))
                .bind(flag(remote.capabilities.can_pass))
                .bind(flag(remote.capabilities.can_retry))
                .bind(flag(remote.capabilities.can_rollback))
                .bind(remote.timeout_ms)
                .bind(remote.context.to_json()?)
                .bind(local.id)
                .execute(&mut *tx)
                .await?;
                sqlx::query(
                    "UPDATE task_mapping SET execute_times = ?, sync_flag = 0 \
                     WHERE local_task_id = ?",
                )
                .bind(remote.execute_times)
                .bind(local.id)
                .execute(&mut *tx)
                .await?;
                local.id
            }
            None => {
                let insert_sql = format!(
                    "INSERT INTO sub_task_instance ({}) VALUES \
                     (NULL, 0, 0, 0, ?, ?, 'READY', ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, 0){}",
                    SUB_TASK_COLUMNS,
                    returning_id(self.db_type)
                );
                let query = sqlx::query(&insert_sql)
                    .bind(&remote.kind)
                    .bind(&remote.name)
                    .bind(remote.operator.as_str())
                    .bind(&remote.execute_agent.ip)
                    .bind(port_value(&remote.execute_agent))
                    .bind(remote.execute_times)
                    .bind(flag(remote.capabilities.can_cancel))
                    .bind(flag(remote.capabilities.can_continue))
                    .bind(flag(remote.capabilities.can_pass))
                    .bind(flag(remote.capabilities.can_retry))
                    .bind(flag(remote.capabilities.can_rollback))
                    .bind(remote.timeout_ms)
                    .bind(remote.context.to_json()?);
                let local_id = insert_returning_id(self.db_type, query, &mut tx).await?;
                sqlx::query(
                    "INSERT INTO task_mapping (local_task_id, remote_task_id, execute_times, \
                     sync_flag) VALUES (?, ?, ?, 0)",
                )
                .bind(local_id)
                .bind(remote.remote_task_id)
                .bind(remote.execute_times)
                .execute(&mut *tx)
                .await?;
                local_id
            }
        };

        tx.commit().await?;
        debug!(
            "镜像远程子任务: 远程 {} -> 本地 {}, 执行次数 {}",
            remote.remote_task_id, local_id, remote.execute_times
        );
        Ok(local_id)
    }

    async fn get_mapping(&self, local_task_id: i64) -> AgentResult<Option<TaskMapping>> {
        let row = sqlx::query(
            "SELECT local_task_id, remote_task_id, execute_times, sync_flag \
             FROM task_mapping WHERE local_task_id = ?",
        )
        .bind(local_task_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_mapping).transpose()
    }

    async fn get_mapping_by_remote(
        &self,
        remote_task_id: i64,
    ) -> AgentResult<Option<TaskMapping>> {
        let row = sqlx::query(
            "SELECT local_task_id, remote_task_id, execute_times, sync_flag \
             FROM task_mapping WHERE remote_task_id = ?",
        )
        .bind(remote_task_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_mapping).transpose()
    }

    async fn set_mapping_synced(&self, local_task_id: i64, execute_times: i64) -> AgentResult<()> {
        sqlx::query(
            "UPDATE task_mapping SET sync_flag = 1 WHERE local_task_id = ? AND execute_times = ?",
        )
        .bind(local_task_id)
        .bind(execute_times)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_unsynced_mappings(&self) -> AgentResult<Vec<TaskMapping>> {
        let rows = sqlx::query(
            "SELECT local_task_id, remote_task_id, execute_times, sync_flag \
             FROM task_mapping WHERE sync_flag = 0 ORDER BY local_task_id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_mapping).collect()
    }

    async fn append_log(
        &self,
        sub_task_id: i64,
        execute_times: i64,
        content: &str,
    ) -> AgentResult<()> {
        sqlx::query(&format!(
            "INSERT INTO sub_task_log (sub_task_id, execute_times, content, create_time) \
             VALUES (?, ?, ?, {})",
            self.now_expr()
        ))
        .bind(sub_task_id)
        .bind(execute_times)
        .bind(content)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_logs(&self, sub_task_id: i64) -> AgentResult<Vec<SubTaskLog>> {
        let rows = sqlx::query(
            "SELECT id, sub_task_id, execute_times, content, create_time \
             FROM sub_task_log WHERE sub_task_id = ? ORDER BY id",
        )
        .bind(sub_task_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_log).collect()
    }
}
