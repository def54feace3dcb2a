//! 子任务接口与执行上下文
//!
//! 执行器按持久化的 `kind` 从注册表构造 [`SubTask`]，在后台任务中调用
//! `execute` 或 `rollback`。长时间运行的任务应在IO边界调用
//! [`ExecutionContext::check_cancel`] 或使用 [`ExecutionContext::sleep`]，
//! 以便及时响应取消和超时。

use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use agent_core::constants::DEFAULT_SUB_TASK_TIMEOUT;
use agent_core::{AgentError, AgentResult};

use crate::context::TaskContext;
use crate::entities::{AgentKey, Operator, SubTaskInstance, TaskCapabilities};

/// 子任务接口
#[async_trait]
pub trait SubTask: Send + Sync {
    /// 注册表中的类型名，持久化在子任务记录中
    fn kind(&self) -> &'static str;

    fn name(&self) -> String {
        self.kind().to_string()
    }

    async fn execute(&self, ctx: &ExecutionContext) -> AgentResult<()>;

    async fn rollback(&self, _ctx: &ExecutionContext) -> AgentResult<()> {
        Ok(())
    }

    fn can_cancel(&self) -> bool {
        true
    }

    /// 代理重启后能否在RUNNING状态下继续执行
    fn can_continue(&self) -> bool {
        false
    }

    fn can_pass(&self) -> bool {
        false
    }

    fn can_retry(&self) -> bool {
        true
    }

    fn can_rollback(&self) -> bool {
        false
    }

    fn timeout(&self) -> Duration {
        DEFAULT_SUB_TASK_TIMEOUT
    }

    fn capabilities(&self) -> TaskCapabilities {
        TaskCapabilities {
            can_cancel: self.can_cancel(),
            can_continue: self.can_continue(),
            can_pass: self.can_pass(),
            can_retry: self.can_retry(),
            can_rollback: self.can_rollback(),
        }
    }
}

/// 子任务可访问的代理服务
///
/// 具体类型由组装进程决定，任务通过 [`ExecutionContext::env_as`] 取回。
pub trait TaskEnvironment: Send + Sync + 'static {
    fn as_any(&self) -> &dyn Any;
}

impl TaskEnvironment for () {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// 子任务日志行
#[derive(Debug, Clone)]
pub struct TaskLogLine {
    pub sub_task_id: i64,
    pub execute_times: i64,
    /// 集群子任务的镜像需要把日志转发给上游
    pub remote_task_id: Option<i64>,
    pub content: String,
}

/// 单次执行的上下文：取消令牌、截止时间、日志通道与任务上下文
pub struct ExecutionContext {
    sub_task_id: i64,
    execute_times: i64,
    operator: Operator,
    agent: AgentKey,
    remote_task_id: Option<i64>,
    is_continue: bool,
    cancel: CancellationToken,
    deadline: Instant,
    log_tx: Option<mpsc::UnboundedSender<TaskLogLine>>,
    context: Mutex<TaskContext>,
    env: Arc<dyn TaskEnvironment>,
}

impl ExecutionContext {
    pub fn new(task: &SubTaskInstance, env: Arc<dyn TaskEnvironment>) -> Self {
        let timeout = if task.timeout_ms > 0 {
            Duration::from_millis(task.timeout_ms as u64)
        } else {
            DEFAULT_SUB_TASK_TIMEOUT
        };
        Self {
            sub_task_id: task.id,
            execute_times: task.execute_times,
            operator: task.operator,
            agent: task.execute_agent.clone(),
            remote_task_id: None,
            is_continue: false,
            cancel: CancellationToken::new(),
            deadline: Instant::now() + timeout,
            log_tx: None,
            context: Mutex::new(task.context.clone()),
            env,
        }
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_logger(
        mut self,
        log_tx: mpsc::UnboundedSender<TaskLogLine>,
        remote_task_id: Option<i64>,
    ) -> Self {
        self.log_tx = Some(log_tx);
        self.remote_task_id = remote_task_id;
        self
    }

    pub fn continued(mut self, is_continue: bool) -> Self {
        self.is_continue = is_continue;
        self
    }

    pub fn sub_task_id(&self) -> i64 {
        self.sub_task_id
    }

    pub fn execute_times(&self) -> i64 {
        self.execute_times
    }

    pub fn operator(&self) -> Operator {
        self.operator
    }

    /// 执行该子任务的代理（即当前代理）
    pub fn agent(&self) -> &AgentKey {
        &self.agent
    }

    /// 代理重启后继续执行上一次未完成的调用
    pub fn is_continue(&self) -> bool {
        self.is_continue
    }

    fn lock(&self) -> MutexGuard<'_, TaskContext> {
        self.context.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get_param<T: DeserializeOwned>(&self, key: &str) -> AgentResult<T> {
        self.lock().get_param(key)
    }

    pub fn get_param_opt<T: DeserializeOwned>(&self, key: &str) -> AgentResult<Option<T>> {
        self.lock().get_param_opt(key)
    }

    pub fn get_data<T: DeserializeOwned>(&self, key: &str) -> AgentResult<Option<T>> {
        self.lock().get_data(key)
    }

    pub fn set_data<T: Serialize>(&self, key: &str, value: T) -> AgentResult<()> {
        self.lock().set_data(key, value)
    }

    pub fn context_snapshot(&self) -> TaskContext {
        self.lock().clone()
    }

    /// 写入子任务日志，同时输出到tracing
    pub fn log(&self, content: impl Into<String>) {
        let content = content.into();
        tracing::info!(
            sub_task_id = self.sub_task_id,
            execute_times = self.execute_times,
            "{}",
            content
        );
        if let Some(tx) = &self.log_tx {
            let _ = tx.send(TaskLogLine {
                sub_task_id: self.sub_task_id,
                execute_times: self.execute_times,
                remote_task_id: self.remote_task_id,
                content,
            });
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// IO边界的检查点：已取消或已超时时返回错误
    pub fn check_cancel(&self) -> AgentResult<()> {
        if self.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        if Instant::now() >= self.deadline {
            return Err(AgentError::Timeout(format!("子任务 {} 执行超时", self.sub_task_id)));
        }
        Ok(())
    }

    /// 可被取消的等待
    pub async fn sleep(&self, duration: Duration) -> AgentResult<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(AgentError::Cancelled),
            _ = tokio::time::sleep_until(self.deadline) => {
                Err(AgentError::Timeout(format!("子任务 {} 执行超时", self.sub_task_id)))
            }
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    pub fn env(&self) -> &Arc<dyn TaskEnvironment> {
        &self.env
    }

    pub fn env_as<T: 'static>(&self) -> AgentResult<&T> {
        self.env
            .as_any()
            .downcast_ref::<T>()
            .ok_or_else(|| AgentError::internal("执行环境类型不匹配"))
    }
}
