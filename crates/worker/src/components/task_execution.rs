//! 单个子任务的一次执行
//!
//! 启动（READY -> RUNNING）、执行任务体、写入终态、回报上游。
//! 任务体在独立的tokio任务中运行，与截止时间、取消令牌和执行器停止信号竞争；
//! 任一先到即中止任务体并以失败结束。

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use agent_core::constants::{
    REASON_AGENT_RESTARTED, REASON_CANCELLED, REASON_EXECUTOR_STOPPED, REASON_TIMEOUT,
};
use agent_core::{AgentError, AgentResult};
use agent_domain::{
    now_millis, ExecutionContext, Operator, SubTask, SubTaskInstance, SubTaskUpdate, TaskContext,
    TaskMapping, TaskState,
};
use agent_infrastructure::metrics;

use super::panic_capture;
use super::upstream_sync::report_finished;
use crate::pool::PoolShared;

enum Outcome {
    Succeed(TaskContext),
    Failed { reason: String, context: TaskContext },
}

/// 任务体内捕获到的panic
struct Panicked {
    message: String,
    backtrace: Option<String>,
}

impl Outcome {
    fn failed(reason: impl Into<String>, context: TaskContext) -> Self {
        Outcome::Failed {
            reason: reason.into(),
            context,
        }
    }
}

pub(crate) async fn run(shared: &PoolShared, id: i64, cancel: CancellationToken) {
    if let Err(e) = try_run(shared, id, cancel).await {
        warn!(sub_task_id = id, "执行子任务出错: {}", e);
    }
}

async fn try_run(shared: &PoolShared, id: i64, cancel: CancellationToken) -> AgentResult<()> {
    let started = Instant::now();
    let store = &shared.store;
    let Some(task) = store.get_sub_task(id).await? else {
        warn!(sub_task_id = id, "子任务不存在");
        return Ok(());
    };

    let continued = match task.state {
        TaskState::Ready => {
            match store
                .start_sub_task(id, task.execute_times, task.operator)
                .await
            {
                Ok(()) => false,
                Err(AgentError::ConflictingState(msg)) => {
                    debug!(sub_task_id = id, "子任务状态已变化，跳过: {}", msg);
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
        TaskState::Running if task.capabilities.can_continue => {
            info!(sub_task_id = id, "继续执行重启前未完成的子任务");
            true
        }
        TaskState::Running => {
            let mapping = store.get_mapping(id).await?;
            let outcome = Outcome::failed(REASON_AGENT_RESTARTED, task.context.clone());
            return complete(shared, &task, mapping.as_ref(), outcome, started).await;
        }
        _ => return Ok(()),
    };

    // 重新读取以拿到数据库写入的 start_time
    let task = store
        .get_sub_task(id)
        .await?
        .ok_or_else(|| AgentError::not_found("子任务", id))?;
    let mapping = store.get_mapping(id).await?;

    if let (Some(mapping), false) = (&mapping, continued) {
        let update = SubTaskUpdate {
            remote_task_id: mapping.remote_task_id,
            execute_times: task.execute_times,
            operator: task.operator,
            state: TaskState::Running,
            context: None,
            agent: shared.self_key.clone(),
        };
        match shared.upstream.report(&update).await {
            Ok(()) => {}
            Err(AgentError::ConflictingState(msg)) => {
                warn!(
                    sub_task_id = id,
                    remote_task_id = mapping.remote_task_id,
                    "上游拒绝本次执行，放弃: {}",
                    msg
                );
                store
                    .finish_sub_task(
                        id,
                        task.execute_times,
                        task.operator,
                        TaskState::Failed,
                        &task.context,
                    )
                    .await?;
                store.set_mapping_synced(id, task.execute_times).await?;
                return Ok(());
            }
            Err(e) => {
                warn!(sub_task_id = id, "上报RUNNING失败，继续执行: {}", e);
            }
        }
    }

    let outcome = execute(shared, &task, mapping.as_ref(), cancel, continued).await;
    complete(shared, &task, mapping.as_ref(), outcome, started).await
}

fn remaining_time(shared: &PoolShared, task: &SubTaskInstance) -> Duration {
    let timeout_ms = if task.timeout_ms > 0 {
        task.timeout_ms
    } else {
        shared.config.default_timeout().as_millis() as i64
    };
    let elapsed = if task.start_time > 0 {
        (now_millis() - task.start_time).max(0)
    } else {
        0
    };
    Duration::from_millis((timeout_ms - elapsed).max(0) as u64)
}

async fn execute(
    shared: &PoolShared,
    task: &SubTaskInstance,
    mapping: Option<&TaskMapping>,
    cancel: CancellationToken,
    continued: bool,
) -> Outcome {
    let sub_task: Arc<dyn SubTask> = match shared.registry.create(&task.kind) {
        Ok(sub_task) => Arc::from(sub_task),
        Err(e) => return Outcome::failed(e.to_string(), task.context.clone()),
    };

    let deadline = Instant::now() + remaining_time(shared, task);
    let ctx = Arc::new(
        ExecutionContext::new(task, shared.env.clone())
            .with_cancel(cancel.clone())
            .with_deadline(deadline)
            .with_logger(shared.log_tx.clone(), mapping.map(|m| m.remote_task_id))
            .continued(continued),
    );
    if cancel.is_cancelled() {
        return Outcome::failed(REASON_CANCELLED, task.context.clone());
    }

    info!(
        sub_task_id = task.id,
        execute_times = task.execute_times,
        kind = %task.kind,
        operator = %task.operator,
        "开始执行子任务"
    );

    let body_ctx = ctx.clone();
    let operator = task.operator;
    let mut handle = tokio::spawn(async move {
        let body = async {
            if operator == Operator::Rollback {
                sub_task.rollback(&body_ctx).await
            } else {
                sub_task.execute(&body_ctx).await
            }
        };
        // 调用栈由panic钩子记在当前线程，必须在同一次poll内取出
        AssertUnwindSafe(body).catch_unwind().await.map_err(|payload| Panicked {
            message: panic_message(payload),
            backtrace: panic_capture::take_backtrace(),
        })
    });

    let joined = tokio::select! {
        joined = &mut handle => joined,
        _ = tokio::time::sleep_until(deadline) => {
            handle.abort();
            return Outcome::failed(REASON_TIMEOUT, ctx.context_snapshot());
        }
        _ = cancel.cancelled() => {
            handle.abort();
            return Outcome::failed(REASON_CANCELLED, ctx.context_snapshot());
        }
        _ = shared.shutdown.cancelled() => {
            handle.abort();
            return Outcome::failed(REASON_EXECUTOR_STOPPED, ctx.context_snapshot());
        }
    };

    let context = ctx.context_snapshot();
    match joined {
        Ok(Ok(Ok(()))) => Outcome::Succeed(context),
        Ok(Ok(Err(AgentError::Cancelled))) => Outcome::failed(REASON_CANCELLED, context),
        Ok(Ok(Err(AgentError::Timeout(_)))) => Outcome::failed(REASON_TIMEOUT, context),
        Ok(Ok(Err(e))) => Outcome::failed(e.to_string(), context),
        Ok(Err(panicked)) => {
            error!(
                sub_task_id = task.id,
                backtrace = panicked.backtrace.as_deref().unwrap_or("<unavailable>"),
                "子任务发生panic: {}",
                panicked.message
            );
            Outcome::failed(AgentError::Panicked(panicked.message).to_string(), context)
        }
        Err(e) if e.is_panic() => {
            let message = panic_message(e.into_panic());
            error!(sub_task_id = task.id, "子任务发生panic: {}", message);
            Outcome::failed(AgentError::Panicked(message).to_string(), context)
        }
        Err(_) => Outcome::failed(REASON_EXECUTOR_STOPPED, context),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn complete(
    shared: &PoolShared,
    task: &SubTaskInstance,
    mapping: Option<&TaskMapping>,
    outcome: Outcome,
    started: Instant,
) -> AgentResult<()> {
    let (state, context) = match outcome {
        Outcome::Succeed(context) => (TaskState::Succeed, context),
        Outcome::Failed { reason, context } => {
            warn!(
                sub_task_id = task.id,
                execute_times = task.execute_times,
                "子任务执行失败: {}",
                reason
            );
            if let Err(e) = shared
                .store
                .append_log(task.id, task.execute_times, &reason)
                .await
            {
                warn!(sub_task_id = task.id, "写入子任务日志失败: {}", e);
            }
            (TaskState::Failed, context)
        }
    };

    match shared
        .store
        .finish_sub_task(task.id, task.execute_times, task.operator, state, &context)
        .await
    {
        Ok(()) => {}
        Err(AgentError::ConflictingState(msg)) => {
            warn!(sub_task_id = task.id, "子任务结束时状态已变化: {}", msg);
            return Ok(());
        }
        Err(e) => return Err(e),
    }

    metrics::record_sub_task_finished(&task.kind, state, started.elapsed());
    info!(
        sub_task_id = task.id,
        execute_times = task.execute_times,
        state = %state,
        "子任务执行结束"
    );

    if let Some(mapping) = mapping {
        report_finished(shared, task, mapping.remote_task_id, state, context).await;
    }
    Ok(())
}
