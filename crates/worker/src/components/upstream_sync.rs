//! 镜像子任务终态的上报与重报

use tracing::{debug, warn};

use agent_core::AgentError;
use agent_domain::{SubTaskInstance, SubTaskUpdate, TaskContext, TaskState};

use crate::pool::PoolShared;

/// 上报终态；成功或上游已前进时标记映射为已同步，其余错误留给重报
pub(crate) async fn report_finished(
    shared: &PoolShared,
    task: &SubTaskInstance,
    remote_task_id: i64,
    state: TaskState,
    context: TaskContext,
) -> bool {
    let local_task_id = task.id;
    let execute_times = task.execute_times;
    let update = SubTaskUpdate {
        remote_task_id,
        execute_times,
        operator: task.operator,
        state,
        context: Some(context),
        agent: shared.self_key.clone(),
    };
    match shared.upstream.report(&update).await {
        Ok(()) => {}
        Err(AgentError::ConflictingState(msg)) => {
            debug!(
                sub_task_id = local_task_id,
                "上游已不接受该结果，不再上报: {}", msg
            );
        }
        Err(e) => {
            warn!(
                sub_task_id = local_task_id,
                remote_task_id, "上报子任务结果失败，稍后重试: {}", e
            );
            return false;
        }
    }

    if let Err(e) = shared
        .store
        .set_mapping_synced(local_task_id, execute_times)
        .await
    {
        warn!(sub_task_id = local_task_id, "标记映射已同步失败: {}", e);
        return false;
    }
    true
}

/// 周期性重报已结束但尚未同步的镜像子任务
pub(crate) async fn run(shared: std::sync::Arc<PoolShared>) {
    let mut ticker = tokio::time::interval(shared.config.resync_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if let Err(e) = resync_once(&shared).await {
            debug!("重报镜像子任务失败: {}", e);
        }
    }
    debug!("上报重试协程退出");
}

async fn resync_once(shared: &PoolShared) -> agent_core::AgentResult<()> {
    for mapping in shared.store.get_unsynced_mappings().await? {
        let Some(task) = shared.store.get_sub_task(mapping.local_task_id).await? else {
            continue;
        };
        if task.execute_times != mapping.execute_times || !task.state.is_finished() {
            continue;
        }
        if shared.is_running(task.id) {
            continue;
        }
        let context = task.context.clone();
        report_finished(shared, &task, mapping.remote_task_id, task.state, context).await;
    }
    Ok(())
}
