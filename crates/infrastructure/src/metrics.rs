//! 运行指标
//!
//! 只通过 `metrics` 门面记录，不绑定具体的导出器；
//! 未安装 recorder 时所有调用都是空操作。

use std::time::Duration;

use metrics::{counter, gauge, histogram};

use agent_domain::{CoordinatorRole, StoreScope, TaskState};

pub fn record_sub_task_finished(kind: &str, state: TaskState, duration: Duration) {
    counter!(
        "agent_sub_task_finished_total",
        "kind" => kind.to_string(),
        "state" => state.as_str()
    )
    .increment(1);
    histogram!("agent_sub_task_duration_seconds", "kind" => kind.to_string())
        .record(duration.as_secs_f64());
}

pub fn record_executor_queue(waiting: usize, running: usize) {
    gauge!("agent_executor_waiting_tasks").set(waiting as f64);
    gauge!("agent_executor_running_tasks").set(running as f64);
}

pub fn record_scheduler_tick(scope: StoreScope, dags: usize, duration: Duration) {
    gauge!("agent_scheduler_unfinished_dags", "scope" => scope.as_str()).set(dags as f64);
    histogram!("agent_scheduler_tick_duration_seconds", "scope" => scope.as_str())
        .record(duration.as_secs_f64());
}

pub fn record_scheduler_error(scope: StoreScope) {
    counter!("agent_scheduler_errors_total", "scope" => scope.as_str()).increment(1);
}

pub fn record_dispatch(scope: StoreScope, remote: bool) {
    counter!(
        "agent_sub_task_dispatched_total",
        "scope" => scope.as_str(),
        "target" => if remote { "remote" } else { "local" }
    )
    .increment(1);
}

pub fn record_role_change(role: CoordinatorRole) {
    let role = match role {
        CoordinatorRole::Faulty => "faulty",
        CoordinatorRole::Watcher => "watcher",
        CoordinatorRole::Maintainer => "maintainer",
    };
    counter!("agent_coordinator_role_changes_total", "role" => role).increment(1);
}

pub fn record_agents_sync(success: bool) {
    counter!(
        "agent_members_sync_total",
        "result" => if success { "success" } else { "failure" }
    )
    .increment(1);
}

pub fn record_rpc_error(path: &'static str) {
    counter!("agent_rpc_errors_total", "path" => path).increment(1);
}
