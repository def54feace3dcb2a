use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use agent_domain::{RemoteLog, TaskLogLine};

use crate::pool::PoolShared;

/// 把子任务日志写入本地存储，镜像子任务的日志再尽力转发给上游
pub(crate) async fn run(shared: Arc<PoolShared>, mut log_rx: mpsc::UnboundedReceiver<TaskLogLine>) {
    loop {
        let line = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            line = log_rx.recv() => match line {
                Some(line) => line,
                None => break,
            },
        };
        write(&shared, line).await;
    }

    // 停止前写完已经产生的日志
    while let Ok(line) = log_rx.try_recv() {
        write(&shared, line).await;
    }
    debug!("日志协程退出");
}

async fn write(shared: &PoolShared, line: TaskLogLine) {
    if let Err(e) = shared
        .store
        .append_log(line.sub_task_id, line.execute_times, &line.content)
        .await
    {
        warn!(sub_task_id = line.sub_task_id, "写入子任务日志失败: {}", e);
    }

    if let Some(remote_task_id) = line.remote_task_id {
        let log = RemoteLog {
            remote_task_id,
            execute_times: line.execute_times,
            content: line.content,
        };
        if let Err(e) = shared.upstream.push_log(&log).await {
            debug!(remote_task_id, "转发子任务日志失败: {}", e);
        }
    }
}
