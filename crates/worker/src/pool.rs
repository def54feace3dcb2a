use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use agent_core::config::ExecutorConfig;
use agent_core::constants::REASON_CANCELLED;
use agent_core::{AgentError, AgentResult};
use agent_domain::{
    AgentKey, RemoteSubTask, TaskEnvironment, TaskLogLine, TaskRegistry, TaskState, TaskStore,
};
use agent_infrastructure::metrics;

use crate::components::{log_pump, panic_capture, task_execution, upstream_sync};
use crate::upstream::UpstreamReporter;

/// 正在执行的子任务
struct RunningSlot {
    cancel: CancellationToken,
    /// 执行期间再次被提交：结束后重新检查一次
    rerun: bool,
}

#[derive(Default)]
struct PoolState {
    queued: HashSet<i64>,
    running: HashMap<i64, RunningSlot>,
}

/// 执行器内部共享的状态与依赖
pub(crate) struct PoolShared {
    pub(crate) store: Arc<dyn TaskStore>,
    pub(crate) registry: Arc<TaskRegistry>,
    pub(crate) env: Arc<dyn TaskEnvironment>,
    pub(crate) upstream: Arc<dyn UpstreamReporter>,
    pub(crate) self_key: AgentKey,
    pub(crate) config: ExecutorConfig,
    pub(crate) log_tx: mpsc::UnboundedSender<TaskLogLine>,
    pub(crate) shutdown: CancellationToken,
    waiting_tx: mpsc::UnboundedSender<i64>,
    state: Mutex<PoolState>,
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 加入等待队列；已在队列中时忽略，正在执行时标记为结束后重跑
    pub(crate) fn add_task(&self, id: i64) -> bool {
        let mut state = self.lock();
        if let Some(slot) = state.running.get_mut(&id) {
            slot.rerun = true;
            return false;
        }
        if !state.queued.insert(id) {
            return false;
        }
        if self.waiting_tx.send(id).is_err() {
            state.queued.remove(&id);
            return false;
        }
        metrics::record_executor_queue(state.queued.len(), state.running.len());
        true
    }

    /// 工作协程取到任务，返回本次执行的取消令牌
    fn begin(&self, id: i64) -> Option<CancellationToken> {
        let mut state = self.lock();
        state.queued.remove(&id);
        if let Some(slot) = state.running.get_mut(&id) {
            slot.rerun = true;
            return None;
        }
        let cancel = CancellationToken::new();
        state.running.insert(
            id,
            RunningSlot {
                cancel: cancel.clone(),
                rerun: false,
            },
        );
        Some(cancel)
    }

    /// 执行结束，返回是否需要重跑
    fn end(&self, id: i64) -> bool {
        let mut state = self.lock();
        let rerun = state.running.remove(&id).is_some_and(|slot| slot.rerun);
        metrics::record_executor_queue(state.queued.len(), state.running.len());
        rerun
    }

    pub(crate) fn cancel(&self, id: i64) -> bool {
        match self.lock().running.get(&id) {
            Some(slot) => {
                slot.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_running(&self, id: i64) -> bool {
        self.lock().running.contains_key(&id)
    }
}

struct PoolReceivers {
    waiting_rx: mpsc::UnboundedReceiver<i64>,
    log_rx: mpsc::UnboundedReceiver<TaskLogLine>,
}

/// 子任务执行器
///
/// 等待队列去重后由分发协程送入有界的就绪队列，固定数量的工作协程竞争消费。
/// 停止时正在执行的子任务被中止并以"executor stopped"失败结束，
/// 本地落盘后镜像子任务再尝试上报一次；未开始的子任务留给下次启动恢复。
pub struct ExecutorPool {
    shared: Arc<PoolShared>,
    receivers: Mutex<Option<PoolReceivers>>,
    handles: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl ExecutorPool {
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<TaskRegistry>,
        env: Arc<dyn TaskEnvironment>,
        upstream: Arc<dyn UpstreamReporter>,
        self_key: AgentKey,
        config: ExecutorConfig,
    ) -> Self {
        let (waiting_tx, waiting_rx) = mpsc::unbounded_channel();
        let (log_tx, log_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(PoolShared {
            store,
            registry,
            env,
            upstream,
            self_key,
            config,
            log_tx,
            shutdown: CancellationToken::new(),
            waiting_tx,
            state: Mutex::new(PoolState::default()),
        });
        Self {
            shared,
            receivers: Mutex::new(Some(PoolReceivers { waiting_rx, log_rx })),
            handles: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// 启动分发、工作、日志与重报协程，并恢复上次未完成的子任务
    pub async fn start(&self) -> AgentResult<()> {
        let receivers = self
            .receivers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| AgentError::internal("执行器已经启动"))?;

        panic_capture::install_hook();
        let workers = self.shared.config.workers.max(1);
        let (ready_tx, ready_rx) = mpsc::channel(workers);
        let ready_rx = Arc::new(tokio::sync::Mutex::new(ready_rx));

        let mut handles = self.handles.lock().await;
        handles.push(tokio::spawn(dispatch_loop(
            self.shared.clone(),
            receivers.waiting_rx,
            ready_tx,
        )));
        for worker_no in 0..workers {
            handles.push(tokio::spawn(worker_loop(
                self.shared.clone(),
                ready_rx.clone(),
                worker_no,
            )));
        }
        handles.push(tokio::spawn(log_pump::run(
            self.shared.clone(),
            receivers.log_rx,
        )));
        handles.push(tokio::spawn(upstream_sync::run(self.shared.clone())));
        drop(handles);

        info!("执行器已启动: {} 个工作协程", workers);
        self.recover().await
    }

    /// 停止所有协程，等待正在执行的子任务以失败结束并完成上报
    pub async fn stop(&self) {
        self.shared.shutdown.cancel();
        let handles = std::mem::take(&mut *self.handles.lock().await);
        for handle in handles {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    warn!("执行器协程异常退出: {}", e);
                }
            }
        }
        info!("执行器已停止");
    }

    /// 重新接纳存储中READY/RUNNING的子任务
    async fn recover(&self) -> AgentResult<()> {
        let tasks = self.shared.store.get_unfinished_sub_tasks().await?;
        if !tasks.is_empty() {
            info!("恢复 {} 个未完成的子任务", tasks.len());
        }
        for task in tasks {
            self.shared.add_task(task.id);
        }
        Ok(())
    }

    /// 提交子任务，重复提交会被合并
    pub fn add_task(&self, id: i64) -> bool {
        self.shared.add_task(id)
    }

    /// 镜像集群子任务并提交执行，返回本地子任务id
    pub async fn accept_remote(&self, remote: &RemoteSubTask) -> AgentResult<i64> {
        let local_id = self.shared.store.create_local_by_remote(remote).await?;
        self.shared.add_task(local_id);
        debug!(
            "接收远程子任务: 远程 {} -> 本地 {}",
            remote.remote_task_id, local_id
        );
        Ok(local_id)
    }

    /// 触发正在执行的子任务的取消令牌
    pub fn cancel(&self, id: i64) -> bool {
        self.shared.cancel(id)
    }

    /// 取消集群子任务的本地镜像
    ///
    /// 未在执行时直接置为失败并标记已同步，上游已经知道它被取消。
    pub async fn cancel_remote(&self, remote_task_id: i64, execute_times: i64) -> AgentResult<()> {
        let store = &self.shared.store;
        let Some(mapping) = store.get_mapping_by_remote(remote_task_id).await? else {
            debug!("远程子任务 {} 没有本地镜像，忽略取消", remote_task_id);
            return Ok(());
        };
        if mapping.execute_times != execute_times {
            debug!(
                "取消请求的执行次数 {} 与本地 {} 不一致，忽略",
                execute_times, mapping.execute_times
            );
            return Ok(());
        }

        let local_id = mapping.local_task_id;
        if self.shared.cancel(local_id) {
            info!("取消正在执行的镜像子任务: 本地 {}", local_id);
            return Ok(());
        }

        let Some(task) = store.get_sub_task(local_id).await? else {
            return Ok(());
        };
        if matches!(task.state, TaskState::Pending | TaskState::Ready) {
            match store.set_sub_task_failed(local_id, execute_times).await {
                Ok(()) | Err(AgentError::ConflictingState(_)) => {}
                Err(e) => return Err(e),
            }
            store
                .append_log(local_id, execute_times, REASON_CANCELLED)
                .await?;
            store.set_mapping_synced(local_id, execute_times).await?;
            info!("镜像子任务在执行前被取消: 本地 {}", local_id);
        }
        Ok(())
    }

    pub fn is_running(&self, id: i64) -> bool {
        self.shared.is_running(id)
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.shared.store
    }
}

async fn dispatch_loop(
    shared: Arc<PoolShared>,
    mut waiting_rx: mpsc::UnboundedReceiver<i64>,
    ready_tx: mpsc::Sender<i64>,
) {
    loop {
        let id = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            id = waiting_rx.recv() => match id {
                Some(id) => id,
                None => break,
            },
        };
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            sent = ready_tx.send(id) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
    debug!("执行器分发协程退出");
}

async fn worker_loop(
    shared: Arc<PoolShared>,
    ready_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<i64>>>,
    worker_no: usize,
) {
    loop {
        let next = {
            let mut rx = ready_rx.lock().await;
            tokio::select! {
                _ = shared.shutdown.cancelled() => None,
                id = rx.recv() => id,
            }
        };
        let Some(id) = next else {
            break;
        };
        let Some(cancel) = shared.begin(id) else {
            continue;
        };

        task_execution::run(&shared, id, cancel).await;

        if shared.end(id) && !shared.shutdown.is_cancelled() {
            shared.add_task(id);
        }
    }
    debug!("执行器工作协程 {} 退出", worker_no);
}
