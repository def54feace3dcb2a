//! DAG调度器
//!
//! 每个存储一个调度器：本地调度器始终运行，集群调度器只在本代理是维护者时运行。
//! 每个周期读取全部未完成的DAG，按节点顺序推进，然后休眠一个调度间隔。

mod advance;
mod dispatch;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use agent_core::config::SchedulerConfig;
use agent_core::AgentResult;
use agent_domain::{ClusterStoreSlot, MaintainerView, StoreScope, TaskStore};
use agent_infrastructure::metrics;

use advance::Advancer;
pub use dispatch::{ClusterDispatcher, LocalDispatcher, TaskDispatcher};

/// 调度器读取的存储
#[derive(Clone)]
pub enum StoreSource {
    Local(Arc<dyn TaskStore>),
    /// 未接入集群存储时调度周期为空操作
    Cluster(ClusterStoreSlot),
}

impl StoreSource {
    pub fn scope(&self) -> StoreScope {
        match self {
            StoreSource::Local(_) => StoreScope::Local,
            StoreSource::Cluster(_) => StoreScope::Cluster,
        }
    }

    pub fn get(&self) -> Option<Arc<dyn TaskStore>> {
        match self {
            StoreSource::Local(store) => Some(store.clone()),
            StoreSource::Cluster(slot) => slot.get().map(|stores| stores.tasks),
        }
    }
}

pub struct TaskScheduler {
    source: StoreSource,
    dispatcher: Arc<dyn TaskDispatcher>,
    config: SchedulerConfig,
}

impl TaskScheduler {
    pub fn new(
        source: StoreSource,
        dispatcher: Arc<dyn TaskDispatcher>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            source,
            dispatcher,
            config,
        }
    }

    pub fn scope(&self) -> StoreScope {
        self.source.scope()
    }

    /// 推进一轮全部未完成的DAG，返回推进的DAG数量
    ///
    /// 单个DAG出错不影响其他DAG，处理完后返回遇到的第一个错误。
    pub async fn tick(&self) -> AgentResult<usize> {
        let Some(store) = self.source.get() else {
            return Ok(0);
        };
        let started = Instant::now();
        let dags = store.get_unfinished_dags().await?;
        let advancer = Advancer {
            store: store.as_ref(),
            dispatcher: self.dispatcher.as_ref(),
            now: store.now().await?,
        };

        let count = dags.len();
        let mut first_error = None;
        for dag in dags {
            let dag_id = dag.id;
            if let Err(e) = advancer.advance_dag(dag).await {
                warn!(dag_id, scope = %self.scope(), "推进DAG失败: {}", e);
                first_error.get_or_insert(e);
            }
        }

        metrics::record_scheduler_tick(self.scope(), count, started.elapsed());
        match first_error {
            Some(e) => Err(e),
            None => Ok(count),
        }
    }

    /// 调度循环
    ///
    /// 传入 `gate` 时只在视图为维护者期间推进；订阅时即可读到当前角色，
    /// 不会错过启动前已经发生的角色变化。
    pub async fn run(
        self: Arc<Self>,
        mut gate: Option<watch::Receiver<MaintainerView>>,
        shutdown: CancellationToken,
    ) {
        let scope = self.scope();
        info!(scope = %scope, "调度器启动");
        loop {
            if let Some(gate) = gate.as_mut() {
                let is_maintainer = gate.borrow_and_update().is_maintainer();
                if !is_maintainer {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        changed = gate.changed() => {
                            if changed.is_err() {
                                break;
                            }
                            continue;
                        }
                    }
                }
            }

            let delay = match AssertUnwindSafe(self.tick()).catch_unwind().await {
                Ok(Ok(count)) => {
                    if count > 0 {
                        debug!(scope = %scope, "本周期推进 {} 个DAG", count);
                    }
                    self.config.interval()
                }
                Ok(Err(e)) => {
                    metrics::record_scheduler_error(scope);
                    if e.is_retryable() {
                        debug!(scope = %scope, "调度周期出错，稍后重试: {}", e);
                    }
                    self.config.error_interval()
                }
                Err(_) => {
                    metrics::record_scheduler_error(scope);
                    error!(scope = %scope, "调度周期发生panic");
                    self.config.error_interval()
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        info!(scope = %scope, "调度器已停止");
    }
}
