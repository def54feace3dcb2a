//! 协调器角色总线
//!
//! 基于 `tokio::sync::watch`：订阅时即可读到当前角色，集群调度器和成员同步器
//! 不会因为启动时序错过"成为维护者"的事件。

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::entities::AgentKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CoordinatorRole {
    /// 不知道当前维护者
    Faulty,
    Watcher,
    Maintainer,
}

/// 协调器对维护者的当前认知，也是 `GET /rpc/v1/maintainer` 的返回值
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintainerView {
    pub role: CoordinatorRole,
    pub maintainer: Option<AgentKey>,
    pub counter: i64,
    pub active_time: i64,
}

impl MaintainerView {
    pub fn faulty() -> Self {
        Self {
            role: CoordinatorRole::Faulty,
            maintainer: None,
            counter: 0,
            active_time: 0,
        }
    }

    pub fn is_maintainer(&self) -> bool {
        self.role == CoordinatorRole::Maintainer
    }

    /// 对外可信的回答：自己知道一个维护者
    pub fn is_credible(&self) -> bool {
        self.role != CoordinatorRole::Faulty && self.maintainer.is_some()
    }
}

#[derive(Clone)]
pub struct RoleBus {
    tx: watch::Sender<MaintainerView>,
}

impl RoleBus {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(MaintainerView::faulty());
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<MaintainerView> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> MaintainerView {
        self.tx.borrow().clone()
    }

    /// 发布新视图，内容未变化时不唤醒订阅者
    pub fn publish(&self, view: MaintainerView) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == view {
                false
            } else {
                *current = view;
                true
            }
        })
    }
}

impl Default for RoleBus {
    fn default() -> Self {
        Self::new()
    }
}
