use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use agent_core::{AgentError, AgentResult};

use crate::entities::{AgentIdentity, AgentInstance, AgentKey};
use crate::repositories::LocalMetaStore;

/// 代理身份管理
///
/// 内存中的身份与本地存储中的自身记录保持一致：先持久化，成功后才更新内存。
/// 迁移只能沿 [`AgentIdentity::can_transit_to`] 允许的边进行。
pub struct IdentityManager {
    meta: Arc<dyn LocalMetaStore>,
    key: AgentKey,
    current: RwLock<AgentInstance>,
}

impl IdentityManager {
    /// 读取持久化的自身记录，不存在时以 `initial` 创建
    pub async fn load(meta: Arc<dyn LocalMetaStore>, initial: AgentInstance) -> AgentResult<Self> {
        let agent = match meta.load_self().await? {
            Some(stored) => stored,
            None => {
                meta.save_self(&initial).await?;
                initial
            }
        };
        Ok(Self {
            meta,
            key: agent.key(),
            current: RwLock::new(agent),
        })
    }

    pub fn self_key(&self) -> &AgentKey {
        &self.key
    }

    pub async fn current(&self) -> AgentInstance {
        self.current.read().await.clone()
    }

    pub async fn identity(&self) -> AgentIdentity {
        self.current.read().await.identity
    }

    pub async fn master(&self) -> Option<AgentKey> {
        self.current.read().await.master.clone()
    }

    /// 身份检查，不满足时返回 `WrongIdentity`
    pub async fn require(&self, expected: &[AgentIdentity]) -> AgentResult<()> {
        let identity = self.identity().await;
        if expected.contains(&identity) {
            Ok(())
        } else {
            let expected = expected
                .iter()
                .map(|i| i.as_str())
                .collect::<Vec<_>>()
                .join("|");
            Err(AgentError::wrong_identity(identity, expected))
        }
    }

    pub async fn transit(&self, to: AgentIdentity) -> AgentResult<AgentInstance> {
        self.transit_with(to, |_| {}).await
    }

    /// 迁移身份并在同一次持久化中修改其他字段
    pub async fn transit_with<F>(&self, to: AgentIdentity, f: F) -> AgentResult<AgentInstance>
    where
        F: FnOnce(&mut AgentInstance),
    {
        let mut current = self.current.write().await;
        let from = current.identity;
        if !from.can_transit_to(to) {
            return Err(AgentError::wrong_identity(from, format!("可迁移到{to}的身份")));
        }

        let mut next = current.clone();
        next.identity = to;
        f(&mut next);
        if to == AgentIdentity::Single {
            next.master = None;
        }
        self.meta.save_self(&next).await?;
        *current = next.clone();

        info!(agent = %self.key, from = %from, to = %to, "代理身份变更");
        Ok(next)
    }

    /// 修改身份以外的字段
    pub async fn update<F>(&self, f: F) -> AgentResult<AgentInstance>
    where
        F: FnOnce(&mut AgentInstance),
    {
        let mut current = self.current.write().await;
        let mut next = current.clone();
        f(&mut next);
        next.identity = current.identity;
        next.ip = current.ip.clone();
        next.port = current.port;
        self.meta.save_self(&next).await?;
        *current = next.clone();
        Ok(next)
    }
}
