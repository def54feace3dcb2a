use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use agent_core::{AgentError, AgentResult};

use crate::task::SubTask;

pub type TaskFactory = Arc<dyn Fn() -> Box<dyn SubTask> + Send + Sync>;

/// 任务类型注册表
///
/// `kind` 到构造函数的映射。启动时每个模块注册一次自己的任务类型，
/// 调度器与执行器按持久化的 `kind` 重建子任务。
#[derive(Default)]
pub struct TaskRegistry {
    factories: RwLock<HashMap<String, TaskFactory>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册任务类型，重复注册返回错误
    pub fn register<F>(&self, kind: &str, factory: F) -> AgentResult<()>
    where
        F: Fn() -> Box<dyn SubTask> + Send + Sync + 'static,
    {
        let mut factories = self.factories.write().unwrap_or_else(|e| e.into_inner());
        if factories.contains_key(kind) {
            return Err(AgentError::DuplicateTaskKind(kind.to_string()));
        }
        factories.insert(kind.to_string(), Arc::new(factory));
        Ok(())
    }

    /// 按任务自身声明的 `kind` 注册
    pub fn register_task<T>(&self) -> AgentResult<()>
    where
        T: SubTask + Default + 'static,
    {
        let kind = T::default().kind();
        self.register(kind, || Box::new(T::default()))
    }

    pub fn create(&self, kind: &str) -> AgentResult<Box<dyn SubTask>> {
        let factory = {
            let factories = self.factories.read().unwrap_or_else(|e| e.into_inner());
            factories.get(kind).cloned()
        };
        factory
            .map(|f| f())
            .ok_or_else(|| AgentError::UnknownTaskKind(kind.to_string()))
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self
            .factories
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        kinds.sort();
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::ExecutionContext;
    use async_trait::async_trait;

    #[derive(Default)]
    struct Noop;

    #[async_trait]
    impl SubTask for Noop {
        fn kind(&self) -> &'static str {
            "noop"
        }

        async fn execute(&self, _ctx: &ExecutionContext) -> AgentResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_register_and_create() {
        let registry = TaskRegistry::new();
        registry.register_task::<Noop>().unwrap();

        assert!(registry.contains("noop"));
        assert_eq!(registry.create("noop").unwrap().kind(), "noop");
        assert_eq!(registry.kinds(), vec!["noop".to_string()]);
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let registry = TaskRegistry::new();
        registry.register_task::<Noop>().unwrap();
        let err = registry.register_task::<Noop>().unwrap_err();
        assert!(matches!(err, AgentError::DuplicateTaskKind(kind) if kind == "noop"));
    }

    #[test]
    fn test_unknown_kind() {
        let registry = TaskRegistry::new();
        let err = registry.create("removed_in_downgrade").err().unwrap();
        assert!(matches!(err, AgentError::UnknownTaskKind(_)));
    }
}
