//! 任务引擎的调度侧
//!
//! 本地/集群调度器、维护者选举、成员同步、DAG控制与成员管理，
//! 由 [`Engine`] 在进程启动时统一组装。

pub mod controller;
pub mod coordinator;
pub mod engine;
pub mod membership;
pub mod reporter;
pub mod scheduler;
pub mod synchronizer;

#[cfg(test)]
mod testing;

pub use controller::DagController;
pub use coordinator::Coordinator;
pub use engine::{AgentStatus, Engine, EngineDeps};
pub use membership::{register_builtin_tasks, AgentService, AgentServices};
pub use reporter::ClusterUpstream;
pub use scheduler::{ClusterDispatcher, LocalDispatcher, StoreSource, TaskDispatcher, TaskScheduler};
pub use synchronizer::AgentSynchronizer;
