//! 子任务执行器
//!
//! [`ExecutorPool`] 从本地存储读取子任务并在固定数量的工作协程中执行。
//! 集群子任务在本地的镜像执行完成后通过 [`UpstreamReporter`] 回报上游。

pub mod components;
pub mod pool;
pub mod upstream;

pub use pool::ExecutorPool;
pub use upstream::UpstreamReporter;
