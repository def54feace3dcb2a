//! 配置管理
//!
//! 加载顺序：
//! 1. 内置默认值（来自 [`crate::constants`]）
//! 2. TOML 配置文件（可选）
//! 3. 环境变量覆盖（前缀 `AGENT`，分隔符 `__`，例如 `AGENT__SCHEDULER__INTERVAL_MS=500`）
//!
//! 命令行参数在启动路径中最后应用，优先级最高。

pub mod models;

pub use models::{
    AgentConfig, AppConfig, ClusterStoreConfig, CoordinatorConfig, ExecutorConfig, LogFormat,
    ObservabilityConfig, RpcConfig, SchedulerConfig, StoreConfig,
};
