//! 节点控制代理的基础库：错误类型、常量、配置模型与日志初始化。

pub mod config;
pub mod constants;
pub mod errors;
pub mod logging;

pub use config::models::AppConfig;
pub use constants::{exit_with_failure, ExitCode};
pub use errors::{AgentError, AgentResult};
