//! 全局常量：调度周期、租约时长、执行器规模以及进程退出码。

use std::time::Duration;

/// 调度器两次推进之间的间隔
pub const SCHEDULER_INTERVAL: Duration = Duration::from_secs(1);
/// 调度器出错后的重试间隔
pub const SCHEDULER_ERROR_INTERVAL: Duration = Duration::from_millis(200);

/// 协调器的最小周期，实际周期 = 最小周期 + 角色相关的增量
pub const COORDINATOR_MIN_INTERVAL: Duration = Duration::from_secs(1);
/// 维护者租约的最大有效时长
pub const MAINTAINER_MAX_ACTIVE_TIME: Duration = Duration::from_secs(15);

/// 执行器默认工作协程数
pub const DEFAULT_EXECUTOR_WORKERS: usize = 8;
/// 子任务默认超时时间
pub const DEFAULT_SUB_TASK_TIMEOUT: Duration = Duration::from_secs(600);
/// 执行器未能上报完成时的重试间隔
pub const UPSTREAM_RESYNC_INTERVAL: Duration = Duration::from_secs(3);

/// 成员同步周期
pub const SYNCHRONIZER_INTERVAL: Duration = Duration::from_secs(2);

/// 代理间RPC的默认超时
pub const RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// 维护者记录的固定主键
pub const MAINTAINER_ROW_ID: i64 = 1;

/// 节点上下文中按代理存放结果的键
pub const AGENT_DATA_KEY: &str = "agent_data";

/// 子任务失败原因
pub const REASON_EXECUTOR_STOPPED: &str = "executor stopped";
pub const REASON_CANCELLED: &str = "cancelled";
pub const REASON_TIMEOUT: &str = "timeout";
pub const REASON_AGENT_RESTARTED: &str = "agent restarted while running";

/// 进程退出码
///
/// 安装器和编排系统依赖这些数值，不可修改。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    IpMismatch = 2,
    ServerListenFailed = 3,
    DatabaseStartFailed = 4,
    InvalidIdentity = 5,
    NotClusterAgent = 6,
    WrongPassword = 7,
    TakeOverFailed = 8,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn describe(self) -> &'static str {
        match self {
            ExitCode::IpMismatch => "IP与持久化的代理信息不一致",
            ExitCode::ServerListenFailed => "服务端口监听失败",
            ExitCode::DatabaseStartFailed => "集群数据库不可用",
            ExitCode::InvalidIdentity => "代理身份无效",
            ExitCode::NotClusterAgent => "当前代理不属于集群",
            ExitCode::WrongPassword => "数据库密码错误",
            ExitCode::TakeOverFailed => "接管集群失败",
        }
    }
}

/// 启动路径上的致命错误：记录日志后以固定退出码退出
pub fn exit_with_failure(code: ExitCode, msg: impl std::fmt::Display) -> ! {
    tracing::error!(exit_code = code.code(), "{}: {}", code.describe(), msg);
    eprintln!("{}: {}", code.describe(), msg);
    std::process::exit(code.code())
}
