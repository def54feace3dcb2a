use thiserror::Error;

/// 代理错误类型定义
///
/// 按处理策略分为四类：
/// - 瞬时错误（存储不可用、网络、超时）：调度器在下一个周期重试
/// - 前置条件错误（身份不符、状态冲突、未知任务类型）：直接返回给调用方
/// - 任务执行错误（执行失败、取消、panic）：记录为子任务失败
/// - 其余为内部错误
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("存储不可用: {0}")]
    StoreUnavailable(String),

    #[error("网络错误: {0}")]
    Network(String),

    #[error("操作超时: {0}")]
    Timeout(String),

    #[error("身份不符: 当前为 {current}, 需要 {expected}")]
    WrongIdentity { current: String, expected: String },

    #[error("状态冲突: {0}")]
    ConflictingState(String),

    #[error("未知的任务类型: {0}")]
    UnknownTaskKind(String),

    #[error("任务类型重复注册: {0}")]
    DuplicateTaskKind(String),

    #[error("参数无效: {0}")]
    InvalidParam(String),

    #[error("{entity}不存在: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("任务执行错误: {0}")]
    TaskExecution(String),

    #[error("任务已取消")]
    Cancelled,

    #[error("任务执行发生panic: {0}")]
    Panicked(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 统一的Result类型
pub type AgentResult<T> = std::result::Result<T, AgentError>;

impl AgentError {
    pub fn conflict<S: Into<String>>(msg: S) -> Self {
        Self::ConflictingState(msg.into())
    }

    pub fn invalid_param<S: Into<String>>(msg: S) -> Self {
        Self::InvalidParam(msg.into())
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn wrong_identity(current: impl ToString, expected: impl ToString) -> Self {
        Self::WrongIdentity {
            current: current.to_string(),
            expected: expected.to_string(),
        }
    }

    pub fn execution<S: Into<String>>(msg: S) -> Self {
        Self::TaskExecution(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// 瞬时错误：下一个周期重试即可
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AgentError::Database(_)
                | AgentError::StoreUnavailable(_)
                | AgentError::Network(_)
                | AgentError::Timeout(_)
        )
    }

    /// 前置条件错误：报告给调用方，不做循环重试
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            AgentError::WrongIdentity { .. }
                | AgentError::ConflictingState(_)
                | AgentError::UnknownTaskKind(_)
                | AgentError::DuplicateTaskKind(_)
                | AgentError::InvalidParam(_)
                | AgentError::NotFound { .. }
        )
    }

    /// REST错误信封中使用的稳定错误码
    pub fn code(&self) -> &'static str {
        match self {
            AgentError::Database(_) => "DATABASE_ERROR",
            AgentError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            AgentError::Network(_) => "NETWORK_ERROR",
            AgentError::Timeout(_) => "TIMEOUT",
            AgentError::WrongIdentity { .. } => "WRONG_IDENTITY",
            AgentError::ConflictingState(_) => "CONFLICTING_STATE",
            AgentError::UnknownTaskKind(_) => "UNKNOWN_TASK_KIND",
            AgentError::DuplicateTaskKind(_) => "DUPLICATE_TASK_KIND",
            AgentError::InvalidParam(_) => "INVALID_PARAM",
            AgentError::NotFound { .. } => "NOT_FOUND",
            AgentError::TaskExecution(_) => "TASK_EXECUTION_FAILED",
            AgentError::Cancelled => "CANCELLED",
            AgentError::Panicked(_) => "PANICKED",
            AgentError::Serialization(_) => "SERIALIZATION_ERROR",
            AgentError::Configuration(_) => "CONFIGURATION_ERROR",
            AgentError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(err: serde_json::Error) -> Self {
        AgentError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for AgentError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AgentError::Timeout(err.to_string())
        } else {
            AgentError::Network(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(AgentError::Network("connection refused".into()).is_retryable());
        assert!(AgentError::StoreUnavailable("cluster".into()).is_retryable());
        assert!(!AgentError::conflict("READY -> RUNNING").is_retryable());

        assert!(AgentError::conflict("x").is_precondition());
        assert!(AgentError::UnknownTaskKind("foo".into()).is_precondition());
        assert!(!AgentError::Cancelled.is_precondition());
    }

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(AgentError::not_found("DAG", 3).code(), "NOT_FOUND");
        assert_eq!(
            AgentError::wrong_identity("SINGLE", "MASTER").code(),
            "WRONG_IDENTITY"
        );
        assert_eq!(AgentError::Cancelled.code(), "CANCELLED");
    }

    #[test]
    fn test_serde_error_conversion() {
        let err: AgentError = serde_json::from_str::<i64>("not a number")
            .unwrap_err()
            .into();
        assert!(matches!(err, AgentError::Serialization(_)));
    }
}
