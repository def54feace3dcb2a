use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::context::TaskContext;
use agent_core::{AgentError, AgentResult};

/// 当前OS时间（毫秒）
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

macro_rules! string_enum {
    ($name:ident, $label:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = AgentError;

            fn from_str(s: &str) -> AgentResult<Self> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(AgentError::invalid_param(format!(
                        "无效的{}: {}",
                        $label, other
                    ))),
                }
            }
        }
    };
}

/// 任务状态，DAG、节点、子任务共用
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Ready,
    Running,
    Failed,
    Succeed,
    /// 回滚时使用的终态，等同于成功
    Pass,
}

string_enum!(TaskState, "任务状态" {
    Pending => "PENDING",
    Ready => "READY",
    Running => "RUNNING",
    Failed => "FAILED",
    Succeed => "SUCCEED",
    Pass => "PASS",
});

impl TaskState {
    pub fn is_finished(&self) -> bool {
        matches!(self, TaskState::Failed | TaskState::Succeed | TaskState::Pass)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskState::Succeed | TaskState::Pass)
    }

    pub fn is_unfinished(&self) -> bool {
        !self.is_finished()
    }
}

/// 作用于节点/子任务的意图
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operator {
    Run,
    Rollback,
    Retry,
    Cancel,
}

string_enum!(Operator, "操作类型" {
    Run => "RUN",
    Rollback => "ROLLBACK",
    Retry => "RETRY",
    Cancel => "CANCEL",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DagType {
    Local,
    Cluster,
    Obproxy,
}

string_enum!(DagType, "DAG类型" {
    Local => "local",
    Cluster => "cluster",
    Obproxy => "obproxy",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    /// 子任务按顺序执行
    Normal,
    /// 子任务同时执行，互相之间没有顺序保证
    Parallel,
}

string_enum!(NodeType, "节点类型" {
    Normal => "normal",
    Parallel => "parallel",
});

/// 任务所在的存储
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreScope {
    Local,
    Cluster,
}

string_enum!(StoreScope, "存储范围" {
    Local => "local",
    Cluster => "cluster",
});

impl StoreScope {
    fn prefix(&self) -> &'static str {
        match self {
            StoreScope::Local => "l",
            StoreScope::Cluster => "c",
        }
    }
}

/// 对外暴露的DAG标识：`l-<id>` 或 `c-<id>`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenericId {
    pub scope: StoreScope,
    pub id: i64,
}

impl GenericId {
    pub fn new(scope: StoreScope, id: i64) -> Self {
        Self { scope, id }
    }
}

impl fmt::Display for GenericId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.scope.prefix(), self.id)
    }
}

impl FromStr for GenericId {
    type Err = AgentError;

    fn from_str(s: &str) -> AgentResult<Self> {
        let (prefix, id) = s
            .split_once('-')
            .ok_or_else(|| AgentError::invalid_param(format!("无效的DAG标识: {s}")))?;
        let scope = match prefix {
            "l" => StoreScope::Local,
            "c" => StoreScope::Cluster,
            _ => return Err(AgentError::invalid_param(format!("无效的DAG标识: {s}"))),
        };
        let id = id
            .parse::<i64>()
            .map_err(|_| AgentError::invalid_param(format!("无效的DAG标识: {s}")))?;
        Ok(GenericId { scope, id })
    }
}

/// 代理地址，(ip, port) 唯一确定一个代理
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentKey {
    pub ip: String,
    pub port: u16,
}

impl AgentKey {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ip.is_empty()
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.ip, self.port)
    }
}

impl fmt::Display for AgentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// 代理在集群中的身份
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING-KEBAB-CASE")]
pub enum AgentIdentity {
    Unidentified,
    Single,
    Master,
    Follower,
    Cluster,
    TakeOver,
    ScalingOut,
}

string_enum!(AgentIdentity, "代理身份" {
    Unidentified => "UNIDENTIFIED",
    Single => "SINGLE",
    Master => "MASTER",
    Follower => "FOLLOWER",
    Cluster => "CLUSTER",
    TakeOver => "TAKE-OVER",
    ScalingOut => "SCALING-OUT",
});

impl AgentIdentity {
    /// 身份只能沿固定的边迁移
    pub fn can_transit_to(&self, to: AgentIdentity) -> bool {
        use AgentIdentity::*;
        matches!(
            (self, to),
            (Unidentified, Single)
                | (Unidentified, TakeOver)
                | (Single, Master)
                | (Single, Follower)
                | (Single, ScalingOut)
                | (Master, Cluster)
                | (Master, Single)
                | (Follower, Cluster)
                | (Follower, Single)
                | (ScalingOut, Cluster)
                | (ScalingOut, Single)
                | (TakeOver, Cluster)
                | (TakeOver, Single)
                | (Cluster, Single)
        )
    }

    /// 拥有集群存储的身份
    pub fn is_cluster(&self) -> bool {
        matches!(self, AgentIdentity::Cluster)
    }
}

/// 代理信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInstance {
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub zone: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub home_path: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    pub public_key: String,
    pub identity: AgentIdentity,
    /// 仅FOLLOWER/CLUSTER代理的自身记录中存在
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master: Option<AgentKey>,
}

impl AgentInstance {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
            zone: String::new(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            home_path: String::new(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            public_key: String::new(),
            identity: AgentIdentity::Unidentified,
            master: None,
        }
    }

    pub fn key(&self) -> AgentKey {
        AgentKey::new(self.ip.clone(), self.port)
    }
}

/// 维护者租约记录，集群内唯一（id = 1）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintainerRecord {
    pub ip: String,
    pub port: u16,
    pub counter: i64,
    /// 数据库时钟下的最近续约时间
    pub active_time: i64,
    /// 持有者本地时钟下的最近续约时间
    pub agent_time: i64,
    /// 读取记录时数据库的当前时间
    pub now: i64,
}

impl MaintainerRecord {
    pub fn holder(&self) -> Option<AgentKey> {
        if self.ip.is_empty() {
            None
        } else {
            Some(AgentKey::new(self.ip.clone(), self.port))
        }
    }

    pub fn is_active(&self, max_active_ms: i64) -> bool {
        self.holder().is_some() && self.now - self.active_time < max_active_ms
    }
}

/// 子任务能力标记，模板构建时由任务类型决定并持久化
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCapabilities {
    pub can_cancel: bool,
    pub can_continue: bool,
    pub can_pass: bool,
    pub can_retry: bool,
    pub can_rollback: bool,
}

impl Default for TaskCapabilities {
    fn default() -> Self {
        Self {
            can_cancel: true,
            can_continue: false,
            can_pass: false,
            can_retry: true,
            can_rollback: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagInstance {
    pub id: i64,
    pub name: String,
    pub dag_type: DagType,
    pub state: TaskState,
    pub operator: Operator,
    pub maintenance: bool,
    pub context: TaskContext,
    pub start_time: i64,
    pub end_time: i64,
    pub create_time: i64,
}

impl DagInstance {
    pub fn is_finished(&self) -> bool {
        self.state.is_finished()
    }

    pub fn scope(&self) -> StoreScope {
        match self.dag_type {
            DagType::Local => StoreScope::Local,
            DagType::Cluster | DagType::Obproxy => StoreScope::Cluster,
        }
    }

    pub fn generic_id(&self) -> GenericId {
        GenericId::new(self.scope(), self.id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInstance {
    pub id: i64,
    pub dag_id: i64,
    pub seq: i64,
    pub name: String,
    pub node_type: NodeType,
    pub state: TaskState,
    pub operator: Operator,
    /// 非空时子任务按代理扇出，每个代理一个子任务
    pub execute_agents: Vec<AgentKey>,
    pub context: TaskContext,
    pub start_time: i64,
    pub end_time: i64,
}

impl NodeInstance {
    pub fn is_fan_out(&self) -> bool {
        !self.execute_agents.is_empty()
    }

    /// 回滚完成：从未开始（PASS）或已在ROLLBACK下成功
    pub fn is_rolled_back(&self) -> bool {
        self.state == TaskState::Pass
            || (self.state == TaskState::Succeed && self.operator == Operator::Rollback)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTaskInstance {
    pub id: i64,
    pub dag_id: i64,
    pub node_id: i64,
    pub seq: i64,
    pub kind: String,
    pub name: String,
    pub state: TaskState,
    pub operator: Operator,
    pub execute_agent: AgentKey,
    pub execute_times: i64,
    pub capabilities: TaskCapabilities,
    pub timeout_ms: i64,
    pub context: TaskContext,
    pub start_time: i64,
    pub end_time: i64,
}

impl SubTaskInstance {
    /// 是否已经被执行器启动过，start_time 只在启动时写入
    pub fn has_run(&self) -> bool {
        self.start_time > 0
    }

    pub fn is_timeout(&self, now: i64) -> bool {
        self.state == TaskState::Running
            && self.start_time > 0
            && self.timeout_ms > 0
            && now - self.start_time > self.timeout_ms
    }

    pub fn is_rolled_back(&self) -> bool {
        self.state == TaskState::Pass
            || (self.state == TaskState::Succeed && self.operator == Operator::Rollback)
    }

    pub fn to_remote(&self) -> RemoteSubTask {
        RemoteSubTask {
            remote_task_id: self.id,
            kind: self.kind.clone(),
            name: self.name.clone(),
            context: self.context.clone(),
            state: self.state,
            operator: self.operator,
            capabilities: self.capabilities,
            execute_times: self.execute_times,
            execute_agent: self.execute_agent.clone(),
            timeout_ms: self.timeout_ms,
            start_time: self.start_time,
            end_time: self.end_time,
        }
    }
}

/// 集群子任务在本地的映射
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMapping {
    pub local_task_id: i64,
    pub remote_task_id: i64,
    pub execute_times: i64,
    /// 为true表示集群已经知道本地执行结果
    pub sync_flag: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTaskLog {
    pub id: i64,
    pub sub_task_id: i64,
    pub execute_times: i64,
    pub content: String,
    pub create_time: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDetail {
    #[serde(flatten)]
    pub node: NodeInstance,
    pub sub_tasks: Vec<SubTaskInstance>,
}

/// DAG详情：DAG + 节点 + 子任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagDetail {
    pub generic_id: String,
    #[serde(flatten)]
    pub dag: DagInstance,
    pub nodes: Vec<NodeDetail>,
}

// ---------------------------------------------------------------------------
// 代理间RPC载荷
// ---------------------------------------------------------------------------

/// 启动/恢复远程子任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSubTask {
    pub remote_task_id: i64,
    pub kind: String,
    pub name: String,
    pub context: TaskContext,
    pub state: TaskState,
    pub operator: Operator,
    pub capabilities: TaskCapabilities,
    pub execute_times: i64,
    pub execute_agent: AgentKey,
    pub timeout_ms: i64,
    pub start_time: i64,
    pub end_time: i64,
}

/// 执行代理向集群上报子任务状态
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTaskUpdate {
    pub remote_task_id: i64,
    pub execute_times: i64,
    pub operator: Operator,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<TaskContext>,
    pub agent: AgentKey,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelSubTask {
    pub remote_task_id: i64,
    pub execute_times: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteLog {
    pub remote_task_id: i64,
    pub execute_times: i64,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTaskAccepted {
    pub task_id: i64,
}

/// 维护者下发的全量成员快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllAgentsSyncData {
    pub maintainer: AgentKey,
    pub agents: Vec<AgentInstance>,
    pub last_sync_time: i64,
}

/// 加入主代理的请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinMasterParam {
    pub agent: AgentInstance,
    #[serde(default)]
    pub token: String,
}

/// 要求跟随者接入集群存储
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterAttachParam {
    pub database_url: String,
}
