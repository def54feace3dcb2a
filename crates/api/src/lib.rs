//! # Agent API
//!
//! 节点控制代理的HTTP接口，基于Axum构建，包含两部分：
//!
//! ## 运维接口（`/api/v1`）
//! - `GET /api/v1/status` - 身份、协调器角色与维护者
//! - `GET /api/v1/agent`、`GET /api/v1/agents` - 自身信息与成员表
//! - `POST /api/v1/agent/join/self`、`POST /api/v1/agent/join` - 自举为主代理或加入主代理
//! - `POST /api/v1/cluster/init`、`POST /api/v1/agent/leave` - 初始化或离开集群
//! - `GET /api/v1/task/dags?scope=local|cluster` - 未完成的DAG
//! - `GET|PATCH /api/v1/task/dag/{generic_id}` - DAG详情与操作
//! - `GET /api/v1/task/sub_task/{scope}/{id}/logs` - 子任务日志
//!
//! ## 代理间RPC（`/rpc/v1`）
//! 集群子任务的投递、状态上报、取消与日志转发，维护者查询，成员快照下发，
//! 以及加入主代理和接入集群存储。
//!
//! 成功响应统一为 `{success, data, message, timestamp}`，
//! 错误响应为 `{code, message, details?}`。

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod response;
pub mod routes;

pub use error::{ApiError, ApiResult};
pub use middleware::cors_layer;
pub use response::ApiResponse;
pub use routes::{create_routes, AppState};
