use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use agent_dispatcher::Engine;

use crate::handlers::{agent, health::health_check, rpc, task};
use crate::middleware::{request_logging, trace_layer};

/// API应用状态
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

/// 创建API路由
pub fn create_routes(state: AppState) -> Router {
    Router::new()
        // 健康检查
        .route("/health", get(health_check))
        // 运维接口
        .route("/api/v1/status", get(agent::get_status))
        .route("/api/v1/agent", get(agent::get_agent))
        .route("/api/v1/agents", get(agent::list_agents))
        .route("/api/v1/agent/join/self", post(agent::join_self))
        .route("/api/v1/agent/join", post(agent::join_master))
        .route("/api/v1/agent/leave", post(agent::leave_cluster))
        .route("/api/v1/cluster/init", post(agent::init_cluster))
        .route("/api/v1/task/dags", get(task::list_dags))
        .route(
            "/api/v1/task/dag/{generic_id}",
            get(task::get_dag).patch(task::set_dag_operator),
        )
        .route(
            "/api/v1/task/sub_task/{scope}/{id}/logs",
            get(task::sub_task_logs),
        )
        // 代理间RPC
        .route(
            "/rpc/v1/task/sub_task",
            post(rpc::submit_sub_task)
                .patch(rpc::update_sub_task)
                .delete(rpc::cancel_sub_task),
        )
        .route("/rpc/v1/task/log", post(rpc::push_log))
        .route("/rpc/v1/maintainer", get(rpc::get_maintainer))
        .route("/rpc/v1/maintainer/update", post(rpc::update_agents))
        .route("/rpc/v1/agent/join", post(rpc::join_master))
        .route("/rpc/v1/agent/cluster", post(rpc::attach_cluster))
        .layer(middleware::from_fn(request_logging))
        .layer(trace_layer())
        .with_state(state)
}
