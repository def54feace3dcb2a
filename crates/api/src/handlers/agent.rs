//! 代理与集群成员管理接口
//!
//! 加入、初始化与离开都以本地DAG执行，接口立即返回DAG详情，调用方轮询
//! `GET /api/v1/task/dag/{generic_id}` 查看进度。

use axum::{
    extract::{rejection::JsonRejection, State},
    Json,
};
use serde::Deserialize;

use agent_dispatcher::AgentStatus;
use agent_domain::{AgentInstance, DagDetail};

use crate::error::ApiResult;
use crate::response::ApiResponse;
use crate::routes::AppState;

#[derive(Debug, Deserialize)]
pub struct JoinSelfRequest {
    pub zone: String,
}

#[derive(Debug, Deserialize)]
pub struct JoinMasterRequest {
    pub master_ip: String,
    pub master_port: u16,
    pub zone: String,
}

#[derive(Debug, Deserialize)]
pub struct InitClusterRequest {
    pub database_url: String,
}

pub async fn get_status(State(state): State<AppState>) -> ApiResult<ApiResponse<AgentStatus>> {
    Ok(ApiResponse::success(state.engine.status().await))
}

pub async fn get_agent(State(state): State<AppState>) -> ApiResult<ApiResponse<AgentInstance>> {
    Ok(ApiResponse::success(state.engine.agents().current().await))
}

pub async fn list_agents(
    State(state): State<AppState>,
) -> ApiResult<ApiResponse<Vec<AgentInstance>>> {
    Ok(ApiResponse::success(state.engine.list_agents().await?))
}

pub async fn join_self(
    State(state): State<AppState>,
    payload: Result<Json<JoinSelfRequest>, JsonRejection>,
) -> ApiResult<ApiResponse<DagDetail>> {
    let Json(request) = payload?;
    let detail = state.engine.agents().join_self(request.zone).await?;
    Ok(ApiResponse::success(detail))
}

pub async fn join_master(
    State(state): State<AppState>,
    payload: Result<Json<JoinMasterRequest>, JsonRejection>,
) -> ApiResult<ApiResponse<DagDetail>> {
    let Json(request) = payload?;
    let detail = state
        .engine
        .agents()
        .join_master(request.master_ip, request.master_port, request.zone)
        .await?;
    Ok(ApiResponse::success(detail))
}

pub async fn init_cluster(
    State(state): State<AppState>,
    payload: Result<Json<InitClusterRequest>, JsonRejection>,
) -> ApiResult<ApiResponse<DagDetail>> {
    let Json(request) = payload?;
    let detail = state
        .engine
        .agents()
        .init_cluster(request.database_url)
        .await?;
    Ok(ApiResponse::success(detail))
}

pub async fn leave_cluster(State(state): State<AppState>) -> ApiResult<ApiResponse<DagDetail>> {
    let detail = state.engine.agents().leave_cluster().await?;
    Ok(ApiResponse::success(detail))
}
