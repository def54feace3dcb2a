//! 代理间RPC
//!
//! 请求与响应的结构和 `HttpPeerClient` 一一对应，错误按 [`crate::error::ApiError`]
//! 的错误码返回，对端据此还原为同一种错误。

use axum::{
    extract::{rejection::JsonRejection, State},
    Json,
};

use agent_domain::{
    AgentInstance, AllAgentsSyncData, CancelSubTask, ClusterAttachParam, JoinMasterParam,
    MaintainerView, RemoteLog, RemoteSubTask, SubTaskAccepted, SubTaskUpdate,
};

use crate::error::ApiResult;
use crate::response::ApiResponse;
use crate::routes::AppState;

/// 接收集群子任务
pub async fn submit_sub_task(
    State(state): State<AppState>,
    payload: Result<Json<RemoteSubTask>, JsonRejection>,
) -> ApiResult<ApiResponse<SubTaskAccepted>> {
    let Json(remote) = payload?;
    let task_id = state.engine.accept_sub_task(&remote).await?;
    Ok(ApiResponse::success(SubTaskAccepted { task_id }))
}

/// 执行代理上报状态，只有维护者会收到
pub async fn update_sub_task(
    State(state): State<AppState>,
    payload: Result<Json<SubTaskUpdate>, JsonRejection>,
) -> ApiResult<ApiResponse<()>> {
    let Json(update) = payload?;
    state.engine.update_sub_task(&update).await?;
    Ok(ApiResponse::success_empty())
}

pub async fn cancel_sub_task(
    State(state): State<AppState>,
    payload: Result<Json<CancelSubTask>, JsonRejection>,
) -> ApiResult<ApiResponse<()>> {
    let Json(cancel) = payload?;
    state.engine.cancel_sub_task(&cancel).await?;
    Ok(ApiResponse::success_empty())
}

pub async fn push_log(
    State(state): State<AppState>,
    payload: Result<Json<RemoteLog>, JsonRejection>,
) -> ApiResult<ApiResponse<()>> {
    let Json(log) = payload?;
    state.engine.append_remote_log(&log).await?;
    Ok(ApiResponse::success_empty())
}

pub async fn get_maintainer(State(state): State<AppState>) -> ApiResult<ApiResponse<MaintainerView>> {
    Ok(ApiResponse::success(state.engine.maintainer_view()))
}

/// 维护者下发的成员快照
pub async fn update_agents(
    State(state): State<AppState>,
    payload: Result<Json<AllAgentsSyncData>, JsonRejection>,
) -> ApiResult<ApiResponse<bool>> {
    let Json(data) = payload?;
    let applied = state.engine.apply_agents(&data).await?;
    Ok(ApiResponse::success(applied))
}

/// 跟随者请求加入，返回主代理自身的信息
pub async fn join_master(
    State(state): State<AppState>,
    payload: Result<Json<JoinMasterParam>, JsonRejection>,
) -> ApiResult<ApiResponse<AgentInstance>> {
    let Json(param) = payload?;
    let master = state.engine.join_master(param).await?;
    Ok(ApiResponse::success(master))
}

pub async fn attach_cluster(
    State(state): State<AppState>,
    payload: Result<Json<ClusterAttachParam>, JsonRejection>,
) -> ApiResult<ApiResponse<()>> {
    let Json(param) = payload?;
    state.engine.attach_cluster(param).await?;
    Ok(ApiResponse::success_empty())
}
