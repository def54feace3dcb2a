use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path, Query, State,
    },
    Json,
};
use serde::Deserialize;

use agent_domain::{DagDetail, DagInstance, GenericId, Operator, StoreScope, SubTaskLog};

use crate::error::ApiResult;
use crate::response::ApiResponse;
use crate::routes::AppState;

#[derive(Debug, Deserialize)]
pub struct DagQuery {
    pub scope: Option<StoreScope>,
}

#[derive(Debug, Deserialize)]
pub struct DagOperatorRequest {
    pub operator: Operator,
}

/// 未完成的DAG，默认查询本地存储
pub async fn list_dags(
    State(state): State<AppState>,
    query: Result<Query<DagQuery>, QueryRejection>,
) -> ApiResult<ApiResponse<Vec<DagInstance>>> {
    let Query(query) = query?;
    let scope = query.scope.unwrap_or(StoreScope::Local);
    let dags = state.engine.controller().list_unfinished(scope).await?;
    Ok(ApiResponse::success(dags))
}

pub async fn get_dag(
    State(state): State<AppState>,
    Path(generic_id): Path<String>,
) -> ApiResult<ApiResponse<DagDetail>> {
    let id: GenericId = generic_id.parse()?;
    let detail = state.engine.controller().get_detail(id).await?;
    Ok(ApiResponse::success(detail))
}

/// 设置DAG的操作类型：CANCEL、RETRY 或 ROLLBACK
pub async fn set_dag_operator(
    State(state): State<AppState>,
    Path(generic_id): Path<String>,
    payload: Result<Json<DagOperatorRequest>, JsonRejection>,
) -> ApiResult<ApiResponse<DagDetail>> {
    let id: GenericId = generic_id.parse()?;
    let Json(request) = payload?;
    let detail = state
        .engine
        .controller()
        .set_operator(id, request.operator)
        .await?;
    Ok(ApiResponse::success(detail))
}

pub async fn sub_task_logs(
    State(state): State<AppState>,
    path: Result<Path<(StoreScope, i64)>, PathRejection>,
) -> ApiResult<ApiResponse<Vec<SubTaskLog>>> {
    let Path((scope, id)) = path?;
    let logs = state.engine.controller().sub_task_logs(scope, id).await?;
    Ok(ApiResponse::success(logs))
}
