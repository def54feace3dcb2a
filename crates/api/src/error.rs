use axum::{
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::{error, warn};

use agent_core::AgentError;

/// API错误
///
/// 响应体为 `{code, message, details?}`，对端的RPC客户端按 `code` 还原错误类型。
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error("请求参数错误: {0}")]
    BadRequest(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

fn status_of(err: &AgentError) -> StatusCode {
    match err {
        AgentError::WrongIdentity { .. } | AgentError::ConflictingState(_) => StatusCode::CONFLICT,
        AgentError::InvalidParam(_)
        | AgentError::UnknownTaskKind(_)
        | AgentError::DuplicateTaskKind(_)
        | AgentError::Serialization(_) => StatusCode::BAD_REQUEST,
        AgentError::NotFound { .. } => StatusCode::NOT_FOUND,
        AgentError::Database(_)
        | AgentError::StoreUnavailable(_)
        | AgentError::Network(_)
        | AgentError::Timeout(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ApiError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                json!({ "code": "BAD_REQUEST", "message": msg }),
            ),
            ApiError::Agent(err) => {
                let status = status_of(err);
                let mut body = json!({ "code": err.code(), "message": err.to_string() });
                match err {
                    AgentError::WrongIdentity { current, expected } => {
                        body["details"] = json!({ "current": current, "expected": expected });
                    }
                    // 对端据此区分冲突的具体原因
                    AgentError::ConflictingState(msg) => {
                        body["message"] = json!(msg);
                    }
                    AgentError::NotFound { entity, id } => {
                        body["details"] = json!({ "entity": entity, "id": id });
                    }
                    _ => {}
                }
                (status, body)
            }
        };

        if status.is_server_error() {
            error!(status = status.as_u16(), "请求处理失败: {}", self);
        } else {
            warn!(status = status.as_u16(), "请求被拒绝: {}", self);
        }
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_wrong_identity_carries_details() {
        let response = ApiError::from(AgentError::wrong_identity("SINGLE", "MASTER")).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let body = body_json(response).await;
        assert_eq!(body["code"], "WRONG_IDENTITY");
        assert_eq!(body["details"]["current"], "SINGLE");
        assert_eq!(body["details"]["expected"], "MASTER");
    }

    #[tokio::test]
    async fn test_conflict_message_is_raw() {
        let response = ApiError::from(AgentError::conflict("execute_times 已过期")).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(body_json(response).await["message"], "execute_times 已过期");
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_of(&AgentError::invalid_param("x")),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(&AgentError::not_found("DAG", "l-1")),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(&AgentError::StoreUnavailable("未接入".to_string())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(&AgentError::internal("boom")),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
