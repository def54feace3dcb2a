use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use agent_core::{AgentError, AgentResult};
use agent_domain::{
    AgentInstance, AgentKey, AllAgentsSyncData, CancelSubTask, ClusterAttachParam,
    JoinMasterParam, MaintainerView, PeerClient, RemoteLog, RemoteSubTask, SubTaskAccepted,
    SubTaskUpdate,
};

use crate::metrics::record_rpc_error;

pub const RPC_PREFIX: &str = "/rpc/v1";

/// 成功响应信封，与API层的 `ApiResponse` 对应
#[derive(Debug, Deserialize)]
struct RpcEnvelope<T> {
    #[allow(dead_code)]
    success: bool,
    data: Option<T>,
}

/// 错误响应体
#[derive(Debug, Default, Deserialize)]
struct RpcErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    details: Option<serde_json::Value>,
}

/// 基于HTTP的代理间RPC客户端
#[derive(Clone)]
pub struct HttpPeerClient {
    http_client: reqwest::Client,
}

impl HttpPeerClient {
    pub fn new(timeout: Duration) -> AgentResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self { http_client })
    }

    async fn call<B, T>(
        &self,
        method: Method,
        target: &AgentKey,
        path: &'static str,
        body: Option<&B>,
    ) -> AgentResult<Option<T>>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        let url = format!("{}{}{}", target.base_url(), RPC_PREFIX, path);
        let mut request = self.http_client.request(method.clone(), &url);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                record_rpc_error(path);
                debug!("RPC请求失败: {} {} - {}", method, url, e);
                return Err(e.into());
            }
        };

        let status = response.status();
        if status.is_success() {
            let envelope: RpcEnvelope<T> = response.json().await?;
            return Ok(envelope.data);
        }

        record_rpc_error(path);
        let text = response.text().await.unwrap_or_default();
        let err = error_from_response(status, &text);
        if !matches!(err, AgentError::ConflictingState(_)) {
            warn!("RPC请求被拒绝: {} {} - HTTP {} {}", method, url, status, err);
        }
        Err(err)
    }

    async fn call_required<B, T>(
        &self,
        method: Method,
        target: &AgentKey,
        path: &'static str,
        body: Option<&B>,
    ) -> AgentResult<T>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        self.call(method, target, path, body)
            .await?
            .ok_or_else(|| AgentError::Network(format!("对端 {target} 的响应缺少数据: {path}")))
    }

    async fn call_empty<B>(
        &self,
        method: Method,
        target: &AgentKey,
        path: &'static str,
        body: Option<&B>,
    ) -> AgentResult<()>
    where
        B: Serialize + ?Sized + Sync,
    {
        self.call::<B, serde_json::Value>(method, target, path, body)
            .await
            .map(|_| ())
    }
}

/// 把对端的错误响应还原为 [`AgentError`]，409 一律视为状态冲突
fn error_from_response(status: StatusCode, text: &str) -> AgentError {
    let body: RpcErrorBody = serde_json::from_str(text).unwrap_or_else(|_| RpcErrorBody {
        message: text.to_string(),
        ..RpcErrorBody::default()
    });
    let message = body.message;

    if status == StatusCode::CONFLICT {
        if body.code == "WRONG_IDENTITY" {
            return wrong_identity(body.details.as_ref(), message);
        }
        return AgentError::ConflictingState(message);
    }

    match body.code.as_str() {
        "WRONG_IDENTITY" => wrong_identity(body.details.as_ref(), message),
        "UNKNOWN_TASK_KIND" => AgentError::UnknownTaskKind(message),
        "INVALID_PARAM" => AgentError::InvalidParam(message),
        "NOT_FOUND" => AgentError::NotFound {
            entity: "远程资源",
            id: message,
        },
        "STORE_UNAVAILABLE" | "DATABASE_ERROR" => AgentError::StoreUnavailable(message),
        "TIMEOUT" => AgentError::Timeout(message),
        _ if status == StatusCode::SERVICE_UNAVAILABLE => AgentError::StoreUnavailable(message),
        _ => AgentError::Network(format!("HTTP {status}: {message}")),
    }
}

fn wrong_identity(details: Option<&serde_json::Value>, message: String) -> AgentError {
    let field = |name: &str| {
        details
            .and_then(|d| d.get(name))
            .and_then(|v| v.as_str())
            .map(str::to_string)
    };
    match (field("current"), field("expected")) {
        (Some(current), Some(expected)) => AgentError::WrongIdentity { current, expected },
        _ => AgentError::WrongIdentity {
            current: "UNKNOWN".to_string(),
            expected: message,
        },
    }
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn submit_sub_task(&self, target: &AgentKey, task: &RemoteSubTask) -> AgentResult<i64> {
        let accepted: SubTaskAccepted = self
            .call_required(Method::POST, target, "/task/sub_task", Some(task))
            .await?;
        Ok(accepted.task_id)
    }

    async fn update_sub_task(&self, target: &AgentKey, update: &SubTaskUpdate) -> AgentResult<()> {
        self.call_empty(Method::PATCH, target, "/task/sub_task", Some(update))
            .await
    }

    async fn cancel_sub_task(&self, target: &AgentKey, cancel: &CancelSubTask) -> AgentResult<()> {
        self.call_empty(Method::DELETE, target, "/task/sub_task", Some(cancel))
            .await
    }

    async fn push_log(&self, target: &AgentKey, log: &RemoteLog) -> AgentResult<()> {
        self.call_empty(Method::POST, target, "/task/log", Some(log))
            .await
    }

    async fn get_maintainer(&self, target: &AgentKey) -> AgentResult<MaintainerView> {
        self.call_required::<(), _>(Method::GET, target, "/maintainer", None)
            .await
    }

    async fn push_agents(&self, target: &AgentKey, data: &AllAgentsSyncData) -> AgentResult<()> {
        self.call_empty(Method::POST, target, "/maintainer/update", Some(data))
            .await
    }

    async fn join_master(
        &self,
        target: &AgentKey,
        param: &JoinMasterParam,
    ) -> AgentResult<AgentInstance> {
        self.call_required(Method::POST, target, "/agent/join", Some(param))
            .await
    }

    async fn attach_cluster(
        &self,
        target: &AgentKey,
        param: &ClusterAttachParam,
    ) -> AgentResult<()> {
        self.call_empty(Method::POST, target, "/agent/cluster", Some(param))
            .await
    }
}
