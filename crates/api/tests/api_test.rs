use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;

use agent_api::{create_routes, AppState};
use agent_core::config::{ClusterStoreConfig, CoordinatorConfig, ExecutorConfig, SchedulerConfig};
use agent_core::{AgentError, AgentResult};
use agent_dispatcher::{Engine, EngineDeps};
use agent_domain::{
    AgentIdentity, AgentInstance, AgentKey, AllAgentsSyncData, CancelSubTask,
    ClusterAttachParam, IdentityManager, JoinMasterParam, LocalStores, MaintainerView,
    PeerClient, RemoteLog, RemoteSubTask, StoreScope, SubTaskUpdate, TaskRegistry,
};
use agent_infrastructure::{DatabaseManager, SqlClusterConnector};

/// 所有对端都不可达
struct NoPeers;

fn unreachable(target: &AgentKey) -> AgentError {
    AgentError::Network(format!("{target} 不可达"))
}

#[async_trait]
impl PeerClient for NoPeers {
    async fn submit_sub_task(&self, target: &AgentKey, _task: &RemoteSubTask) -> AgentResult<i64> {
        Err(unreachable(target))
    }

    async fn update_sub_task(&self, target: &AgentKey, _update: &SubTaskUpdate) -> AgentResult<()> {
        Err(unreachable(target))
    }

    async fn cancel_sub_task(&self, target: &AgentKey, _cancel: &CancelSubTask) -> AgentResult<()> {
        Err(unreachable(target))
    }

    async fn push_log(&self, target: &AgentKey, _log: &RemoteLog) -> AgentResult<()> {
        Err(unreachable(target))
    }

    async fn get_maintainer(&self, target: &AgentKey) -> AgentResult<MaintainerView> {
        Err(unreachable(target))
    }

    async fn push_agents(&self, target: &AgentKey, _data: &AllAgentsSyncData) -> AgentResult<()> {
        Err(unreachable(target))
    }

    async fn join_master(
        &self,
        target: &AgentKey,
        _param: &JoinMasterParam,
    ) -> AgentResult<AgentInstance> {
        Err(unreachable(target))
    }

    async fn attach_cluster(&self, target: &AgentKey, _param: &ClusterAttachParam) -> AgentResult<()> {
        Err(unreachable(target))
    }
}

async fn create_test_app() -> (Router, Arc<Engine>) {
    let manager = DatabaseManager::connect("sqlite::memory:", 1, Duration::from_secs(5))
        .await
        .unwrap();
    manager.init_schema(StoreScope::Local).await.unwrap();
    let local = LocalStores::from_store(manager.store(StoreScope::Local));

    let identity = IdentityManager::load(local.meta.clone(), AgentInstance::new("127.0.0.1", 2886))
        .await
        .unwrap();
    identity.transit(AgentIdentity::Single).await.unwrap();

    let engine = Arc::new(
        Engine::new(EngineDeps {
            identity: Arc::new(identity),
            local,
            registry: Arc::new(TaskRegistry::new()),
            peers: Arc::new(NoPeers),
            connector: Arc::new(SqlClusterConnector::new(ClusterStoreConfig::default())),
            executor: ExecutorConfig {
                workers: 2,
                default_timeout_seconds: 60,
                resync_interval_ms: 100,
            },
            scheduler: SchedulerConfig {
                interval_ms: 20,
                error_interval_ms: 20,
            },
            coordinator: CoordinatorConfig::default(),
        })
        .unwrap(),
    );
    engine.start().await.unwrap();

    let app = create_routes(AppState {
        engine: engine.clone(),
    });
    (app, engine)
}

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

/// 轮询DAG直到结束，返回最终状态
async fn wait_dag(app: &Router, generic_id: &str) -> Value {
    for _ in 0..250 {
        let (status, body) = call(app, Method::GET, &format!("/api/v1/task/dag/{generic_id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        let state = body["data"]["state"].as_str().unwrap().to_string();
        if matches!(state.as_str(), "SUCCEED" | "FAILED") {
            return body["data"].clone();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("DAG {generic_id} 没有在预期时间内结束");
}

#[tokio::test]
async fn test_health_check() {
    let (app, engine) = create_test_app().await;

    let (status, body) = call(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    engine.stop().await;
}

#[tokio::test]
async fn test_status_of_single_agent() {
    let (app, engine) = create_test_app().await;

    let (status, body) = call(&app, Method::GET, "/api/v1/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["agent"]["identity"], "SINGLE");
    assert_eq!(body["data"]["coordinator"]["role"], "FAULTY");
    assert_eq!(body["data"]["cluster_store_attached"], false);

    engine.stop().await;
}

#[tokio::test]
async fn test_join_self_runs_local_dag() {
    let (app, engine) = create_test_app().await;

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/v1/agent/join/self",
        Some(json!({ "zone": "z1" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let generic_id = body["data"]["generic_id"].as_str().unwrap().to_string();
    assert!(generic_id.starts_with("l-"));
    assert_eq!(body["data"]["name"], "Join self");

    let dag = wait_dag(&app, &generic_id).await;
    assert_eq!(dag["state"], "SUCCEED");

    let (_, body) = call(&app, Method::GET, "/api/v1/agent", None).await;
    assert_eq!(body["data"]["identity"], "MASTER");
    assert_eq!(body["data"]["zone"], "z1");

    let (_, body) = call(&app, Method::GET, "/api/v1/agents", None).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    // 子任务日志
    let sub_task_id = dag["nodes"][0]["sub_tasks"][0]["id"].as_i64().unwrap();
    let (status, body) = call(
        &app,
        Method::GET,
        &format!("/api/v1/task/sub_task/local/{sub_task_id}/logs"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"].is_array());

    engine.stop().await;
}

#[tokio::test]
async fn test_precondition_errors() {
    let (app, engine) = create_test_app().await;

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/v1/agent/join/self",
        Some(json!({ "zone": "" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_PARAM");

    // SINGLE 不能初始化集群
    let (status, body) = call(
        &app,
        Method::POST,
        "/api/v1/cluster/init",
        Some(json!({ "database_url": "sqlite::memory:" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "WRONG_IDENTITY");
    assert_eq!(body["details"]["current"], "SINGLE");

    let (status, body) = call(&app, Method::POST, "/api/v1/agent/leave", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "WRONG_IDENTITY");

    // 缺少字段
    let (status, body) = call(&app, Method::POST, "/api/v1/agent/join", Some(json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_REQUEST");

    engine.stop().await;
}

#[tokio::test]
async fn test_dag_lookup_errors() {
    let (app, engine) = create_test_app().await;

    let (status, body) = call(&app, Method::GET, "/api/v1/task/dag/x-1", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_PARAM");

    let (status, body) = call(&app, Method::GET, "/api/v1/task/dag/l-999", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");

    // 未接入集群存储
    let (status, body) = call(&app, Method::GET, "/api/v1/task/dags?scope=cluster", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], "STORE_UNAVAILABLE");

    let (status, body) = call(&app, Method::GET, "/api/v1/task/dags", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"].as_array().unwrap().is_empty());

    engine.stop().await;
}

#[tokio::test]
async fn test_set_dag_operator() {
    let (app, engine) = create_test_app().await;

    let (_, body) = call(
        &app,
        Method::POST,
        "/api/v1/agent/join/self",
        Some(json!({ "zone": "z1" })),
    )
    .await;
    let generic_id = body["data"]["generic_id"].as_str().unwrap().to_string();
    wait_dag(&app, &generic_id).await;

    let uri = format!("/api/v1/task/dag/{generic_id}");
    let (status, body) = call(&app, Method::PATCH, &uri, Some(json!({ "operator": "RUN" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_PARAM");

    // 成功的DAG不能再重试或取消
    let (status, body) = call(&app, Method::PATCH, &uri, Some(json!({ "operator": "RETRY" }))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "CONFLICTING_STATE");

    let (status, _) = call(&app, Method::PATCH, &uri, Some(json!({ "operator": "CANCEL" }))).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = call(&app, Method::PATCH, &uri, Some(json!({ "operator": "PAUSE" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    engine.stop().await;
}

#[tokio::test]
async fn test_rpc_maintainer_and_identity_checks() {
    let (app, engine) = create_test_app().await;

    let (status, body) = call(&app, Method::GET, "/rpc/v1/maintainer", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["role"], "FAULTY");
    assert!(body["data"]["maintainer"].is_null());

    // 非集群代理拒绝集群子任务
    let remote = json!({
        "remote_task_id": 1,
        "kind": "echo",
        "name": "echo",
        "context": {},
        "state": "READY",
        "operator": "RUN",
        "capabilities": {
            "can_cancel": true,
            "can_continue": false,
            "can_pass": false,
            "can_retry": true,
            "can_rollback": false
        },
        "execute_times": 1,
        "execute_agent": { "ip": "127.0.0.1", "port": 2886 },
        "timeout_ms": 1000,
        "start_time": 0,
        "end_time": 0
    });
    let (status, body) = call(&app, Method::POST, "/rpc/v1/task/sub_task", Some(remote)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "WRONG_IDENTITY");

    // 没有集群存储时不能写入上报
    let update = json!({
        "remote_task_id": 1,
        "execute_times": 1,
        "operator": "RUN",
        "state": "SUCCEED",
        "agent": { "ip": "127.0.0.1", "port": 2887 }
    });
    let (status, body) = call(&app, Method::PATCH, "/rpc/v1/task/sub_task", Some(update)).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], "STORE_UNAVAILABLE");

    let (status, _) = call(&app, Method::POST, "/rpc/v1/task/sub_task", Some(json!({ "x": 1 }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    engine.stop().await;
}

#[tokio::test]
async fn test_rpc_join_master() {
    let (app, engine) = create_test_app().await;

    let follower = serde_json::to_value(AgentInstance::new("127.0.0.1", 2887)).unwrap();
    let (status, body) = call(
        &app,
        Method::POST,
        "/rpc/v1/agent/join",
        Some(json!({ "agent": follower })),
    )
    .await;
    // 还不是主代理
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["details"]["current"], "SINGLE");

    let (_, body) = call(
        &app,
        Method::POST,
        "/api/v1/agent/join/self",
        Some(json!({ "zone": "z1" })),
    )
    .await;
    let generic_id = body["data"]["generic_id"].as_str().unwrap().to_string();
    wait_dag(&app, &generic_id).await;

    let (status, body) = call(
        &app,
        Method::POST,
        "/rpc/v1/agent/join",
        Some(json!({ "agent": follower })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["port"], 2886);
    assert_eq!(body["data"]["identity"], "MASTER");

    let (_, body) = call(&app, Method::GET, "/api/v1/agents", None).await;
    let agents = body["data"].as_array().unwrap();
    assert_eq!(agents.len(), 2);
    let joined = agents.iter().find(|a| a["port"] == 2887).unwrap();
    assert_eq!(joined["identity"], "FOLLOWER");

    engine.stop().await;
}
