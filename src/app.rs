use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use agent_api::{cors_layer, create_routes, AppState};
use agent_core::logging::init_logging;
use agent_core::{exit_with_failure, AgentError, AppConfig, ExitCode};
use agent_dispatcher::{Engine, EngineDeps};
use agent_domain::{AgentIdentity, AgentInstance, AgentKey, IdentityManager, LocalStores, TaskRegistry};
use agent_infrastructure::{is_access_denied, DatabaseManager, HttpPeerClient, SqlClusterConnector};

use crate::cli::Cli;
use crate::pidfile;
use crate::shutdown::{wait_for_shutdown_signal, ShutdownManager};

/// 启动路径上需要以固定退出码结束进程的失败
#[derive(Debug)]
pub struct BootFailure {
    pub code: ExitCode,
    pub message: String,
}

impl BootFailure {
    fn new(code: ExitCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// 集群存储相关的错误按原因归类
    fn from_store_error(err: &AgentError, fallback: ExitCode) -> Self {
        let code = if is_access_denied(err) {
            ExitCode::WrongPassword
        } else {
            match err {
                AgentError::Database(_) | AgentError::StoreUnavailable(_) | AgentError::Timeout(_) => {
                    ExitCode::DatabaseStartFailed
                }
                _ => fallback,
            }
        };
        Self::new(code, err.to_string())
    }
}

/// 进程入口：加载配置、恢复身份、启动引擎与HTTP服务，直到收到关闭信号
pub async fn run(cli: Cli) -> Result<()> {
    let mut config = AppConfig::load(cli.config.as_deref()).context("加载配置失败")?;
    cli.apply(&mut config)?;
    init_logging(&config.observability)?;

    info!(agent = %config.agent.bind_address(), "启动节点控制代理");

    let home = pidfile::prepare_home(&config.agent.home_path())?;
    std::env::set_current_dir(&home)
        .with_context(|| format!("切换工作目录失败: {}", home.display()))?;

    if let Some(old_pid) = cli.old_pid {
        if pidfile::is_upgrade(old_pid, &home) {
            info!(old_pid, "进入升级模式，等待旧进程退出");
            let wait = Duration::from_secs(config.agent.upgrade_wait_seconds);
            if !pidfile::wait_for_exit(old_pid, wait).await {
                warn!(old_pid, "旧进程仍在运行，继续启动");
            }
        }
    }

    let pid_file = home.join("run").join("agent.pid");
    pidfile::write_pid_file(&pid_file)?;

    let engine = build_engine(&config, &home).await?;
    if let Err(failure) = check_self(&engine, &config) {
        exit_with_failure(failure.code, failure.message);
    }
    if let Err(failure) = resolve_identity(&engine, &config, cli.is_take_over(), cli.start_db).await {
        exit_with_failure(failure.code, failure.message);
    }
    engine.start().await?;

    let mut router = create_routes(AppState {
        engine: engine.clone(),
    });
    if config.rpc.cors_enabled {
        router = router.layer(cors_layer());
    }

    let bind_address = config.agent.bind_address();
    let listener = match TcpListener::bind(&bind_address).await {
        Ok(listener) => listener,
        Err(e) => exit_with_failure(ExitCode::ServerListenFailed, format!("{bind_address}: {e}")),
    };
    info!("HTTP服务启动在 http://{}", bind_address);

    let shutdown_manager = ShutdownManager::new();
    let mut shutdown_rx = shutdown_manager.subscribe().await;
    {
        let shutdown_manager = shutdown_manager.clone();
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            shutdown_manager.shutdown().await;
        });
    }

    let served = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
            info!("HTTP服务收到关闭信号");
        })
        .await;
    if let Err(e) = served {
        error!("HTTP服务异常退出: {}", e);
    }

    engine.stop().await;
    pidfile::remove_pid_file(&pid_file);
    info!("节点控制代理已退出");
    Ok(())
}

/// 打开本地存储并组装任务引擎
pub async fn build_engine(config: &AppConfig, home: &Path) -> Result<Arc<Engine>> {
    let home_str = home.to_string_lossy().to_string();
    let store = DatabaseManager::open_local(&config.local_store, &home_str)
        .await
        .context("打开本地存储失败")?;
    let local = LocalStores::from_store(store);

    let mut initial = AgentInstance::new(&config.agent.ip, config.agent.port);
    initial.home_path = home_str;
    let identity = IdentityManager::load(local.meta.clone(), initial)
        .await
        .context("加载代理身份失败")?;

    let peers = HttpPeerClient::new(config.rpc.timeout()).context("创建RPC客户端失败")?;

    let engine = Engine::new(EngineDeps {
        identity: Arc::new(identity),
        local,
        registry: Arc::new(TaskRegistry::new()),
        peers: Arc::new(peers),
        connector: Arc::new(SqlClusterConnector::new(config.cluster_store.clone())),
        executor: config.executor.clone(),
        scheduler: config.scheduler.clone(),
        coordinator: config.coordinator.clone(),
    })?;
    Ok(Arc::new(engine))
}

/// 持久化的自身地址必须与配置一致
pub fn check_self(engine: &Engine, config: &AppConfig) -> Result<(), BootFailure> {
    let expected = AgentKey::new(&config.agent.ip, config.agent.port);
    if engine.self_key() != &expected {
        return Err(BootFailure::new(
            ExitCode::IpMismatch,
            format!("持久化的代理为 {}，配置为 {}", engine.self_key(), expected),
        ));
    }
    Ok(())
}

/// 按持久化的身份和启动参数确定本次启动的身份
///
/// - 首次启动：UNIDENTIFIED -> SINGLE，或 `--take-over=1` 时接管集群代理身份
/// - CLUSTER：恢复集群存储连接
/// - 迁移中途退出的 TAKE-OVER/SCALING-OUT：身份无效
pub async fn resolve_identity(
    engine: &Engine,
    config: &AppConfig,
    take_over: bool,
    start_db: bool,
) -> Result<(), BootFailure> {
    let identity = engine.identity().identity().await;
    info!(identity = %identity, take_over, start_db, "恢复代理身份");

    match identity {
        AgentIdentity::Unidentified if take_over => {
            let url = config.cluster_store.url.as_deref().ok_or_else(|| {
                BootFailure::new(ExitCode::TakeOverFailed, "未配置集群存储地址")
            })?;
            engine.agents().take_over(url).await.map_err(|e| match e {
                AgentError::NotFound { .. } => {
                    BootFailure::new(ExitCode::NotClusterAgent, e.to_string())
                }
                e => BootFailure::from_store_error(&e, ExitCode::TakeOverFailed),
            })
        }
        AgentIdentity::Unidentified => {
            engine
                .identity()
                .transit(AgentIdentity::Single)
                .await
                .map_err(|e| BootFailure::new(ExitCode::InvalidIdentity, e.to_string()))?;
            require_cluster(start_db)
        }
        AgentIdentity::TakeOver | AgentIdentity::ScalingOut => Err(BootFailure::new(
            ExitCode::InvalidIdentity,
            format!("身份迁移未完成: {identity}"),
        )),
        AgentIdentity::Cluster => {
            if take_over {
                warn!("已是集群代理，忽略接管参数");
            }
            match engine.agents().restore_cluster().await {
                Ok(_) => Ok(()),
                Err(e) if start_db || is_access_denied(&e) => {
                    Err(BootFailure::from_store_error(&e, ExitCode::DatabaseStartFailed))
                }
                Err(e) => {
                    warn!("恢复集群存储失败，集群调度暂停: {}", e);
                    Ok(())
                }
            }
        }
        _ => {
            if take_over {
                return Err(BootFailure::new(
                    ExitCode::TakeOverFailed,
                    format!("只有未初始化的代理可以接管，当前身份: {identity}"),
                ));
            }
            require_cluster(start_db)
        }
    }
}

fn require_cluster(start_db: bool) -> Result<(), BootFailure> {
    if start_db {
        return Err(BootFailure::new(ExitCode::NotClusterAgent, "要求集群存储但代理不属于集群"));
    }
    Ok(())
}

