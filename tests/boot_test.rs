//! 启动路径测试：主目录、身份恢复与接管

use std::path::Path;

use tempfile::TempDir;

use agent_core::config::ClusterStoreConfig;
use agent_core::{AppConfig, ExitCode};
use agent_domain::{AgentIdentity, AgentInstance, ClusterConnector};
use agent_infrastructure::SqlClusterConnector;
use meta_agent::app::{build_engine, check_self, resolve_identity};
use meta_agent::pidfile::prepare_home;

fn config_for(home: &Path, port: u16) -> AppConfig {
    let mut config = AppConfig::default();
    config.agent.ip = "127.0.0.1".to_string();
    config.agent.port = port;
    config.agent.home = home.to_string_lossy().to_string();
    config
}

fn cluster_url(dir: &TempDir) -> String {
    format!("sqlite://{}/cluster.db?mode=rwc", dir.path().display())
}

/// 在集群成员表中登记一个代理
async fn seed_member(url: &str, port: u16, zone: &str) {
    let stores = SqlClusterConnector::new(ClusterStoreConfig::default())
        .connect(url)
        .await
        .unwrap();
    let mut agent = AgentInstance::new("127.0.0.1", port);
    agent.identity = AgentIdentity::Cluster;
    agent.zone = zone.to_string();
    stores.agents.upsert_agent(&agent).await.unwrap();
}

#[tokio::test]
async fn test_first_boot_becomes_single() {
    let dir = TempDir::new().unwrap();
    let home = prepare_home(&dir.path().join("agent")).unwrap();
    let config = config_for(&home, 2886);

    let engine = build_engine(&config, &home).await.unwrap();
    check_self(&engine, &config).unwrap();
    resolve_identity(&engine, &config, false, false).await.unwrap();
    assert_eq!(engine.identity().identity().await, AgentIdentity::Single);
    assert!(home.join("etc").join("agent.db").exists());

    // 重启后身份保持，要求集群存储时失败
    let engine = build_engine(&config, &home).await.unwrap();
    assert_eq!(engine.identity().identity().await, AgentIdentity::Single);
    let failure = resolve_identity(&engine, &config, false, true)
        .await
        .unwrap_err();
    assert_eq!(failure.code, ExitCode::NotClusterAgent);
}

#[tokio::test]
async fn test_changed_port_is_ip_mismatch() {
    let dir = TempDir::new().unwrap();
    let home = prepare_home(dir.path()).unwrap();

    let config = config_for(&home, 2886);
    let engine = build_engine(&config, &home).await.unwrap();
    resolve_identity(&engine, &config, false, false).await.unwrap();

    let moved = config_for(&home, 2887);
    let engine = build_engine(&moved, &home).await.unwrap();
    let failure = check_self(&engine, &moved).unwrap_err();
    assert_eq!(failure.code, ExitCode::IpMismatch);
}

#[tokio::test]
async fn test_take_over_restores_cluster_identity() {
    let dir = TempDir::new().unwrap();
    let home = prepare_home(&dir.path().join("agent")).unwrap();
    let url = cluster_url(&dir);
    seed_member(&url, 2886, "zone1").await;

    let mut config = config_for(&home, 2886);
    config.cluster_store.url = Some(url);

    let engine = build_engine(&config, &home).await.unwrap();
    resolve_identity(&engine, &config, true, true).await.unwrap();
    assert_eq!(engine.identity().identity().await, AgentIdentity::Cluster);
    assert_eq!(engine.identity().current().await.zone, "zone1");
    assert!(engine.slot().is_attached());

    // 重启时从本地存储中记录的地址恢复集群存储
    let engine = build_engine(&config, &home).await.unwrap();
    assert!(!engine.slot().is_attached());
    resolve_identity(&engine, &config, false, true).await.unwrap();
    assert!(engine.slot().is_attached());
}

#[tokio::test]
async fn test_take_over_requires_membership_row() {
    let dir = TempDir::new().unwrap();
    let home = prepare_home(&dir.path().join("agent")).unwrap();
    let url = cluster_url(&dir);
    seed_member(&url, 2999, "zone1").await;

    let mut config = config_for(&home, 2886);
    config.cluster_store.url = Some(url);

    let engine = build_engine(&config, &home).await.unwrap();
    let failure = resolve_identity(&engine, &config, true, false)
        .await
        .unwrap_err();
    assert_eq!(failure.code, ExitCode::NotClusterAgent);
    assert_eq!(
        engine.identity().identity().await,
        AgentIdentity::Unidentified
    );
}

#[tokio::test]
async fn test_take_over_needs_cluster_url_and_fresh_agent() {
    let dir = TempDir::new().unwrap();
    let home = prepare_home(dir.path()).unwrap();
    let config = config_for(&home, 2886);

    let engine = build_engine(&config, &home).await.unwrap();
    let failure = resolve_identity(&engine, &config, true, false)
        .await
        .unwrap_err();
    assert_eq!(failure.code, ExitCode::TakeOverFailed);

    resolve_identity(&engine, &config, false, false).await.unwrap();
    let failure = resolve_identity(&engine, &config, true, false)
        .await
        .unwrap_err();
    assert_eq!(failure.code, ExitCode::TakeOverFailed);
}
