pub mod agent;
pub mod app_config;
pub mod engine;
pub mod observability;
pub mod store;

pub use agent::{AgentConfig, RpcConfig};
pub use app_config::AppConfig;
pub use engine::{CoordinatorConfig, ExecutorConfig, SchedulerConfig};
pub use observability::{LogFormat, ObservabilityConfig};
pub use store::{ClusterStoreConfig, StoreConfig};
