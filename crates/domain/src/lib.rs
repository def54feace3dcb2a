pub mod context;
pub mod entities;
pub mod events;
pub mod identity;
pub mod ports;
pub mod registry;
pub mod repositories;
pub mod task;
pub mod template;

pub use agent_core::{AgentError, AgentResult};
pub use context::TaskContext;
pub use entities::*;
pub use events::{CoordinatorRole, MaintainerView, RoleBus};
pub use identity::IdentityManager;
pub use ports::{ClusterConnector, PeerClient};
pub use registry::TaskRegistry;
pub use repositories::*;
pub use task::{ExecutionContext, SubTask, TaskEnvironment, TaskLogLine};
pub use template::{DagTemplate, NodeTemplate, TaskTemplate, TemplateBuilder};
