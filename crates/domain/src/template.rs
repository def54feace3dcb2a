use serde::{Deserialize, Serialize};

use agent_core::{AgentError, AgentResult};

use crate::entities::{AgentKey, DagType, NodeType, TaskCapabilities};
use crate::task::SubTask;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskTemplate {
    pub kind: String,
    pub name: String,
    pub capabilities: TaskCapabilities,
    pub timeout_ms: i64,
}

impl TaskTemplate {
    pub fn from_task(task: &dyn SubTask) -> Self {
        Self {
            kind: task.kind().to_string(),
            name: task.name(),
            capabilities: task.capabilities(),
            timeout_ms: task.timeout().as_millis() as i64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeTemplate {
    pub name: String,
    pub node_type: NodeType,
    pub tasks: Vec<TaskTemplate>,
    /// 为空时在创建DAG的代理上执行
    pub execute_agents: Vec<AgentKey>,
}

impl NodeTemplate {
    /// 展开后的子任务：(执行代理, 模板)，扇出节点按代理展开
    pub fn expand(&self, default_agent: &AgentKey) -> Vec<(AgentKey, &TaskTemplate)> {
        if self.execute_agents.is_empty() {
            return self
                .tasks
                .iter()
                .map(|t| (default_agent.clone(), t))
                .collect();
        }
        self.execute_agents
            .iter()
            .flat_map(|agent| self.tasks.iter().map(move |t| (agent.clone(), t)))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagTemplate {
    pub name: String,
    pub dag_type: DagType,
    pub maintenance: bool,
    pub nodes: Vec<NodeTemplate>,
}

/// DAG模板构建器
///
/// ```ignore
/// let template = TemplateBuilder::new("Join self")
///     .add_node(JoinSelfTask::default())
///     .build()?;
/// ```
pub struct TemplateBuilder {
    name: String,
    dag_type: DagType,
    maintenance: bool,
    nodes: Vec<NodeTemplate>,
}

impl TemplateBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dag_type: DagType::Local,
            maintenance: false,
            nodes: Vec::new(),
        }
    }

    pub fn dag_type(mut self, dag_type: DagType) -> Self {
        self.dag_type = dag_type;
        self
    }

    /// 维护中的DAG失败后自动回滚
    pub fn maintenance(mut self, maintenance: bool) -> Self {
        self.maintenance = maintenance;
        self
    }

    pub fn add_node<T: SubTask>(self, task: T) -> Self {
        let name = task.name();
        self.push(name, NodeType::Normal, vec![TaskTemplate::from_task(&task)], Vec::new())
    }

    pub fn add_sequential_node(self, name: impl Into<String>, tasks: Vec<Box<dyn SubTask>>) -> Self {
        let tasks = tasks.iter().map(|t| TaskTemplate::from_task(t.as_ref())).collect();
        self.push(name.into(), NodeType::Normal, tasks, Vec::new())
    }

    pub fn add_parallel_node(self, name: impl Into<String>, tasks: Vec<Box<dyn SubTask>>) -> Self {
        let tasks = tasks.iter().map(|t| TaskTemplate::from_task(t.as_ref())).collect();
        self.push(name.into(), NodeType::Parallel, tasks, Vec::new())
    }

    /// 在每个目标代理上各执行一次 `task`
    pub fn add_fan_out_node<T: SubTask>(
        self,
        task: T,
        agents: Vec<AgentKey>,
        node_type: NodeType,
    ) -> Self {
        let name = task.name();
        self.push(name, node_type, vec![TaskTemplate::from_task(&task)], agents)
    }

    fn push(
        mut self,
        name: String,
        node_type: NodeType,
        tasks: Vec<TaskTemplate>,
        execute_agents: Vec<AgentKey>,
    ) -> Self {
        self.nodes.push(NodeTemplate {
            name,
            node_type,
            tasks,
            execute_agents,
        });
        self
    }

    pub fn build(self) -> AgentResult<DagTemplate> {
        if self.nodes.is_empty() {
            return Err(AgentError::invalid_param(format!("DAG {} 没有节点", self.name)));
        }
        if let Some(node) = self.nodes.iter().find(|n| n.tasks.is_empty()) {
            return Err(AgentError::invalid_param(format!(
                "DAG {} 的节点 {} 没有子任务",
                self.name, node.name
            )));
        }
        Ok(DagTemplate {
            name: self.name,
            dag_type: self.dag_type,
            maintenance: self.maintenance,
            nodes: self.nodes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::ExecutionContext;
    use async_trait::async_trait;
    use std::time::Duration;

    #[derive(Default)]
    struct Step;

    #[async_trait]
    impl SubTask for Step {
        fn kind(&self) -> &'static str {
            "step"
        }

        async fn execute(&self, _ctx: &ExecutionContext) -> AgentResult<()> {
            Ok(())
        }

        fn can_rollback(&self) -> bool {
            true
        }

        fn timeout(&self) -> Duration {
            Duration::from_secs(5)
        }
    }

    #[test]
    fn test_build_template() {
        let a = AgentKey::new("10.0.0.1", 2886);
        let b = AgentKey::new("10.0.0.2", 2886);
        let template = TemplateBuilder::new("Upgrade")
            .dag_type(DagType::Cluster)
            .maintenance(true)
            .add_node(Step)
            .add_fan_out_node(Step, vec![a.clone(), b.clone()], NodeType::Normal)
            .build()
            .unwrap();

        assert_eq!(template.nodes.len(), 2);
        assert!(template.maintenance);
        assert_eq!(template.nodes[0].tasks[0].timeout_ms, 5_000);
        assert!(template.nodes[0].tasks[0].capabilities.can_rollback);

        let me = AgentKey::new("10.0.0.9", 2886);
        let single = template.nodes[0].expand(&me);
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].0, me);

        let fan_out = template.nodes[1].expand(&me);
        assert_eq!(
            fan_out.iter().map(|(agent, _)| agent.clone()).collect::<Vec<_>>(),
            vec![a, b]
        );
    }

    #[test]
    fn test_empty_template_is_rejected() {
        assert!(TemplateBuilder::new("empty").build().is_err());
        assert!(TemplateBuilder::new("empty node")
            .add_parallel_node("nothing", Vec::new())
            .build()
            .is_err());
    }
}
