//! 行到实体的映射
//!
//! Any驱动只支持有限的类型，因此布尔字段存为0/1，枚举存为字符串，
//! 上下文与节点的执行代理列表存为JSON文本。

use sqlx::any::AnyRow;
use sqlx::Row;

use agent_core::{AgentError, AgentResult};
use agent_domain::{
    AgentIdentity, AgentInstance, AgentKey, DagInstance, MaintainerRecord, NodeInstance,
    SubTaskInstance, SubTaskLog, TaskCapabilities, TaskContext, TaskMapping,
};

pub(crate) const DAG_COLUMNS: &str =
    "id, name, dag_type, state, operator, maintenance, context, start_time, end_time, create_time";

pub(crate) const NODE_COLUMNS: &str =
    "id, dag_id, seq, name, node_type, state, operator, execute_agents, context, start_time, end_time";

pub(crate) const SUB_TASK_COLUMNS: &str = "id, dag_id, node_id, seq, kind, name, state, operator, \
     execute_ip, execute_port, execute_times, can_cancel, can_continue, can_pass, can_retry, \
     can_rollback, timeout_ms, context, start_time, end_time";

pub(crate) const AGENT_COLUMNS: &str =
    "ip, port, zone, version, home_path, os, arch, public_key, identity";

pub(crate) fn flag(value: bool) -> i64 {
    i64::from(value)
}

fn get_flag(row: &AnyRow, column: &str) -> AgentResult<bool> {
    Ok(row.try_get::<i64, _>(column)? != 0)
}

fn get_port(row: &AnyRow, column: &str) -> AgentResult<u16> {
    let port: i64 = row.try_get(column)?;
    u16::try_from(port).map_err(|_| AgentError::internal(format!("端口超出范围: {port}")))
}

fn get_enum<T>(row: &AnyRow, column: &str) -> AgentResult<T>
where
    T: std::str::FromStr<Err = AgentError>,
{
    let value: String = row.try_get(column)?;
    value.parse()
}

fn get_context(row: &AnyRow, column: &str) -> AgentResult<TaskContext> {
    let json: String = row.try_get(column)?;
    TaskContext::from_json(&json)
}

pub(crate) fn row_to_dag(row: &AnyRow) -> AgentResult<DagInstance> {
    Ok(DagInstance {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        dag_type: get_enum(row, "dag_type")?,
        state: get_enum(row, "state")?,
        operator: get_enum(row, "operator")?,
        maintenance: get_flag(row, "maintenance")?,
        context: get_context(row, "context")?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        create_time: row.try_get("create_time")?,
    })
}

pub(crate) fn row_to_node(row: &AnyRow) -> AgentResult<NodeInstance> {
    let agents: String = row.try_get("execute_agents")?;
    let execute_agents: Vec<AgentKey> = if agents.is_empty() {
        Vec::new()
    } else {
        serde_json::from_str(&agents)?
    };

    Ok(NodeInstance {
        id: row.try_get("id")?,
        dag_id: row.try_get("dag_id")?,
        seq: row.try_get("seq")?,
        name: row.try_get("name")?,
        node_type: get_enum(row, "node_type")?,
        state: get_enum(row, "state")?,
        operator: get_enum(row, "operator")?,
        execute_agents,
        context: get_context(row, "context")?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
    })
}

pub(crate) fn row_to_sub_task(row: &AnyRow) -> AgentResult<SubTaskInstance> {
    Ok(SubTaskInstance {
        id: row.try_get("id")?,
        dag_id: row.try_get("dag_id")?,
        node_id: row.try_get("node_id")?,
        seq: row.try_get("seq")?,
        kind: row.try_get("kind")?,
        name: row.try_get("name")?,
        state: get_enum(row, "state")?,
        operator: get_enum(row, "operator")?,
        execute_agent: AgentKey::new(
            row.try_get::<String, _>("execute_ip")?,
            get_port(row, "execute_port")?,
        ),
        execute_times: row.try_get("execute_times")?,
        capabilities: TaskCapabilities {
            can_cancel: get_flag(row, "can_cancel")?,
            can_continue: get_flag(row, "can_continue")?,
            can_pass: get_flag(row, "can_pass")?,
            can_retry: get_flag(row, "can_retry")?,
            can_rollback: get_flag(row, "can_rollback")?,
        },
        timeout_ms: row.try_get("timeout_ms")?,
        context: get_context(row, "context")?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
    })
}

pub(crate) fn row_to_mapping(row: &AnyRow) -> AgentResult<TaskMapping> {
    Ok(TaskMapping {
        local_task_id: row.try_get("local_task_id")?,
        remote_task_id: row.try_get("remote_task_id")?,
        execute_times: row.try_get("execute_times")?,
        sync_flag: get_flag(row, "sync_flag")?,
    })
}

pub(crate) fn row_to_log(row: &AnyRow) -> AgentResult<SubTaskLog> {
    Ok(SubTaskLog {
        id: row.try_get("id")?,
        sub_task_id: row.try_get("sub_task_id")?,
        execute_times: row.try_get("execute_times")?,
        content: row.try_get("content")?,
        create_time: row.try_get("create_time")?,
    })
}

pub(crate) fn row_to_agent(row: &AnyRow) -> AgentResult<AgentInstance> {
    Ok(AgentInstance {
        ip: row.try_get("ip")?,
        port: get_port(row, "port")?,
        zone: row.try_get("zone")?,
        version: row.try_get("version")?,
        home_path: row.try_get("home_path")?,
        os: row.try_get("os")?,
        arch: row.try_get("arch")?,
        public_key: row.try_get("public_key")?,
        identity: get_enum::<AgentIdentity>(row, "identity")?,
        master: None,
    })
}

/// 自身记录额外带有主代理地址，空IP表示没有主代理
pub(crate) fn row_to_self_agent(row: &AnyRow) -> AgentResult<AgentInstance> {
    let mut agent = row_to_agent(row)?;
    let master_ip: String = row.try_get("master_ip")?;
    if !master_ip.is_empty() {
        agent.master = Some(AgentKey::new(master_ip, get_port(row, "master_port")?));
    }
    Ok(agent)
}

pub(crate) fn row_to_maintainer(row: &AnyRow) -> AgentResult<MaintainerRecord> {
    Ok(MaintainerRecord {
        ip: row.try_get("ip")?,
        port: get_port(row, "port")?,
        counter: row.try_get("counter")?,
        active_time: row.try_get("active_time")?,
        agent_time: row.try_get("agent_time")?,
        now: row.try_get("now")?,
    })
}
