//! 表结构
//!
//! 时间字段统一为毫秒时间戳（BIGINT），布尔字段为0/1。
//! SQLite 的索引单独创建，MySQL 的索引写在建表语句中。

use super::manager::DatabaseType;

struct TableDef {
    name: &'static str,
    columns: &'static str,
    indexes: &'static [(&'static str, &'static str)],
}

const TABLES: &[TableDef] = &[
    TableDef {
        name: "dag_instance",
        columns: "
            id {pk},
            name VARCHAR(128) NOT NULL,
            dag_type VARCHAR(16) NOT NULL,
            state VARCHAR(16) NOT NULL,
            operator VARCHAR(16) NOT NULL,
            maintenance BIGINT NOT NULL DEFAULT 0,
            context {text} NOT NULL,
            start_time BIGINT NOT NULL DEFAULT 0,
            end_time BIGINT NOT NULL DEFAULT 0,
            create_time BIGINT NOT NULL DEFAULT 0",
        indexes: &[("idx_dag_instance_state", "state")],
    },
    TableDef {
        name: "node_instance",
        columns: "
            id {pk},
            dag_id BIGINT NOT NULL,
            seq BIGINT NOT NULL,
            name VARCHAR(128) NOT NULL,
            node_type VARCHAR(16) NOT NULL,
            state VARCHAR(16) NOT NULL,
            operator VARCHAR(16) NOT NULL,
            execute_agents {text} NOT NULL,
            context {text} NOT NULL,
            start_time BIGINT NOT NULL DEFAULT 0,
            end_time BIGINT NOT NULL DEFAULT 0",
        indexes: &[("idx_node_instance_dag", "dag_id")],
    },
    TableDef {
        name: "sub_task_instance",
        columns: "
            id {pk},
            dag_id BIGINT NOT NULL DEFAULT 0,
            node_id BIGINT NOT NULL DEFAULT 0,
            seq BIGINT NOT NULL DEFAULT 0,
            kind VARCHAR(128) NOT NULL,
            name VARCHAR(128) NOT NULL,
            state VARCHAR(16) NOT NULL,
            operator VARCHAR(16) NOT NULL,
            execute_ip VARCHAR(64) NOT NULL,
            execute_port BIGINT NOT NULL,
            execute_times BIGINT NOT NULL DEFAULT 0,
            can_cancel BIGINT NOT NULL DEFAULT 1,
            can_continue BIGINT NOT NULL DEFAULT 0,
            can_pass BIGINT NOT NULL DEFAULT 0,
            can_retry BIGINT NOT NULL DEFAULT 1,
            can_rollback BIGINT NOT NULL DEFAULT 0,
            timeout_ms BIGINT NOT NULL DEFAULT 0,
            context {text} NOT NULL,
            start_time BIGINT NOT NULL DEFAULT 0,
            end_time BIGINT NOT NULL DEFAULT 0",
        indexes: &[
            ("idx_sub_task_instance_node", "node_id"),
            ("idx_sub_task_instance_state", "state"),
        ],
    },
    TableDef {
        name: "task_mapping",
        columns: "
            local_task_id BIGINT NOT NULL PRIMARY KEY,
            remote_task_id BIGINT NOT NULL UNIQUE,
            execute_times BIGINT NOT NULL DEFAULT 0,
            sync_flag BIGINT NOT NULL DEFAULT 0",
        indexes: &[("idx_task_mapping_sync", "sync_flag")],
    },
    TableDef {
        name: "sub_task_log",
        columns: "
            id {pk},
            sub_task_id BIGINT NOT NULL,
            execute_times BIGINT NOT NULL,
            content {text} NOT NULL,
            create_time BIGINT NOT NULL DEFAULT 0",
        indexes: &[("idx_sub_task_log_task", "sub_task_id")],
    },
    TableDef {
        name: "agent",
        columns: "
            id BIGINT NOT NULL PRIMARY KEY,
            ip VARCHAR(64) NOT NULL,
            port BIGINT NOT NULL,
            zone VARCHAR(128) NOT NULL,
            version VARCHAR(64) NOT NULL,
            home_path VARCHAR(512) NOT NULL,
            os VARCHAR(32) NOT NULL,
            arch VARCHAR(32) NOT NULL,
            public_key {text} NOT NULL,
            identity VARCHAR(32) NOT NULL,
            master_ip VARCHAR(64) NOT NULL DEFAULT '',
            master_port BIGINT NOT NULL DEFAULT 0",
        indexes: &[],
    },
    TableDef {
        name: "all_agent",
        columns: "
            ip VARCHAR(64) NOT NULL,
            port BIGINT NOT NULL,
            zone VARCHAR(128) NOT NULL,
            version VARCHAR(64) NOT NULL,
            home_path VARCHAR(512) NOT NULL,
            os VARCHAR(32) NOT NULL,
            arch VARCHAR(32) NOT NULL,
            public_key {text} NOT NULL,
            identity VARCHAR(32) NOT NULL,
            PRIMARY KEY (ip, port)",
        indexes: &[],
    },
    TableDef {
        name: "task_maintainer",
        columns: "
            id BIGINT NOT NULL PRIMARY KEY,
            ip VARCHAR(64) NOT NULL DEFAULT '',
            port BIGINT NOT NULL DEFAULT 0,
            counter BIGINT NOT NULL DEFAULT 0,
            active_time BIGINT NOT NULL DEFAULT 0,
            agent_time BIGINT NOT NULL DEFAULT 0",
        indexes: &[],
    },
    TableDef {
        name: "agent_kv",
        columns: "
            k VARCHAR(128) NOT NULL PRIMARY KEY,
            v {text} NOT NULL",
        indexes: &[],
    },
];

pub fn create_statements(db_type: DatabaseType) -> Vec<String> {
    let mut statements = Vec::new();
    for table in TABLES {
        let mut columns = table
            .columns
            .replace("{pk}", db_type.auto_increment_key())
            .replace("{text}", db_type.text_type());
        if db_type == DatabaseType::Mysql {
            for (name, cols) in table.indexes {
                columns.push_str(&format!(",\n            INDEX {name} ({cols})"));
            }
        }
        statements.push(format!(
            "CREATE TABLE IF NOT EXISTS {} ({}\n)",
            table.name, columns
        ));
        if db_type == DatabaseType::Sqlite {
            for (name, cols) in table.indexes {
                statements.push(format!(
                    "CREATE INDEX IF NOT EXISTS {name} ON {} ({cols})",
                    table.name
                ));
            }
        }
    }
    statements
}

/// 维护者记录只有一行，初始为空持有者、租约时间0（立即可接管）
pub fn seed_maintainer(db_type: DatabaseType) -> String {
    format!(
        "{} INTO task_maintainer (id, ip, port, counter, active_time, agent_time) \
         VALUES ({}, '', 0, 0, 0, 0)",
        db_type.insert_ignore(),
        agent_core::constants::MAINTAINER_ROW_ID
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlite_indexes_are_separate_statements() {
        let statements = create_statements(DatabaseType::Sqlite);
        assert!(statements
            .iter()
            .any(|s| s.starts_with("CREATE INDEX IF NOT EXISTS idx_sub_task_instance_node")));
        assert!(statements.iter().all(|s| !s.contains("{pk}")));
    }

    #[test]
    fn test_mysql_indexes_are_inline() {
        let statements = create_statements(DatabaseType::Mysql);
        assert_eq!(statements.len(), TABLES.len());
        let dag = &statements[0];
        assert!(dag.contains("AUTO_INCREMENT"));
        assert!(dag.contains("INDEX idx_dag_instance_state (state)"));
    }
}
