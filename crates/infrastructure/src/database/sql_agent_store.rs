use async_trait::async_trait;
use sqlx::Row;
use tracing::{debug, info, instrument};

use agent_core::constants::MAINTAINER_ROW_ID;
use agent_core::{AgentError, AgentResult};
use agent_domain::{
    now_millis, AgentInstance, AgentKey, AgentStore, LocalMetaStore, MaintainerRecord,
    MaintainerStore,
};

use super::mapping::{row_to_agent, row_to_maintainer, row_to_self_agent, AGENT_COLUMNS};
use super::SqlStore;

/// 本地存储中自身记录的固定主键
const SELF_AGENT_ROW_ID: i64 = 1;

#[async_trait]
impl AgentStore for SqlStore {
    async fn list_agents(&self) -> AgentResult<Vec<AgentInstance>> {
        let rows = sqlx::query(&format!(
            "SELECT {AGENT_COLUMNS} FROM all_agent ORDER BY ip, port"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_agent).collect()
    }

    async fn get_agent(&self, key: &AgentKey) -> AgentResult<Option<AgentInstance>> {
        let row = sqlx::query(&format!(
            "SELECT {AGENT_COLUMNS} FROM all_agent WHERE ip = ? AND port = ?"
        ))
        .bind(&key.ip)
        .bind(i64::from(key.port))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_agent).transpose()
    }

    #[instrument(skip(self, agent), fields(agent = %agent.key()))]
    async fn upsert_agent(&self, agent: &AgentInstance) -> AgentResult<()> {
        let sql = self.db_type.upsert(
            "all_agent",
            &[
                "ip",
                "port",
                "zone",
                "version",
                "home_path",
                "os",
                "arch",
                "public_key",
                "identity",
            ],
            &["ip", "port"],
        );
        sqlx::query(&sql)
            .bind(&agent.ip)
            .bind(i64::from(agent.port))
            .bind(&agent.zone)
            .bind(&agent.version)
            .bind(&agent.home_path)
            .bind(&agent.os)
            .bind(&agent.arch)
            .bind(&agent.public_key)
            .bind(agent.identity.as_str())
            .execute(&self.pool)
            .await?;
        debug!("写入成员记录成功: {}", agent.key());
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_agent(&self, key: &AgentKey) -> AgentResult<bool> {
        let result = sqlx::query("DELETE FROM all_agent WHERE ip = ? AND port = ?")
            .bind(&key.ip)
            .bind(i64::from(key.port))
            .execute(&self.pool)
            .await?;
        debug!("删除成员记录: {}, 影响行数 {}", key, result.rows_affected());
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl MaintainerStore for SqlStore {
    async fn get_maintainer(&self) -> AgentResult<MaintainerRecord> {
        let row = sqlx::query(&format!(
            "SELECT ip, port, counter, active_time, agent_time, {} AS now \
             FROM task_maintainer WHERE id = ?",
            self.now_expr()
        ))
        .bind(MAINTAINER_ROW_ID)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => row_to_maintainer(&row),
            None => Err(AgentError::not_found("维护者记录", MAINTAINER_ROW_ID)),
        }
    }

    async fn renew_lease(&self, holder: &AgentKey) -> AgentResult<bool> {
        let result = sqlx::query(&format!(
            "UPDATE task_maintainer SET counter = counter + 1, active_time = {}, agent_time = ? \
             WHERE id = ? AND ip = ? AND port = ?",
            self.now_expr()
        ))
        .bind(now_millis())
        .bind(MAINTAINER_ROW_ID)
        .bind(&holder.ip)
        .bind(i64::from(holder.port))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn take_over(&self, holder: &AgentKey, max_active_ms: i64) -> AgentResult<bool> {
        let now = self.now_expr();
        let result = sqlx::query(&format!(
            "UPDATE task_maintainer SET ip = ?, port = ?, counter = counter + 1, \
             active_time = {now}, agent_time = ? \
             WHERE id = ? AND ({now} - active_time) >= ?"
        ))
        .bind(&holder.ip)
        .bind(i64::from(holder.port))
        .bind(now_millis())
        .bind(MAINTAINER_ROW_ID)
        .bind(max_active_ms)
        .execute(&self.pool)
        .await?;
        let taken = result.rows_affected() > 0;
        if taken {
            info!("接管维护者租约成功: {}", holder);
        }
        Ok(taken)
    }

    #[instrument(skip(self))]
    async fn release_lease(&self, holder: &AgentKey) -> AgentResult<bool> {
        let result = sqlx::query(
            "UPDATE task_maintainer SET active_time = 0 WHERE id = ? AND ip = ? AND port = ?",
        )
        .bind(MAINTAINER_ROW_ID)
        .bind(&holder.ip)
        .bind(i64::from(holder.port))
        .execute(&self.pool)
        .await?;
        let released = result.rows_affected() > 0;
        if released {
            info!("释放维护者租约: {}", holder);
        }
        Ok(released)
    }
}

#[async_trait]
impl LocalMetaStore for SqlStore {
    async fn load_self(&self) -> AgentResult<Option<AgentInstance>> {
        let row = sqlx::query(&format!(
            "SELECT {AGENT_COLUMNS}, master_ip, master_port FROM agent WHERE id = ?"
        ))
        .bind(SELF_AGENT_ROW_ID)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_self_agent).transpose()
    }

    #[instrument(skip(self, agent), fields(agent = %agent.key(), identity = %agent.identity))]
    async fn save_self(&self, agent: &AgentInstance) -> AgentResult<()> {
        let sql = self.db_type.upsert(
            "agent",
            &[
                "id",
                "ip",
                "port",
                "zone",
                "version",
                "home_path",
                "os",
                "arch",
                "public_key",
                "identity",
                "master_ip",
                "master_port",
            ],
            &["id"],
        );
        let (master_ip, master_port) = match &agent.master {
            Some(master) => (master.ip.clone(), i64::from(master.port)),
            None => (String::new(), 0),
        };
        sqlx::query(&sql)
            .bind(SELF_AGENT_ROW_ID)
            .bind(&agent.ip)
            .bind(i64::from(agent.port))
            .bind(&agent.zone)
            .bind(&agent.version)
            .bind(&agent.home_path)
            .bind(&agent.os)
            .bind(&agent.arch)
            .bind(&agent.public_key)
            .bind(agent.identity.as_str())
            .bind(master_ip)
            .bind(master_port)
            .execute(&self.pool)
            .await?;
        debug!("保存自身记录成功");
        Ok(())
    }

    async fn get_kv(&self, key: &str) -> AgentResult<Option<String>> {
        let row = sqlx::query("SELECT v FROM agent_kv WHERE k = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.try_get::<String, _>("v")).transpose()?)
    }

    async fn set_kv(&self, key: &str, value: &str) -> AgentResult<()> {
        let sql = self.db_type.upsert("agent_kv", &["k", "v"], &["k"]);
        sqlx::query(&sql)
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_kv(&self, key: &str) -> AgentResult<()> {
        sqlx::query("DELETE FROM agent_kv WHERE k = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
