//! 任务上下文
//!
//! 上下文分为两部分：
//! - `param`：创建时写入的输入参数，运行期间只读
//! - `data`：任务产生的结果，节点成功后逐级向上合并
//!
//! 值统一以JSON存储，通过 [`TaskContext::get_param`] / [`TaskContext::get_data`]
//! 按需反序列化；类型不符时返回错误而不是panic。

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use agent_core::constants::AGENT_DATA_KEY;
use agent_core::{AgentError, AgentResult};

use crate::entities::AgentKey;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskContext {
    #[serde(default)]
    param: BTreeMap<String, Value>,
    #[serde(default)]
    data: BTreeMap<String, Value>,
}

impl TaskContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// 构建阶段写入参数，DAG创建后不再修改
    pub fn with_param<T: Serialize>(mut self, key: &str, value: T) -> AgentResult<Self> {
        self.param.insert(key.to_string(), serde_json::to_value(value)?);
        Ok(self)
    }

    pub fn get_param<T: DeserializeOwned>(&self, key: &str) -> AgentResult<T> {
        let value = self
            .param
            .get(key)
            .ok_or_else(|| AgentError::invalid_param(format!("缺少参数: {key}")))?;
        serde_json::from_value(value.clone())
            .map_err(|e| AgentError::invalid_param(format!("参数 {key} 类型不符: {e}")))
    }

    pub fn get_param_opt<T: DeserializeOwned>(&self, key: &str) -> AgentResult<Option<T>> {
        match self.param.get(key) {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| AgentError::invalid_param(format!("参数 {key} 类型不符: {e}"))),
        }
    }

    pub fn get_data<T: DeserializeOwned>(&self, key: &str) -> AgentResult<Option<T>> {
        match self.data.get(key) {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| AgentError::Serialization(format!("数据 {key} 类型不符: {e}"))),
        }
    }

    pub fn set_data<T: Serialize>(&mut self, key: &str, value: T) -> AgentResult<()> {
        self.data.insert(key.to_string(), serde_json::to_value(value)?);
        Ok(())
    }

    pub fn params(&self) -> &BTreeMap<String, Value> {
        &self.param
    }

    pub fn data(&self) -> &BTreeMap<String, Value> {
        &self.data
    }

    /// 合并另一个上下文的数据（同名键覆盖），参数保持不变
    pub fn merge_data(&mut self, other: &TaskContext) {
        for (key, value) in &other.data {
            if key == AGENT_DATA_KEY {
                self.merge_agent_map(value);
            } else {
                self.data.insert(key.clone(), value.clone());
            }
        }
    }

    /// 以 `ip:port` 为键记录扇出子任务的结果
    pub fn set_agent_data(&mut self, agent: &AgentKey, other: &TaskContext) {
        let mut own = other.data.clone();
        own.remove(AGENT_DATA_KEY);
        let entry = Value::Object(own.into_iter().collect());
        let mut map = serde_json::Map::new();
        map.insert(agent.to_string(), entry);
        self.merge_agent_map(&Value::Object(map));
    }

    pub fn get_agent_data<T: DeserializeOwned>(&self, agent: &AgentKey) -> AgentResult<Option<T>> {
        let Some(Value::Object(map)) = self.data.get(AGENT_DATA_KEY) else {
            return Ok(None);
        };
        match map.get(&agent.to_string()) {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| AgentError::Serialization(format!("代理 {agent} 的数据类型不符: {e}"))),
        }
    }

    fn merge_agent_map(&mut self, value: &Value) {
        let Value::Object(incoming) = value else {
            return;
        };
        let slot = self
            .data
            .entry(AGENT_DATA_KEY.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(serde_json::Map::new());
        }
        if let Value::Object(existing) = slot {
            for (agent, data) in incoming {
                existing.insert(agent.clone(), data.clone());
            }
        }
    }

    pub fn to_json(&self) -> AgentResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> AgentResult<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(text)?)
    }
}
