//! # 作业信封

use crate::errors::QueueError;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use uuid::Uuid;

/// 作业信封，线上格式为 JSON 对象
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// 作业 Id
    pub id: Uuid,
    /// 尝试次数，从 1 开始
    pub attempts: u32,
    /// 处理器名称
    pub handler: String,
    /// 作业数据
    pub payload: Value,
}

impl Envelope {
    /// 构造首次尝试的信封
    pub fn new(handler: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            attempts: 1,
            handler: handler.into(),
            payload,
        }
    }

    /// 重新发布用的信封：尝试次数加一，保留作业 Id
    pub fn next_attempt(&self) -> Self {
        Self {
            attempts: self.attempts.saturating_add(1),
            ..self.clone()
        }
    }

    /// 序列化
    pub fn to_bytes(&self) -> Result<Vec<u8>, QueueError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// 反序列化
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, QueueError> {
        let envelope: Envelope = serde_json::from_slice(bytes)?;
        if envelope.attempts == 0 {
            return Err(QueueError::Serialization(format!(
                "作业{}的尝试次数为 0",
                envelope.id
            )));
        }
        Ok(envelope)
    }

    /// 解析作业数据
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, QueueError> {
        Ok(T::deserialize(&self.payload)?)
    }
}
