//! # **jobq** 错误定义

use crate::job::JobState;
use thiserror::Error;
use tokio::time::Duration;
use uuid::Uuid;

/// 队列错误枚举
#[derive(Debug, Error)]
pub enum QueueError {
    /// 无法连接代理
    #[error("连接代理失败：{0}")]
    Connection(String),
    /// 发布消息失败
    #[error("发布消息失败：{0}")]
    Publish(String),
    /// 拉取消息失败
    #[error("拉取消息失败：{0}")]
    Fetch(String),
    /// 提交偏移量失败
    #[error("提交偏移量失败：{0}")]
    Commit(String),
    /// 作业已处于终态
    #[error("作业{job_id}已处于终态：{state}")]
    AlreadyResolved {
        /// 作业 Id
        job_id: Uuid,
        /// 当前状态
        state: JobState,
    },
    /// 信封编解码错误
    #[error("信封编解码错误：{0}")]
    Serialization(String),
    /// 未注册的处理器
    #[error("未注册的处理器：{0}")]
    UnknownHandler(String),
    /// 未注册的驱动
    #[error("未注册的驱动：{0}")]
    UnknownDriver(String),
    /// 未配置的连接
    #[error("未配置的连接：{0}")]
    UnknownConnection(String),
    /// 配置错误
    #[error("{0}")]
    Config(#[from] ConfigError),
}

impl From<serde_json::Error> for QueueError {
    fn from(e: serde_json::Error) -> Self {
        QueueError::Serialization(e.to_string())
    }
}

impl QueueError {
    /// 错误类别，用于失败报告
    pub fn kind(&self) -> FailureKind {
        match self {
            QueueError::Connection(_) => FailureKind::Connection,
            QueueError::Publish(_) => FailureKind::Publish,
            QueueError::Fetch(_) | QueueError::Commit(_) => FailureKind::Fetch,
            QueueError::Serialization(_) => FailureKind::Serialization,
            _ => FailureKind::Job,
        }
    }
}

/// 配置错误枚举
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 加载配置失败
    #[error("加载配置失败：{0}")]
    Load(#[from] config::ConfigError),
    /// 配置验证失败
    #[error("配置'{section}.{key}'验证失败：{message}")]
    ValidationError {
        /// 配置节
        section: String,
        /// 配置键
        key: String,
        /// 错误信息
        message: String,
    },
}

/// 作业处理器错误
#[derive(Debug, Error)]
pub enum HandlerError {
    /// 可重试错误，按最大尝试次数重新发布
    #[error("可重试错误：{0}")]
    Retry(String),
    /// 释放作业，延迟后重新投递，不计尝试次数
    #[error("释放作业，延迟{0:?}")]
    Release(Duration),
    /// 不可恢复错误
    #[error("不可恢复错误：{0}")]
    Fatal(String),
}

/// 失败类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// 连接错误
    Connection,
    /// 发布错误
    Publish,
    /// 拉取错误
    Fetch,
    /// 信封无法解码
    Serialization,
    /// 作业失败
    Job,
}

/// 失败报告，经由队列的失败通道广播
#[derive(Debug, Clone)]
pub struct FailureReport {
    /// 失败类别
    pub kind: FailureKind,
    /// 主题
    pub topic: String,
    /// 作业 Id，信封无法解码时为空
    pub job_id: Option<Uuid>,
    /// 错误详情
    pub error: String,
}
