//! # 日志代理客户端特征

use crate::errors::QueueError;
use std::{fmt, future::Future};
use tokio::time::Duration;

/// 消息在日志中的位置
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Position {
    /// 主题
    pub topic: String,
    /// 分区
    pub partition: i32,
    /// 偏移量
    pub offset: i64,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}@{}", self.topic, self.partition, self.offset)
    }
}

/// 待发布的消息
#[derive(Debug, Clone, Copy)]
pub struct Outgoing<'a> {
    /// 消息键
    pub key: &'a [u8],
    /// 消息体
    pub payload: &'a [u8],
    /// 最早可处理时刻，Unix 毫秒
    pub not_before: Option<i64>,
}

/// 拉取到的消息
#[derive(Debug, Clone)]
pub struct Incoming {
    /// 位置
    pub position: Position,
    /// 消息体
    pub payload: Vec<u8>,
    /// 最早可处理时刻，Unix 毫秒
    pub not_before: Option<i64>,
}

/// 日志代理客户端特征
///
/// 实现者持有一个长期生产者，以及每个主题一个长期订阅的消费者；
/// 同一消费者上的偏移量簿记须互斥；提交须按确认顺序串行，提交位置不回退。
pub trait Broker: Send + Sync + 'static {
    /// 发布消息，待代理确认后返回位置
    fn publish(
        &self,
        topic: &str,
        record: Outgoing<'_>,
    ) -> impl Future<Output = Result<Position, QueueError>> + Send;

    /// 拉取下一条消息，超时返回 `None`
    fn fetch(
        &self,
        topic: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<Option<Incoming>, QueueError>> + Send;

    /// 确认位置，并提交连续已决的偏移量
    fn commit(&self, position: &Position) -> impl Future<Output = Result<(), QueueError>> + Send;

    /// 不提交偏移量，延迟后重新投递
    fn requeue(
        &self,
        position: &Position,
        delay: Duration,
    ) -> impl Future<Output = Result<(), QueueError>> + Send;

    /// 标记位置已决但不提交
    fn discard(&self, position: &Position) -> impl Future<Output = Result<(), QueueError>> + Send;

    /// 关闭所有连接
    fn close(&self) -> impl Future<Output = ()> + Send;
}
