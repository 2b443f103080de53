//! # 投递单元
//!
//! `pop` 返回的作业句柄，对应一条已拉取、未决的消息。
//! 恰好调用一次终结操作（确认、释放、失败）；再次调用返回 [`QueueError::AlreadyResolved`]。

use crate::{
    broker::{Broker, Incoming, Position},
    envelope::Envelope,
    errors::{FailureKind, QueueError},
    queue::Shared,
};
use futures::future::BoxFuture;
use std::{fmt, sync::Arc};
use tokio::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// 作业状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// 已拉取
    Fetched,
    /// 已确认
    Acknowledged,
    /// 已释放
    Released,
    /// 已失败
    Failed,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Fetched => write!(f, "已拉取"),
            JobState::Acknowledged => write!(f, "已确认"),
            JobState::Released => write!(f, "已释放"),
            JobState::Failed => write!(f, "已失败"),
        }
    }
}

/// 作业特征
pub trait Job: Send {
    /// 作业 Id
    fn job_id(&self) -> Uuid;
    /// 原始消息体
    fn raw_body(&self) -> &[u8];
    /// 信封
    fn envelope(&self) -> &Envelope;
    /// 尝试次数，只读取信封元数据
    fn attempts(&self) -> u32 {
        self.envelope().attempts
    }
    /// 来源主题
    fn queue(&self) -> &str;
    /// 消息位置
    fn position(&self) -> &Position;
    /// 当前状态
    fn state(&self) -> JobState;
    /// 确认作业，提交偏移量
    fn acknowledge(&mut self) -> BoxFuture<'_, Result<(), QueueError>>;
    /// 释放作业，延迟后重新投递，不增加尝试次数
    fn release(&mut self, delay: Duration) -> BoxFuture<'_, Result<(), QueueError>>;
    /// 作业失败，不提交偏移量，并回调处理器
    fn fail<'a>(&'a mut self, error: &'a str) -> BoxFuture<'a, Result<(), QueueError>>;
}

/// 基于日志代理的作业
pub struct BrokerJob<B: Broker> {
    shared: Arc<Shared<B>>,
    position: Position,
    raw: Vec<u8>,
    envelope: Envelope,
    state: JobState,
}

impl<B: Broker> BrokerJob<B> {
    pub(crate) fn new(shared: Arc<Shared<B>>, incoming: Incoming, envelope: Envelope) -> Self {
        Self {
            shared,
            position: incoming.position,
            raw: incoming.payload,
            envelope,
            state: JobState::Fetched,
        }
    }

    fn ensure_fetched(&self) -> Result<(), QueueError> {
        if self.state == JobState::Fetched {
            return Ok(());
        }
        error!(
            job_id = %self.envelope.id,
            "作业已处于终态{}，拒绝再次结算",
            self.state
        );
        Err(QueueError::AlreadyResolved {
            job_id: self.envelope.id,
            state: self.state,
        })
    }

    #[instrument(name = "acknowledge_job", skip_all, fields(job_id = %self.envelope.id, position = %self.position))]
    async fn commit(&mut self) -> Result<(), QueueError> {
        self.ensure_fetched()?;
        self.shared.broker.commit(&self.position).await?;
        self.state = JobState::Acknowledged;
        debug!("作业已确认");
        Ok(())
    }

    #[instrument(name = "release_job", skip(self), fields(job_id = %self.envelope.id, position = %self.position))]
    async fn requeue(&mut self, delay: Duration) -> Result<(), QueueError> {
        self.ensure_fetched()?;
        self.shared.broker.requeue(&self.position, delay).await?;
        self.state = JobState::Released;
        info!(attempts = self.envelope.attempts, "作业已释放");
        Ok(())
    }

    #[instrument(name = "fail_job", skip(self), fields(job_id = %self.envelope.id, position = %self.position))]
    async fn reject(&mut self, error: &str) -> Result<(), QueueError> {
        self.ensure_fetched()?;
        self.shared.broker.discard(&self.position).await?;
        self.state = JobState::Failed;
        error!(attempts = self.envelope.attempts, "作业失败：{error}");

        let shared = &self.shared;
        shared.report(
            FailureKind::Job,
            &self.position.topic,
            Some(self.envelope.id),
            error.to_string(),
        );
        shared
            .dead_letter(&self.position, error, Some(&self.envelope), None)
            .await;
        let handler = shared.handlers.get(&self.envelope.handler)?;
        handler.failed(&self.envelope, error).await;
        Ok(())
    }
}

impl<B: Broker> Job for BrokerJob<B> {
    fn job_id(&self) -> Uuid {
        self.envelope.id
    }

    fn raw_body(&self) -> &[u8] {
        &self.raw
    }

    fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    fn queue(&self) -> &str {
        &self.position.topic
    }

    fn position(&self) -> &Position {
        &self.position
    }

    fn state(&self) -> JobState {
        self.state
    }

    fn acknowledge(&mut self) -> BoxFuture<'_, Result<(), QueueError>> {
        Box::pin(self.commit())
    }

    fn release(&mut self, delay: Duration) -> BoxFuture<'_, Result<(), QueueError>> {
        Box::pin(self.requeue(delay))
    }

    fn fail<'a>(&'a mut self, error: &'a str) -> BoxFuture<'a, Result<(), QueueError>> {
        Box::pin(self.reject(error))
    }
}

impl<B: Broker> Drop for BrokerJob<B> {
    fn drop(&mut self) {
        if self.state == JobState::Fetched {
            warn!(
                job_id = %self.envelope.id,
                "作业未结算即被丢弃，{} 将在过期后重新投递",
                self.position
            );
        }
    }
}
