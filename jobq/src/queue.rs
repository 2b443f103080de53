//! # 队列驱动

use crate::{
    broker::{Broker, Incoming, Outgoing, Position},
    config::{ConnectionConfig, DelayStrategy},
    envelope::Envelope,
    errors::{FailureKind, FailureReport, QueueError},
    handler::HandlerRegistry,
    job::{BrokerJob, Job},
    offsets::due_after,
};
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use std::{
    borrow::Cow,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};
use tokio::{
    sync::broadcast,
    time::{Duration, Instant},
};
use tracing::{Span, debug, error, info, instrument, warn};
use uuid::Uuid;

/// 队列特征，供工作者与宿主应用使用
pub trait Queue: Send + Sync {
    /// 连接名称
    fn connection_name(&self) -> &str;

    /// 默认主题
    fn default_topic(&self) -> &str;

    /// 发布作业，返回作业 Id
    fn push<'a>(
        &'a self,
        handler: &'a str,
        payload: Value,
        topic: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Uuid, QueueError>>;

    /// 发布已序列化的信封，返回作业 Id
    fn push_raw<'a>(
        &'a self,
        payload: &'a [u8],
        topic: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Uuid, QueueError>>;

    /// 延迟发布作业，是否遵守延迟取决于延迟策略
    fn later<'a>(
        &'a self,
        delay: Duration,
        handler: &'a str,
        payload: Value,
        topic: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Uuid, QueueError>>;

    /// 延迟发布已序列化的信封
    fn later_raw<'a>(
        &'a self,
        delay: Duration,
        payload: &'a [u8],
        topic: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Uuid, QueueError>>;

    /// 拉取一个作业，超时或代理错误时返回 `None`
    fn pop<'a>(
        &'a self,
        topic: Option<&'a str>,
        timeout: Duration,
    ) -> BoxFuture<'a, Option<Box<dyn Job>>>;

    /// 队列深度，日志代理不提供，恒为 `None`
    fn size(&self, topic: Option<&str>) -> Option<u64>;

    /// 订阅失败通道
    fn subscribe_failures(&self) -> broadcast::Receiver<FailureReport>;

    /// 关闭队列
    fn close(&self) -> BoxFuture<'_, ()>;
}

#[derive(Serialize)]
struct DeadLetter<'a> {
    topic: &'a str,
    partition: i32,
    offset: i64,
    error: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    envelope: Option<&'a Envelope>,
    #[serde(skip_serializing_if = "Option::is_none")]
    raw: Option<Cow<'a, str>>,
}

pub(crate) struct Shared<B: Broker> {
    pub(crate) name: String,
    pub(crate) topic: String,
    pub(crate) broker: B,
    pub(crate) handlers: Arc<HandlerRegistry>,
    delay: DelayStrategy,
    failed_topic: Option<String>,
    failures: broadcast::Sender<FailureReport>,
}

impl<B: Broker> Shared<B> {
    pub(crate) fn report(&self, kind: FailureKind, topic: &str, job_id: Option<Uuid>, error: String) {
        let _ = self.failures.send(FailureReport {
            kind,
            topic: topic.to_string(),
            job_id,
            error,
        });
    }

    pub(crate) async fn dead_letter(
        &self,
        position: &Position,
        error: &str,
        envelope: Option<&Envelope>,
        raw: Option<&[u8]>,
    ) {
        let Some(failed_topic) = &self.failed_topic else {
            return;
        };
        let letter = DeadLetter {
            topic: &position.topic,
            partition: position.partition,
            offset: position.offset,
            error,
            envelope,
            raw: raw.map(String::from_utf8_lossy),
        };
        let payload = match serde_json::to_vec(&letter) {
            Ok(p) => p,
            Err(e) => {
                warn!("死信序列化失败：{e}");
                return;
            }
        };
        let key = envelope.map(|e| e.id.as_bytes().as_slice()).unwrap_or_default();
        let record = Outgoing {
            key,
            payload: &payload,
            not_before: None,
        };
        match self.broker.publish(failed_topic, record).await {
            Ok(at) => debug!("{position} 转入死信 {at}"),
            Err(e) => warn!("{position} 转入死信主题{failed_topic}失败：{e}"),
        }
    }
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(millis)
        .unwrap_or_default()
}

/// 距 `not_before` 还需等待的时长，已到期时为 `None`
fn wait_until(not_before: i64, now: i64) -> Option<Duration> {
    let wait = not_before.saturating_sub(now);
    (wait > 0).then(|| Duration::from_millis(wait.unsigned_abs()))
}

/// 基于日志代理的队列驱动
pub struct BrokerQueue<B: Broker> {
    shared: Arc<Shared<B>>,
}

impl<B: Broker> BrokerQueue<B> {
    /// 构造队列驱动
    pub fn new(
        name: impl Into<String>,
        broker: B,
        config: &ConnectionConfig,
        handlers: Arc<HandlerRegistry>,
    ) -> Self {
        let (failures, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                topic: config.topic.clone(),
                broker,
                handlers,
                delay: config.delay,
                failed_topic: config.failed_topic.clone(),
                failures,
            }),
        }
    }

    /// 底层代理客户端
    pub fn broker(&self) -> &B {
        &self.shared.broker
    }

    fn not_before(&self, delay: Duration) -> Option<i64> {
        match self.shared.delay {
            DelayStrategy::Immediate => {
                if !delay.is_zero() {
                    debug!("延迟策略为立即发布，忽略{delay:?}延迟");
                }
                None
            }
            DelayStrategy::NotBefore => Some(now_millis().saturating_add(millis(delay))),
        }
    }

    #[instrument(name = "push_job", skip_all, fields(topic, job_id))]
    async fn publish(
        &self,
        payload: &[u8],
        topic: Option<&str>,
        not_before: Option<i64>,
    ) -> Result<Uuid, QueueError> {
        let topic = topic.unwrap_or(&self.shared.topic);
        Span::current().record("topic", topic);
        let envelope = Envelope::from_bytes(payload)?;
        Span::current().record("job_id", tracing::field::display(envelope.id));
        let record = Outgoing {
            key: envelope.id.as_bytes(),
            payload,
            not_before,
        };
        let position = self.shared.broker.publish(topic, record).await?;
        info!(topic, payload_size = payload.len(), "消息已发送");
        debug!("作业写入 {position}");
        Ok(envelope.id)
    }

    #[instrument(name = "pop_job", skip(self))]
    async fn receive(&self, topic: Option<&str>, timeout: Duration) -> Option<Box<dyn Job>> {
        let topic = topic.unwrap_or(&self.shared.topic);
        let deadline = due_after(Instant::now(), timeout);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let incoming = match self.shared.broker.fetch(topic, remaining).await {
                Ok(Some(incoming)) => incoming,
                Ok(None) => return None,
                Err(e) => {
                    error!(topic, error = %e, "拉取消息失败");
                    self.shared.report(e.kind(), topic, None, e.to_string());
                    return None;
                }
            };

            if let Some(delay) = incoming.not_before.and_then(|nb| wait_until(nb, now_millis())) {
                debug!("{} 未到处理时刻，推迟{delay:?}", incoming.position);
                if let Err(e) = self.shared.broker.requeue(&incoming.position, delay).await {
                    error!(topic, error = %e, "推迟消息失败");
                    self.shared.report(e.kind(), topic, None, e.to_string());
                    return None;
                }
            } else {
                match Envelope::from_bytes(&incoming.payload) {
                    Ok(envelope) => {
                        debug!(job_id = %envelope.id, "收到消息 {}", incoming.position);
                        let job: Box<dyn Job> = Box::new(BrokerJob::new(
                            Arc::clone(&self.shared),
                            incoming,
                            envelope,
                        ));
                        return Some(job);
                    }
                    Err(e) => self.reject(incoming, e).await,
                }
            }

            if Instant::now() >= deadline {
                return None;
            }
        }
    }

    async fn reject(&self, incoming: Incoming, error: QueueError) {
        let position = &incoming.position;
        let detail = error.to_string();
        error!(topic = %position.topic, error = %detail, "{position} 信封无法解码");
        self.shared
            .report(error.kind(), &position.topic, None, detail.clone());
        self.shared
            .dead_letter(position, &detail, None, Some(&incoming.payload))
            .await;
        if let Err(e) = self.shared.broker.discard(position).await {
            warn!("{position} 标记失败：{e}");
        }
    }
}

impl<B: Broker> Queue for BrokerQueue<B> {
    fn connection_name(&self) -> &str {
        &self.shared.name
    }

    fn default_topic(&self) -> &str {
        &self.shared.topic
    }

    fn push<'a>(
        &'a self,
        handler: &'a str,
        payload: Value,
        topic: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Uuid, QueueError>> {
        Box::pin(async move {
            let bytes = Envelope::new(handler, payload).to_bytes()?;
            self.publish(&bytes, topic, None).await
        })
    }

    fn push_raw<'a>(
        &'a self,
        payload: &'a [u8],
        topic: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Uuid, QueueError>> {
        Box::pin(self.publish(payload, topic, None))
    }

    fn later<'a>(
        &'a self,
        delay: Duration,
        handler: &'a str,
        payload: Value,
        topic: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Uuid, QueueError>> {
        Box::pin(async move {
            let bytes = Envelope::new(handler, payload).to_bytes()?;
            self.publish(&bytes, topic, self.not_before(delay)).await
        })
    }

    fn later_raw<'a>(
        &'a self,
        delay: Duration,
        payload: &'a [u8],
        topic: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Uuid, QueueError>> {
        Box::pin(self.publish(payload, topic, self.not_before(delay)))
    }

    fn pop<'a>(
        &'a self,
        topic: Option<&'a str>,
        timeout: Duration,
    ) -> BoxFuture<'a, Option<Box<dyn Job>>> {
        Box::pin(self.receive(topic, timeout))
    }

    fn size(&self, topic: Option<&str>) -> Option<u64> {
        debug!(
            topic = topic.unwrap_or(&self.shared.topic),
            "日志代理不提供队列深度"
        );
        None
    }

    fn subscribe_failures(&self) -> broadcast::Receiver<FailureReport> {
        self.shared.failures.subscribe()
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            info!(connection = %self.shared.name, "关闭队列");
            self.shared.broker.close().await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_until_saturates() {
        assert_eq!(wait_until(i64::MIN, i64::MAX), None);
        assert_eq!(wait_until(i64::MAX, i64::MIN), Some(Duration::from_millis(i64::MAX as u64)));
        assert_eq!(wait_until(1_000, 1_000), None);
        assert_eq!(wait_until(1_250, 1_000), Some(Duration::from_millis(250)));
    }

    #[test]
    fn huge_delay_saturates_millis() {
        assert_eq!(millis(Duration::MAX), i64::MAX);
        assert_eq!(millis(Duration::from_secs(2)), 2_000);
    }
}
