//! 主题消费者
//!
//! 每个主题一个长期订阅的消费者，跨多次拉取保持分区偏移量状态。
//! 释放的消息不阻塞分区：后续消息照常交付，到期后回退分区读取位置重读。
//! 回退与同步提交是阻塞的 rdkafka 调用，在阻塞线程池执行，不持有簿记锁。

use crate::{BINCODE_HEADER, NOT_BEFORE_HEADER, config::KafkaConfig};
use ahash::AHashMap;
use jobq::{
    broker::{Incoming, Position},
    errors::QueueError,
    offsets::{PartitionOffsets, Verdict, due_after},
};
use rdkafka::{
    Message, Offset, TopicPartitionList,
    consumer::{CommitMode, Consumer, StreamConsumer},
    message::{BorrowedMessage, Headers},
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::{
    sync,
    task,
    time::{Duration, Instant, timeout_at},
};
use tracing::{debug, info, warn};

/// 主题各分区的偏移量簿记
#[derive(Debug, Default)]
pub(crate) struct Ledger {
    partitions: AHashMap<i32, PartitionOffsets>,
}

impl Ledger {
    fn offsets(&mut self, partition: i32) -> &mut PartitionOffsets {
        self.partitions.entry(partition).or_default()
    }

    /// 返回需回退的分区偏移量，以及最早的待重投到期时刻
    pub(crate) fn maintain(
        &mut self,
        now: Instant,
        retry_after: Duration,
    ) -> (Vec<(i32, i64)>, Option<Instant>) {
        let mut rewinds = Vec::new();
        let mut next_due: Option<Instant> = None;
        for (partition, offsets) in self.partitions.iter_mut() {
            if let Some(offset) = offsets.maintain(now, retry_after) {
                rewinds.push((*partition, offset));
            }
            if let Some(due) = offsets.next_due() {
                next_due = Some(next_due.map_or(due, |d| d.min(due)));
            }
        }
        (rewinds, next_due)
    }

    pub(crate) fn fetched(&mut self, partition: i32, offset: i64, now: Instant) -> Verdict {
        self.offsets(partition).fetched(offset, now)
    }

    pub(crate) fn acknowledge(&mut self, partition: i32, offset: i64) -> Option<i64> {
        self.offsets(partition).acknowledge(offset)
    }

    pub(crate) fn confirm(&mut self, partition: i32, position: i64) {
        self.offsets(partition).confirm(position);
    }

    pub(crate) fn release(
        &mut self,
        partition: i32,
        offset: i64,
        delay: Duration,
        now: Instant,
    ) -> Option<i64> {
        self.offsets(partition).release(offset, delay, now)
    }

    pub(crate) fn fail(&mut self, partition: i32, offset: i64) {
        self.offsets(partition).fail(offset);
    }
}

/// 解码 `not_before` 消息头，无法解码时记录警告并忽略
pub(crate) fn decode_not_before(value: &[u8], position: &Position) -> Option<i64> {
    match bincode::decode_from_slice::<i64, _>(value, BINCODE_HEADER) {
        Ok((not_before, _)) => Some(not_before),
        Err(e) => {
            warn!("{position} 的'{NOT_BEFORE_HEADER}'消息头无法解码：{e}");
            None
        }
    }
}

pub(crate) struct TopicConsumer {
    topic: String,
    consumer: StreamConsumer,
    commit_mode: CommitMode,
    timeout: Duration,
    retry_after: Duration,
    ledger: Mutex<Ledger>,
    committing: sync::Mutex<()>,
}

impl TopicConsumer {
    pub(crate) fn new(topic: &str, config: &KafkaConfig) -> Result<Self, QueueError> {
        let consumer: StreamConsumer = config
            .consumer_config()
            .create()
            .map_err(|e| QueueError::Connection(format!("消费者创建失败：{e}")))?;
        consumer
            .subscribe(&[topic])
            .map_err(|e| QueueError::Connection(format!("订阅主题{topic}失败：{e}")))?;
        info!("消费组{}成功订阅{topic}主题", config.group);
        Ok(Self {
            topic: topic.to_string(),
            consumer,
            commit_mode: config.commit,
            timeout: config.timeout,
            retry_after: config.retry_after,
            ledger: Mutex::new(Ledger::default()),
            committing: sync::Mutex::new(()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 在阻塞线程池执行 rdkafka 的阻塞调用
    async fn blocking<T, F>(self: &Arc<Self>, f: F) -> Result<T, QueueError>
    where
        T: Send + 'static,
        F: FnOnce(&Self) -> Result<T, QueueError> + Send + 'static,
    {
        let this = Arc::clone(self);
        task::spawn_blocking(move || f(&this))
            .await
            .map_err(|e| QueueError::Fetch(format!("阻塞任务中断：{e}")))?
    }

    pub(crate) async fn fetch(
        self: &Arc<Self>,
        timeout: Duration,
    ) -> Result<Option<Incoming>, QueueError> {
        let deadline = due_after(Instant::now(), timeout);
        loop {
            let now = Instant::now();
            let (rewinds, next_due) = self.lock().maintain(now, self.retry_after);
            if !rewinds.is_empty() {
                self.blocking(move |this| {
                    rewinds
                        .iter()
                        .try_for_each(|&(partition, offset)| this.seek(partition, offset))
                })
                .await?;
            }
            if now >= deadline {
                return Ok(None);
            }

            let wake = next_due.map_or(deadline, |due| due.min(deadline));
            let incoming = match timeout_at(wake, self.consumer.recv()).await {
                Err(_) => continue,
                Ok(Err(e)) => return Err(QueueError::Fetch(e.to_string())),
                Ok(Ok(msg)) => Self::incoming(&msg),
            };

            let Position {
                partition, offset, ..
            } = incoming.position;
            let verdict = self.lock().fetched(partition, offset, Instant::now());
            match verdict {
                Verdict::Deliver => return Ok(Some(incoming)),
                Verdict::Skip => debug!("跳过未决、已决或未到期消息 {}", incoming.position),
            }
        }
    }

    pub(crate) async fn commit(self: &Arc<Self>, position: &Position) -> Result<(), QueueError> {
        let _serial = self.committing.lock().await;
        let partition = position.partition;
        let next = self.lock().acknowledge(partition, position.offset);
        let Some(next) = next else {
            return Ok(());
        };
        self.blocking(move |this| this.commit_offset(partition, next))
            .await?;
        self.lock().confirm(partition, next);
        Ok(())
    }

    pub(crate) async fn requeue(
        self: &Arc<Self>,
        position: &Position,
        delay: Duration,
    ) -> Result<(), QueueError> {
        let partition = position.partition;
        let rewind = self
            .lock()
            .release(partition, position.offset, delay, Instant::now());
        if let Some(offset) = rewind {
            self.blocking(move |this| this.seek(partition, offset))
                .await?;
        }
        Ok(())
    }

    pub(crate) fn discard(&self, position: &Position) {
        self.lock().fail(position.partition, position.offset);
    }

    pub(crate) fn close(&self) {
        self.consumer.unsubscribe();
        info!("取消订阅{}主题", self.topic);
    }

    fn commit_offset(&self, partition: i32, next: i64) -> Result<(), QueueError> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&self.topic, partition, Offset::Offset(next))
            .map_err(|e| QueueError::Commit(e.to_string()))?;
        self.consumer
            .commit(&tpl, self.commit_mode)
            .map_err(|e| QueueError::Commit(e.to_string()))?;
        debug!("提交{}|{partition}偏移量{next}", self.topic);
        Ok(())
    }

    fn seek(&self, partition: i32, offset: i64) -> Result<(), QueueError> {
        self.consumer
            .seek(&self.topic, partition, Offset::Offset(offset), self.timeout)
            .map_err(|e| QueueError::Fetch(format!("{}|{partition} 回退失败：{e}", self.topic)))?;
        debug!("{}|{partition} 回退至{offset}", self.topic);
        Ok(())
    }

    fn incoming(msg: &BorrowedMessage<'_>) -> Incoming {
        let position = Position {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
        };
        let not_before = msg
            .headers()
            .and_then(|h| h.iter().find(|h| h.key == NOT_BEFORE_HEADER))
            .and_then(|h| h.value)
            .and_then(|value| decode_not_before(value, &position));
        Incoming {
            payload: msg.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            position,
            not_before,
        }
    }
}
