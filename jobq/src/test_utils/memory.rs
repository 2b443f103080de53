//! 内存日志代理
//!
//! 分区、偏移量、消费组提交语义与 Kafka 一致；消费会话按主题惰性创建，
//! 起始位置取消费组已提交的偏移量。

use crate::{
    broker::{Broker, Incoming, Outgoing, Position},
    config::ConnectionConfig,
    connector::Connector,
    errors::QueueError,
    handler::HandlerRegistry,
    offsets::{PartitionOffsets, Verdict, due_after},
    queue::{BrokerQueue, Queue},
};
use ahash::AHashMap;
use futures::future::BoxFuture;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::{
    sync::{self, Notify},
    time::{Duration, Instant, timeout_at},
};

struct Stored {
    payload: Vec<u8>,
    not_before: Option<i64>,
}

#[derive(Default)]
struct LogState {
    topics: AHashMap<String, Vec<Vec<Stored>>>,
    committed: AHashMap<(String, String, i32), i64>,
}

/// 内存日志，可被多个代理（模拟多个进程）共享
pub struct MemoryLog {
    partitions: usize,
    state: Mutex<LogState>,
    arrived: Notify,
}

impl MemoryLog {
    /// 构造指定分区数的日志
    pub fn new(partitions: usize) -> Arc<Self> {
        Arc::new(Self {
            partitions: partitions.max(1),
            state: Mutex::new(LogState::default()),
            arrived: Notify::new(),
        })
    }

    /// 消费组在分区上已提交的位置
    pub fn committed(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.lock()
            .committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
    }

    /// 主题消息总数
    pub fn len(&self, topic: &str) -> usize {
        self.lock()
            .topics
            .get(topic)
            .map_or(0, |ps| ps.iter().map(Vec::len).sum())
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn append(&self, topic: &str, record: Outgoing<'_>) -> Position {
        let partition = record.key.iter().map(|b| *b as usize).sum::<usize>() % self.partitions;
        let offset = {
            let mut state = self.lock();
            let partitions = state
                .topics
                .entry(topic.to_string())
                .or_insert_with(|| (0..self.partitions).map(|_| Vec::new()).collect());
            let log = &mut partitions[partition];
            log.push(Stored {
                payload: record.payload.to_vec(),
                not_before: record.not_before,
            });
            log.len() as i64 - 1
        };
        self.arrived.notify_waiters();
        Position {
            topic: topic.to_string(),
            partition: partition as i32,
            offset,
        }
    }

    fn read(&self, topic: &str, partition: i32, offset: i64) -> Option<(Vec<u8>, Option<i64>)> {
        let state = self.lock();
        let stored = state
            .topics
            .get(topic)?
            .get(partition as usize)?
            .get(usize::try_from(offset).ok()?)?;
        Some((stored.payload.clone(), stored.not_before))
    }

    fn commit(&self, group: &str, topic: &str, partition: i32, position: i64) {
        let mut state = self.lock();
        let committed = state
            .committed
            .entry((group.to_string(), topic.to_string(), partition))
            .or_insert(position);
        *committed = (*committed).max(position);
    }
}

#[derive(Default)]
struct Session {
    cursors: AHashMap<i32, i64>,
    offsets: AHashMap<i32, PartitionOffsets>,
    next: usize,
}

impl Session {
    fn next_due(&self) -> Option<Instant> {
        self.offsets.values().filter_map(PartitionOffsets::next_due).min()
    }
}

/// 内存代理：一个消费组成员
pub struct MemoryBroker {
    log: Arc<MemoryLog>,
    group: String,
    retry_after: Duration,
    sessions: sync::Mutex<AHashMap<String, Session>>,
    fetch_fault: Mutex<Option<String>>,
    publish_fault: Mutex<Option<String>>,
    commit_fault: Mutex<Option<String>>,
}

impl MemoryBroker {
    /// 构造消费组成员
    pub fn new(log: Arc<MemoryLog>, group: impl Into<String>, retry_after: Duration) -> Self {
        Self {
            log,
            group: group.into(),
            retry_after,
            sessions: sync::Mutex::new(AHashMap::new()),
            fetch_fault: Mutex::new(None),
            publish_fault: Mutex::new(None),
            commit_fault: Mutex::new(None),
        }
    }

    /// 下一次拉取返回错误
    pub fn fail_next_fetch(&self, error: impl Into<String>) {
        *self.fetch_fault.lock().unwrap_or_else(PoisonError::into_inner) = Some(error.into());
    }

    /// 下一次发布返回错误
    pub fn fail_next_publish(&self, error: impl Into<String>) {
        *self.publish_fault.lock().unwrap_or_else(PoisonError::into_inner) = Some(error.into());
    }

    /// 下一次提交返回错误
    pub fn fail_next_commit(&self, error: impl Into<String>) {
        *self.commit_fault.lock().unwrap_or_else(PoisonError::into_inner) = Some(error.into());
    }

    fn take_fault(fault: &Mutex<Option<String>>) -> Option<String> {
        fault.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    fn cursor(&self, session: &mut Session, topic: &str, partition: i32) -> i64 {
        *session
            .cursors
            .entry(partition)
            .or_insert_with(|| self.log.committed(&self.group, topic, partition).unwrap_or(0))
    }

    fn try_fetch(&self, session: &mut Session, topic: &str, now: Instant) -> Option<Incoming> {
        let partitions = self.log.partitions;
        for partition in 0..partitions as i32 {
            let offsets = session.offsets.entry(partition).or_default();
            if let Some(rewind) = offsets.maintain(now, self.retry_after) {
                session.cursors.insert(partition, rewind);
            }
        }

        for i in 0..partitions {
            let partition = ((session.next + i) % partitions) as i32;
            loop {
                let offset = self.cursor(session, topic, partition);
                let Some((payload, not_before)) = self.log.read(topic, partition, offset) else {
                    break;
                };
                match session.offsets.entry(partition).or_default().fetched(offset, now) {
                    Verdict::Deliver => {
                        session.cursors.insert(partition, offset + 1);
                        session.next = (partition as usize + 1) % partitions;
                        return Some(Incoming {
                            position: Position {
                                topic: topic.to_string(),
                                partition,
                                offset,
                            },
                            payload,
                            not_before,
                        });
                    }
                    Verdict::Skip => {
                        session.cursors.insert(partition, offset + 1);
                    }
                }
            }
        }
        None
    }
}

impl Broker for MemoryBroker {
    async fn publish(&self, topic: &str, record: Outgoing<'_>) -> Result<Position, QueueError> {
        if let Some(e) = Self::take_fault(&self.publish_fault) {
            return Err(QueueError::Publish(e));
        }
        Ok(self.log.append(topic, record))
    }

    async fn fetch(&self, topic: &str, timeout: Duration) -> Result<Option<Incoming>, QueueError> {
        if let Some(e) = Self::take_fault(&self.fetch_fault) {
            return Err(QueueError::Fetch(e));
        }
        let deadline = due_after(Instant::now(), timeout);
        loop {
            let notified = self.log.arrived.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake = {
                let mut sessions = self.sessions.lock().await;
                let session = sessions.entry(topic.to_string()).or_default();
                let now = Instant::now();
                if let Some(incoming) = self.try_fetch(session, topic, now) {
                    return Ok(Some(incoming));
                }
                if now >= deadline {
                    return Ok(None);
                }
                session
                    .next_due()
                    .map_or(deadline, |due| due.min(deadline))
            };
            let _ = timeout_at(wake, notified).await;
        }
    }

    async fn commit(&self, position: &Position) -> Result<(), QueueError> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions.entry(position.topic.clone()).or_default();
        let offsets = session.offsets.entry(position.partition).or_default();
        if let Some(next) = offsets.acknowledge(position.offset) {
            if let Some(e) = Self::take_fault(&self.commit_fault) {
                return Err(QueueError::Commit(e));
            }
            self.log
                .commit(&self.group, &position.topic, position.partition, next);
            offsets.confirm(next);
        }
        Ok(())
    }

    async fn requeue(&self, position: &Position, delay: Duration) -> Result<(), QueueError> {
        let now = Instant::now();
        {
            let mut sessions = self.sessions.lock().await;
            let session = sessions.entry(position.topic.clone()).or_default();
            let offsets = session.offsets.entry(position.partition).or_default();
            if let Some(rewind) = offsets.release(position.offset, delay, now) {
                session.cursors.insert(position.partition, rewind);
            }
        }
        self.log.arrived.notify_waiters();
        Ok(())
    }

    async fn discard(&self, position: &Position) -> Result<(), QueueError> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions.entry(position.topic.clone()).or_default();
        session
            .offsets
            .entry(position.partition)
            .or_default()
            .fail(position.offset);
        Ok(())
    }

    async fn close(&self) {
        self.sessions.lock().await.clear();
    }
}

/// 内存驱动连接器，同一连接器构造的队列共享一份日志
pub struct MemoryConnector {
    log: Arc<MemoryLog>,
}

impl MemoryConnector {
    /// 以共享日志构造连接器
    pub fn new(log: Arc<MemoryLog>) -> Self {
        Self { log }
    }
}

impl Connector for MemoryConnector {
    fn connect<'a>(
        &'a self,
        name: &'a str,
        config: &'a ConnectionConfig,
        handlers: Arc<HandlerRegistry>,
    ) -> BoxFuture<'a, Result<Arc<dyn Queue>, QueueError>> {
        Box::pin(async move {
            let broker = MemoryBroker::new(
                Arc::clone(&self.log),
                config.consumer_group.clone(),
                config.retry_after(),
            );
            let queue: Arc<dyn Queue> = Arc::new(BrokerQueue::new(name, broker, config, handlers));
            Ok(queue)
        })
    }
}
