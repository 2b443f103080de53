//! Kafka 日志代理客户端

use crate::{
    BINCODE_HEADER, JOB_ID_HEADER, NOT_BEFORE_HEADER, config::KafkaConfig, consumer::TopicConsumer,
};
use ahash::AHashMap;
use jobq::{
    broker::{Broker, Incoming, Outgoing, Position},
    errors::QueueError,
};
use rdkafka::{
    message::{Header, OwnedHeaders},
    producer::{FutureProducer, FutureRecord, Producer, future_producer::Delivery},
};
use std::sync::Arc;
use tokio::{sync::Mutex, time::Duration};
use tracing::{debug, error, info, instrument};

/// Kafka 代理客户端：一个长期生产者，每个主题一个长期订阅的消费者
pub struct KafkaBroker {
    config: KafkaConfig,
    producer: FutureProducer,
    consumers: Mutex<AHashMap<String, Arc<TopicConsumer>>>,
}

impl KafkaBroker {
    /// 连接集群，确认代理可达并订阅默认主题
    #[instrument(name = "connect_kafka", skip_all, fields(bootstrap = %config.bootstrap))]
    pub async fn connect(config: KafkaConfig) -> Result<Self, QueueError> {
        let producer: FutureProducer = config
            .producer_config()
            .create()
            .map_err(|e| QueueError::Connection(format!("生产者创建失败：{e}")))?;
        producer
            .client()
            .fetch_metadata(None, config.timeout)
            .map_err(|e| {
                error!("获取集群元数据失败：{e}");
                QueueError::Connection(e.to_string())
            })?;
        info!("成功连接Kafka集群");

        let broker = Self {
            config,
            producer,
            consumers: Mutex::new(AHashMap::new()),
        };
        broker.consumer(&broker.config.topic).await?;
        Ok(broker)
    }

    /// 连接配置
    pub fn config(&self) -> &KafkaConfig {
        &self.config
    }

    async fn consumer(&self, topic: &str) -> Result<Arc<TopicConsumer>, QueueError> {
        let mut consumers = self.consumers.lock().await;
        if let Some(consumer) = consumers.get(topic) {
            return Ok(Arc::clone(consumer));
        }
        let consumer = Arc::new(TopicConsumer::new(topic, &self.config)?);
        consumers.insert(topic.to_string(), Arc::clone(&consumer));
        Ok(consumer)
    }
}

impl Broker for KafkaBroker {
    async fn publish(&self, topic: &str, record: Outgoing<'_>) -> Result<Position, QueueError> {
        let mut headers = OwnedHeaders::new_with_capacity(2);
        if !record.key.is_empty() {
            headers = headers.insert(Header {
                key: JOB_ID_HEADER,
                value: Some(record.key),
            });
        }
        let mut buf = [0u8; 8];
        if let Some(not_before) = record.not_before {
            let len = bincode::encode_into_slice(not_before, &mut buf, BINCODE_HEADER)
                .map_err(|e| QueueError::Serialization(e.to_string()))?;
            headers = headers.insert(Header {
                key: NOT_BEFORE_HEADER,
                value: Some(&buf[..len]),
            });
        }
        let message = FutureRecord::to(topic)
            .payload(record.payload)
            .key(record.key)
            .headers(headers);

        self.producer
            .send(message, self.config.timeout)
            .await
            .map_err(|(e, _)| QueueError::Publish(e.to_string()))
            .map(
                |Delivery {
                     partition,
                     offset,
                     timestamp: _,
                 }| {
                    debug!("消息写入{topic}分区{partition}偏移{offset}");
                    Position {
                        topic: topic.to_string(),
                        partition,
                        offset,
                    }
                },
            )
    }

    async fn fetch(&self, topic: &str, timeout: Duration) -> Result<Option<Incoming>, QueueError> {
        self.consumer(topic).await?.fetch(timeout).await
    }

    async fn commit(&self, position: &Position) -> Result<(), QueueError> {
        self.consumer(&position.topic).await?.commit(position).await
    }

    async fn requeue(&self, position: &Position, delay: Duration) -> Result<(), QueueError> {
        self.consumer(&position.topic)
            .await?
            .requeue(position, delay)
            .await
    }

    async fn discard(&self, position: &Position) -> Result<(), QueueError> {
        self.consumer(&position.topic).await?.discard(position);
        Ok(())
    }

    async fn close(&self) {
        let mut consumers = self.consumers.lock().await;
        for consumer in consumers.values() {
            consumer.close();
        }
        consumers.clear();
        if let Err(e) = self.producer.flush(self.config.timeout) {
            error!("生产者刷新失败：{e}");
        }
        info!("关闭Kafka连接");
    }
}
