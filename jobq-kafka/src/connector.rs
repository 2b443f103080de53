//! Kafka 驱动连接器

use crate::{KafkaQueue, broker::KafkaBroker, config::KafkaConfig};
use futures::future::BoxFuture;
use jobq::{
    config::ConnectionConfig, connector::Connector, errors::QueueError, handler::HandlerRegistry,
    queue::Queue,
};
use std::sync::Arc;

/// 驱动名称
pub const DRIVER: &str = "kafka";

/// Kafka 驱动连接器，按驱动名称 `kafka` 注册
#[derive(Debug, Default, Clone, Copy)]
pub struct KafkaConnector;

impl Connector for KafkaConnector {
    fn connect<'a>(
        &'a self,
        name: &'a str,
        config: &'a ConnectionConfig,
        handlers: Arc<HandlerRegistry>,
    ) -> BoxFuture<'a, Result<Arc<dyn Queue>, QueueError>> {
        Box::pin(async move {
            let broker = KafkaBroker::connect(KafkaConfig::from(config)).await?;
            let queue: Arc<dyn Queue> = Arc::new(KafkaQueue::new(name, broker, config, handlers));
            Ok(queue)
        })
    }
}
