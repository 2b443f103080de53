//! # 驱动连接器注册表
//!
//! 启动时以构造器一次性注册驱动，之后只读；工作者引导时按驱动名称查找。

use crate::{
    config::{ConnectionConfig, QueueConfig},
    errors::QueueError,
    handler::HandlerRegistry,
    queue::Queue,
};
use ahash::AHashMap;
use futures::future::BoxFuture;
use std::sync::Arc;
use tracing::{Span, info, instrument};

/// 驱动连接器特征
pub trait Connector: Send + Sync + 'static {
    /// 以命名连接配置构造队列
    fn connect<'a>(
        &'a self,
        name: &'a str,
        config: &'a ConnectionConfig,
        handlers: Arc<HandlerRegistry>,
    ) -> BoxFuture<'a, Result<Arc<dyn Queue>, QueueError>>;
}

/// 连接器注册表
pub struct ConnectorRegistry {
    connectors: AHashMap<String, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    /// 构造注册表
    pub fn builder() -> ConnectorRegistryBuilder {
        ConnectorRegistryBuilder::default()
    }

    /// 已注册的驱动名称
    pub fn drivers(&self) -> impl Iterator<Item = &str> {
        self.connectors.keys().map(String::as_str)
    }

    /// 按命名连接构造队列，未指定名称时取默认连接
    #[instrument(name = "connect_queue", skip_all, fields(connection, driver))]
    pub async fn connect(
        &self,
        config: &QueueConfig,
        name: Option<&str>,
        handlers: Arc<HandlerRegistry>,
    ) -> Result<Arc<dyn Queue>, QueueError> {
        let (name, conn) = config.connection(name)?;
        let span = Span::current();
        span.record("connection", name);
        span.record("driver", conn.driver.as_str());
        let connector = self
            .connectors
            .get(&conn.driver)
            .ok_or_else(|| QueueError::UnknownDriver(conn.driver.clone()))?;
        let queue = connector.connect(name, conn, handlers).await?;
        info!("队列连接成功");
        Ok(queue)
    }
}

/// 连接器注册表构造器
#[derive(Default)]
pub struct ConnectorRegistryBuilder {
    connectors: AHashMap<String, Arc<dyn Connector>>,
}

impl ConnectorRegistryBuilder {
    /// 注册驱动
    pub fn register(mut self, driver: impl Into<String>, connector: impl Connector) -> Self {
        self.connectors.insert(driver.into(), Arc::new(connector));
        self
    }

    /// 完成构造
    pub fn build(self) -> ConnectorRegistry {
        ConnectorRegistry {
            connectors: self.connectors,
        }
    }
}
