//! # 作业处理器注册表
//!
//! 处理器名称到实现的封闭映射，启动时构建后不再变更。
//! 信封中的处理器名称只会在此表中查找，未知名称视为硬错误。

use crate::{
    envelope::Envelope,
    errors::{HandlerError, QueueError},
};
use ahash::AHashMap;
use futures::future::BoxFuture;
use std::sync::Arc;

/// 作业处理器特征
pub trait Handler: Send + Sync + 'static {
    /// 处理作业
    fn handle<'a>(&'a self, envelope: &'a Envelope) -> BoxFuture<'a, Result<(), HandlerError>>;

    /// 作业最终失败时回调，`envelope.attempts` 为已尝试次数
    fn failed<'a>(&'a self, _envelope: &'a Envelope, _error: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async {})
    }
}

/// 处理器注册表
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: AHashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    /// 构造注册表
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    /// 按名称查找处理器
    pub fn get(&self, name: &str) -> Result<Arc<dyn Handler>, QueueError> {
        self.handlers
            .get(name)
            .cloned()
            .ok_or_else(|| QueueError::UnknownHandler(name.to_string()))
    }

    /// 是否已注册
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }
}

/// 处理器注册表构造器
#[derive(Default)]
pub struct HandlerRegistryBuilder {
    handlers: AHashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistryBuilder {
    /// 注册处理器，同名后者覆盖前者
    pub fn register(mut self, name: impl Into<String>, handler: impl Handler) -> Self {
        self.handlers.insert(name.into(), Arc::new(handler));
        self
    }

    /// 完成构造
    pub fn build(self) -> Arc<HandlerRegistry> {
        Arc::new(HandlerRegistry {
            handlers: self.handlers,
        })
    }
}
