//! # **jobq** 的 Kafka 实现
//!
//! 作业写入主题，以作业 Id 为消息键；消费组订阅主题，确认时提交偏移量。
//! 消息头 `job_id` 记录作业 Id，`not_before` 记录最早可处理时刻。

pub mod broker;
pub mod config;
pub mod connector;
mod consumer;

pub use broker::KafkaBroker;
pub use config::KafkaConfig;
pub use connector::{DRIVER, KafkaConnector};

use bincode::config::{Configuration, Fixint, Limit, LittleEndian};
use jobq::queue::BrokerQueue;

/// Kafka 队列驱动
pub type KafkaQueue = BrokerQueue<KafkaBroker>;

/// bincode 定长消息头配置
pub const BINCODE_HEADER: Configuration<LittleEndian, Fixint, Limit<8>> =
    bincode::config::standard()
        .with_fixed_int_encoding()
        .with_limit::<8>();

pub(crate) const JOB_ID_HEADER: &str = "job_id";
pub(crate) const NOT_BEFORE_HEADER: &str = "not_before";
