//! # **jobq** 核心库
//!
//! 将分区日志代理适配为作业队列：发布、拉取、确认、释放与失败。
//! 具体代理通过 [`Broker`] 接入，驱动经 [`ConnectorRegistry`] 按名称选择。

#![warn(missing_docs)]

pub mod broker;
pub mod config;
pub mod connector;
pub mod envelope;
pub mod errors;
pub mod handler;
pub mod job;
pub mod offsets;
pub mod queue;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod worker;

pub use broker::{Broker, Incoming, Outgoing, Position};
pub use config::{CommitMode, ConnectionConfig, DelayStrategy, QueueConfig, WorkerOptions};
pub use connector::{Connector, ConnectorRegistry};
pub use envelope::Envelope;
pub use errors::{ConfigError, FailureKind, FailureReport, HandlerError, QueueError};
pub use handler::{Handler, HandlerRegistry};
pub use job::{BrokerJob, Job, JobState};
pub use queue::{BrokerQueue, Queue};
pub use worker::{Worker, WorkerPool, shutdown_signal};
