#![allow(dead_code)]

use jobq::{
    config::{ConnectionConfig, QueueConfig},
    test_utils::init_tracing,
};
use jobq_kafka::KafkaConfig;
use rdkafka::{
    ClientConfig,
    admin::{AdminClient, AdminOptions, NewTopic, TopicReplication},
    client::DefaultClientContext,
};
use std::{path::PathBuf, sync::LazyLock};
use tokio::time::Duration;
use uuid::Uuid;

pub(crate) static CFG: LazyLock<QueueConfig> = LazyLock::new(|| {
    init_tracing();
    QueueConfig::load(PathBuf::from(env!("CARGO_MANIFEST_DIR"))).expect("测试配置加载失败")
});

pub(crate) static ADMIN: LazyLock<AdminClient<DefaultClientContext>> = LazyLock::new(|| {
    ClientConfig::new()
        .set("bootstrap.servers", KafkaConfig::from(connection()).bootstrap)
        .create()
        .expect("管理客户端创建失败")
});

pub(crate) static OPTS: LazyLock<AdminOptions> = LazyLock::new(|| {
    AdminOptions::new()
        .operation_timeout(Some(Duration::from_secs(3)))
        .request_timeout(Some(Duration::from_secs(5)))
});

pub(crate) fn connection() -> &'static ConnectionConfig {
    CFG.connection(None).expect("缺少默认连接配置").1
}

/// 创建仅供单个测试使用的主题
pub(crate) async fn create_topic(partitions: i32) -> String {
    let name = format!("jobq.test-{}", Uuid::new_v4());
    let topic = NewTopic::new(&name, partitions, TopicReplication::Fixed(1));
    let _ = ADMIN.create_topics(&[topic], &OPTS).await;
    name
}

pub(crate) async fn delete_topic(name: &str) {
    let _ = ADMIN.delete_topics(&[name], &OPTS).await;
}
