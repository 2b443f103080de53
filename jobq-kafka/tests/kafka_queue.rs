mod common;

use crate::common::{CFG, connection, create_topic, delete_topic};
use futures::future::BoxFuture;
use jobq::{
    config::{ConnectionConfig, DelayStrategy},
    connector::{Connector, ConnectorRegistry},
    envelope::Envelope,
    errors::{HandlerError, QueueError},
    handler::{Handler, HandlerRegistry},
    job::JobState,
    queue::Queue,
    worker::Worker,
};
use jobq_kafka::{DRIVER, KafkaConnector};
use serde_json::json;
use std::sync::Arc;
use tokio::time::{Duration, Instant};

struct SendReport;

impl Handler for SendReport {
    fn handle<'a>(&'a self, _: &'a Envelope) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async { Ok(()) })
    }
}

fn handlers() -> Arc<HandlerRegistry> {
    HandlerRegistry::builder()
        .register("SendReport", SendReport)
        .build()
}

async fn connect(config: &ConnectionConfig) -> Arc<dyn Queue> {
    KafkaConnector
        .connect(DRIVER, config, handlers())
        .await
        .expect("连接Kafka集群失败")
}

#[test]
fn load_test_config() {
    assert_eq!(CFG.default, "kafka");
    let conn = connection();
    assert_eq!(conn.driver, DRIVER);
    assert_eq!(conn.brokers, vec!["localhost:9092"]);
    assert_eq!(conn.topic, "jobq.test");
    assert_eq!(conn.failed_topic.as_deref(), Some("jobq.test.failed"));
    assert_eq!(conn.producer.get("linger.ms").map(String::as_str), Some("0"));
    assert_eq!(CFG.worker.timeout, 3);
}

#[tokio::test]
async fn unreachable_cluster_is_connection_error() {
    let config = ConnectionConfig {
        brokers: vec!["127.0.0.1:1".to_string()],
        send_timeout: 1,
        ..ConnectionConfig::default()
    };

    let result = KafkaConnector.connect(DRIVER, &config, handlers()).await;

    assert!(matches!(result, Err(QueueError::Connection(_))));
}

#[tokio::test]
#[ignore = "需要可访问的Kafka集群"]
async fn connect_through_registry() {
    let registry = ConnectorRegistry::builder()
        .register(DRIVER, KafkaConnector)
        .build();

    let queue = registry.connect(&CFG, None, handlers()).await.unwrap();

    assert_eq!(queue.connection_name(), "kafka");
    assert_eq!(queue.default_topic(), "jobq.test");
    assert_eq!(queue.size(None), None);
    queue.close().await;
}

#[tokio::test]
#[ignore = "需要可访问的Kafka集群"]
async fn push_pop_acknowledge() {
    let topic = create_topic(3).await;
    let queue = connect(connection()).await;

    let id = queue
        .push("SendReport", json!({ "id": 42 }), Some(&topic))
        .await
        .unwrap();
    let mut job = queue
        .pop(Some(&topic), Duration::from_secs(15))
        .await
        .unwrap();
    assert_eq!(job.job_id(), id);
    assert_eq!(job.attempts(), 1);
    assert_eq!(job.queue(), topic);
    job.acknowledge().await.unwrap();
    assert_eq!(job.state(), JobState::Acknowledged);
    queue.close().await;

    let restarted = connect(connection()).await;
    assert!(
        restarted
            .pop(Some(&topic), Duration::from_secs(5))
            .await
            .is_none()
    );
    restarted.close().await;
    delete_topic(&topic).await;
}

#[tokio::test]
#[ignore = "需要可访问的Kafka集群"]
async fn unacknowledged_job_redelivered_after_restart() {
    let topic = create_topic(1).await;
    let queue = connect(connection()).await;
    let id = queue
        .push("SendReport", json!({ "id": 1 }), Some(&topic))
        .await
        .unwrap();

    let job = queue
        .pop(Some(&topic), Duration::from_secs(15))
        .await
        .unwrap();
    drop(job);
    queue.close().await;

    let restarted = connect(connection()).await;
    let mut job = restarted
        .pop(Some(&topic), Duration::from_secs(15))
        .await
        .unwrap();
    assert_eq!(job.job_id(), id);
    job.acknowledge().await.unwrap();
    restarted.close().await;
    delete_topic(&topic).await;
}

#[tokio::test]
#[ignore = "需要可访问的Kafka集群"]
async fn release_redelivers_after_delay() {
    let topic = create_topic(1).await;
    let queue = connect(connection()).await;
    let id = queue
        .push("SendReport", json!({ "id": 1 }), Some(&topic))
        .await
        .unwrap();

    let mut job = queue
        .pop(Some(&topic), Duration::from_secs(15))
        .await
        .unwrap();
    let released_at = Instant::now();
    job.release(Duration::from_secs(2)).await.unwrap();

    let mut again = queue
        .pop(Some(&topic), Duration::from_secs(15))
        .await
        .unwrap();
    assert_eq!(again.job_id(), id);
    assert!(released_at.elapsed() >= Duration::from_secs(2));
    again.acknowledge().await.unwrap();
    queue.close().await;
    delete_topic(&topic).await;
}

#[tokio::test]
#[ignore = "需要可访问的Kafka集群"]
async fn release_does_not_block_partition() {
    let topic = create_topic(1).await;
    let queue = connect(connection()).await;
    let first = queue
        .push("SendReport", json!({ "id": 1 }), Some(&topic))
        .await
        .unwrap();
    let second = queue
        .push("SendReport", json!({ "id": 2 }), Some(&topic))
        .await
        .unwrap();

    let mut job = queue
        .pop(Some(&topic), Duration::from_secs(15))
        .await
        .unwrap();
    assert_eq!(job.job_id(), first);
    job.release(Duration::from_secs(60)).await.unwrap();

    let mut next = queue
        .pop(Some(&topic), Duration::from_secs(15))
        .await
        .unwrap();
    assert_eq!(next.job_id(), second);
    next.acknowledge().await.unwrap();
    queue.close().await;
    delete_topic(&topic).await;
}

#[tokio::test]
#[ignore = "需要可访问的Kafka集群"]
async fn not_before_defers_delivery() {
    let topic = create_topic(1).await;
    let config = ConnectionConfig {
        delay: DelayStrategy::NotBefore,
        ..connection().clone()
    };
    let queue = connect(&config).await;
    let start = Instant::now();

    let id = queue
        .later(
            Duration::from_secs(3),
            "SendReport",
            json!({ "id": 1 }),
            Some(&topic),
        )
        .await
        .unwrap();
    let mut job = queue
        .pop(Some(&topic), Duration::from_secs(20))
        .await
        .unwrap();

    assert_eq!(job.job_id(), id);
    assert!(start.elapsed() >= Duration::from_secs(3));
    job.acknowledge().await.unwrap();
    queue.close().await;
    delete_topic(&topic).await;
}

#[tokio::test]
#[ignore = "需要可访问的Kafka集群"]
async fn worker_processes_job() {
    let topic = create_topic(1).await;
    let queue = connect(connection()).await;
    queue
        .push("SendReport", json!({ "id": 1 }), Some(&topic))
        .await
        .unwrap();

    let worker = Worker::new(Arc::clone(&queue), handlers(), CFG.worker.clone()).on_topic(&topic);

    assert!(worker.run_once().await);
    queue.close().await;
    delete_topic(&topic).await;
}
