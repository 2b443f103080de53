//! Kafka 客户端配置

use jobq::config::{CommitMode, ConnectionConfig};
use rdkafka::{ClientConfig, consumer};
use std::collections::HashMap;
use tokio::time::Duration;

/// 由命名连接配置投影出的 Kafka 客户端配置
#[derive(Debug, Clone)]
pub struct KafkaConfig {
    /// 代理地址，逗号分隔
    pub bootstrap: String,
    /// 默认主题
    pub topic: String,
    /// 消费组
    pub group: String,
    /// 发布确认级别
    pub acks: String,
    /// 发布及管理操作超时
    pub timeout: Duration,
    /// 未决投递过期时长
    pub retry_after: Duration,
    /// 偏移量提交方式
    pub commit: consumer::CommitMode,
    producer: HashMap<String, String>,
    consumer: HashMap<String, String>,
}

impl From<&ConnectionConfig> for KafkaConfig {
    fn from(cfg: &ConnectionConfig) -> Self {
        Self {
            bootstrap: cfg.brokers.join(","),
            topic: cfg.topic.clone(),
            group: cfg.consumer_group.clone(),
            acks: cfg.acks.clone(),
            timeout: cfg.send_timeout(),
            retry_after: cfg.retry_after(),
            commit: match cfg.commit {
                CommitMode::Sync => consumer::CommitMode::Sync,
                CommitMode::Async => consumer::CommitMode::Async,
            },
            producer: cfg.producer.clone(),
            consumer: cfg.consumer.clone(),
        }
    }
}

impl KafkaConfig {
    /// 生产者配置，附加设置可覆盖默认值
    pub fn producer_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.bootstrap)
            .set("acks", &self.acks)
            .set("message.timeout.ms", self.timeout.as_millis().to_string());
        for (key, value) in &self.producer {
            config.set(key, value);
        }
        config
    }

    /// 消费者配置，偏移量只由确认操作提交，不允许覆盖为自动提交
    pub fn consumer_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.bootstrap)
            .set("auto.offset.reset", "earliest")
            .set("enable.partition.eof", "false");
        for (key, value) in &self.consumer {
            config.set(key, value);
        }
        config
            .set("group.id", &self.group)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false");
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> ConnectionConfig {
        let mut cfg = ConnectionConfig {
            brokers: vec!["k1:9092".to_string(), "k2:9092".to_string()],
            consumer_group: "report-workers".to_string(),
            acks: "1".to_string(),
            send_timeout: 3,
            commit: CommitMode::Async,
            ..ConnectionConfig::default()
        };
        cfg.producer.insert("linger.ms".to_string(), "5".to_string());
        cfg.consumer
            .insert("auto.offset.reset".to_string(), "latest".to_string());
        cfg.consumer
            .insert("enable.auto.commit".to_string(), "true".to_string());
        cfg
    }

    #[test]
    fn producer_settings() {
        let cfg = KafkaConfig::from(&connection());
        let producer = cfg.producer_config();

        assert_eq!(producer.get("bootstrap.servers"), Some("k1:9092,k2:9092"));
        assert_eq!(producer.get("acks"), Some("1"));
        assert_eq!(producer.get("message.timeout.ms"), Some("3000"));
        assert_eq!(producer.get("linger.ms"), Some("5"));
    }

    #[test]
    fn consumer_settings() {
        let cfg = KafkaConfig::from(&connection());
        let settings = cfg.consumer_config();

        assert_eq!(settings.get("group.id"), Some("report-workers"));
        assert_eq!(settings.get("auto.offset.reset"), Some("latest"));
        assert_eq!(settings.get("enable.auto.commit"), Some("false"));
        assert!(matches!(cfg.commit, consumer::CommitMode::Async));
    }

    #[test]
    fn defaults_follow_connection() {
        let cfg = KafkaConfig::from(&ConnectionConfig::default());

        assert_eq!(cfg.bootstrap, "localhost:9092");
        assert_eq!(cfg.topic, "default");
        assert_eq!(cfg.group, "jobq-consumer");
        assert_eq!(cfg.retry_after, Duration::from_secs(90));
        assert_eq!(
            cfg.consumer_config().get("auto.offset.reset"),
            Some("earliest")
        );
    }
}
