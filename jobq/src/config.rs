//! # **jobq** 配置

use crate::errors::{ConfigError, QueueError};
use config::{Config, Environment, File};
use serde::{Deserialize, Deserializer, de::DeserializeOwned};
use std::{collections::HashMap, path::PathBuf};
use tokio::time::Duration;
use validator::Validate;

/// 构建分层配置：默认文件、环境文件、`JOBQ__` 前缀的环境变量
pub fn build_config(crate_dir: PathBuf) -> Result<Config, ConfigError> {
    let config_root = std::env::var("JOBQ_CONFIG_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| crate_dir.join("config"));
    let env = std::env::var("JOBQ_ENV").unwrap_or_else(|_| "dev".to_string());
    let config = Config::builder()
        .add_source(File::from(config_root.join("default")).required(false))
        .add_source(File::from(config_root.join(env)).required(false))
        .add_source(
            Environment::with_prefix("JOBQ")
                .separator("__")
                .list_separator(","),
        )
        .build()?;
    Ok(config)
}

/// 加载并验证命名配置节
pub fn load_named_config<T>(config: &Config, section: &str) -> Result<HashMap<String, T>, ConfigError>
where
    T: DeserializeOwned + Validate,
{
    let configs = match config.get::<HashMap<String, T>>(section) {
        Ok(c) => c,
        Err(config::ConfigError::NotFound(_)) => HashMap::new(),
        Err(e) => return Err(e.into()),
    };

    for (key, cfg) in &configs {
        cfg.validate().map_err(|e| ConfigError::ValidationError {
            section: section.to_string(),
            key: key.to_string(),
            message: e.to_string(),
        })?;
    }

    Ok(configs)
}

/// 延迟投递策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayStrategy {
    /// 立即发布，不保证延迟
    #[default]
    Immediate,
    /// 随消息记录最早可处理时刻，拉取时推迟到期前的消息
    NotBefore,
}

/// 偏移量提交方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitMode {
    /// 同步提交
    #[default]
    Sync,
    /// 异步提交
    Async,
}

/// 命名连接配置，构造驱动后不再变更
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct ConnectionConfig {
    /// 驱动名称
    pub driver: String,
    /// 代理地址列表，可写作逗号分隔的字符串
    #[serde(deserialize_with = "address_list")]
    #[validate(length(min = 1))]
    pub brokers: Vec<String>,
    /// 默认主题
    #[validate(length(min = 1))]
    pub topic: String,
    /// 消费组
    #[validate(length(min = 1))]
    pub consumer_group: String,
    /// 未决投递视为过期的秒数，0 表示不过期
    pub retry_after: u64,
    /// 延迟投递策略
    pub delay: DelayStrategy,
    /// 死信主题
    pub failed_topic: Option<String>,
    /// 发布确认级别
    pub acks: String,
    /// 发布超时秒数
    #[validate(range(min = 1))]
    pub send_timeout: u64,
    /// 偏移量提交方式
    pub commit: CommitMode,
    /// 生产者客户端设置
    pub producer: HashMap<String, String>,
    /// 消费者客户端设置
    pub consumer: HashMap<String, String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            driver: "kafka".to_string(),
            brokers: vec!["localhost:9092".to_string()],
            topic: "default".to_string(),
            consumer_group: "jobq-consumer".to_string(),
            retry_after: 90,
            delay: DelayStrategy::default(),
            failed_topic: None,
            acks: "all".to_string(),
            send_timeout: 5,
            commit: CommitMode::default(),
            producer: HashMap::new(),
            consumer: HashMap::new(),
        }
    }
}

impl ConnectionConfig {
    /// 过期时长
    pub fn retry_after(&self) -> Duration {
        Duration::from_secs(self.retry_after)
    }

    /// 发布超时
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout)
    }
}

fn address_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Addresses {
        Joined(String),
        List(Vec<String>),
    }

    let list = match Addresses::deserialize(deserializer)? {
        Addresses::Joined(s) => s.split(',').map(str::to_string).collect(),
        Addresses::List(l) => l,
    };
    Ok(list
        .into_iter()
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty())
        .collect())
}

/// 工作者选项
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct WorkerOptions {
    /// 拉取超时秒数
    #[validate(range(min = 1))]
    pub timeout: u64,
    /// 最大尝试次数
    #[validate(range(min = 1))]
    pub max_tries: u32,
    /// 重试退避秒数
    pub backoff: u64,
    /// 空拉取后的休息毫秒数
    pub rest: u64,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            timeout: 1,
            max_tries: 3,
            backoff: 0,
            rest: 0,
        }
    }
}

/// 队列配置
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// 默认连接名称
    pub default: String,
    /// 命名连接
    pub connections: HashMap<String, ConnectionConfig>,
    /// 工作者选项
    pub worker: WorkerOptions,
}

impl QueueConfig {
    /// 从配置目录加载
    pub fn load(crate_dir: PathBuf) -> Result<Self, ConfigError> {
        let config = build_config(crate_dir)?;
        Self::from_config(&config)
    }

    /// 从已构建的配置解析
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let default = match config.get_string("default") {
            Ok(d) => d,
            Err(config::ConfigError::NotFound(_)) => "kafka".to_string(),
            Err(e) => return Err(e.into()),
        };
        let connections = load_named_config::<ConnectionConfig>(config, "connections")?;
        let worker = match config.get::<WorkerOptions>("worker") {
            Ok(w) => w,
            Err(config::ConfigError::NotFound(_)) => WorkerOptions::default(),
            Err(e) => return Err(e.into()),
        };
        worker.validate().map_err(|e| ConfigError::ValidationError {
            section: "worker".to_string(),
            key: "worker".to_string(),
            message: e.to_string(),
        })?;
        Ok(Self {
            default,
            connections,
            worker,
        })
    }

    /// 获取命名连接，未指定名称时取默认连接
    pub fn connection<'a>(
        &'a self,
        name: Option<&'a str>,
    ) -> Result<(&'a str, &'a ConnectionConfig), QueueError> {
        let name = name.unwrap_or(self.default.as_str());
        self.connections
            .get(name)
            .map(|c| (name, c))
            .ok_or_else(|| QueueError::UnknownConnection(name.to_string()))
    }
}
