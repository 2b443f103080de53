//! # **jobq** 工作者

use crate::{
    config::WorkerOptions,
    errors::{HandlerError, QueueError},
    handler::HandlerRegistry,
    job::Job,
    queue::Queue,
};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio::{
    sync::{Mutex, watch},
    task::JoinSet,
    time::{Duration, sleep},
};
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};

/// 工作者：拉取作业、分派处理器、结算结果
pub struct Worker {
    queue: Arc<dyn Queue>,
    handlers: Arc<HandlerRegistry>,
    options: WorkerOptions,
    topic: Option<String>,
}

impl Worker {
    /// 构造工作者，消费队列默认主题
    pub fn new(queue: Arc<dyn Queue>, handlers: Arc<HandlerRegistry>, options: WorkerOptions) -> Self {
        Self {
            queue,
            handlers,
            options,
            topic: None,
        }
    }

    /// 改为消费指定主题
    pub fn on_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// 循环处理作业，直至收到关闭信号
    #[instrument(name = "worker", skip_all, fields(connection = self.queue.connection_name()))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("工作者启动");
        let rest = Duration::from_millis(self.options.rest);
        loop {
            if *shutdown.borrow() {
                info!("收到关闭信号，开始优雅退出");
                break;
            }
            if !self.run_once().await && !rest.is_zero() {
                tokio::select! {
                    _ = shutdown.changed() => {}
                    _ = sleep(rest) => {}
                }
            }
        }
        info!("工作者退出");
    }

    /// 处理至多一个作业，返回是否取到作业
    pub async fn run_once(&self) -> bool {
        let timeout = Duration::from_secs(self.options.timeout);
        match self.queue.pop(self.topic.as_deref(), timeout).await {
            Some(job) => {
                let span = info_span!(
                    "process_job",
                    job_id = %job.job_id(),
                    handler = %job.envelope().handler,
                    attempts = job.attempts()
                );
                self.process(job).instrument(span).await;
                true
            }
            None => false,
        }
    }

    async fn process(&self, mut job: Box<dyn Job>) {
        let result = if job.attempts() > self.options.max_tries {
            let error = format!("已尝试{}次，超过上限{}", job.attempts(), self.options.max_tries);
            job.fail(&error).await
        } else {
            let outcome = match self.handlers.get(&job.envelope().handler) {
                Ok(handler) => handler.handle(job.envelope()).await,
                Err(e) => Err(HandlerError::Fatal(e.to_string())),
            };
            match outcome {
                Ok(()) => job.acknowledge().await,
                Err(HandlerError::Release(delay)) => job.release(delay).await,
                Err(HandlerError::Retry(error)) if job.attempts() < self.options.max_tries => {
                    self.retry(&mut job, &error).await
                }
                Err(e) => job.fail(&e.to_string()).await,
            }
        };

        match result {
            Ok(()) => debug!("作业结算完成：{}", job.state()),
            Err(e) => error!("作业结算失败：{e}"),
        }
    }

    async fn retry(&self, job: &mut Box<dyn Job>, error: &str) -> Result<(), QueueError> {
        let next = job.envelope().next_attempt();
        let payload = next.to_bytes()?;
        let backoff = Duration::from_secs(self.options.backoff);
        let topic = job.queue().to_string();
        match self.queue.later_raw(backoff, &payload, Some(&topic)).await {
            Ok(_) => {
                warn!(attempts = next.attempts, "作业将重试：{error}");
                job.acknowledge().await
            }
            Err(e) => {
                warn!("重新发布作业失败，改为释放：{e}");
                job.release(backoff).await
            }
        }
    }
}

/// 工作者池，统一启动与优雅关闭
pub struct WorkerPool {
    queue: Arc<dyn Queue>,
    initiated: AtomicBool,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<JoinSet<()>>,
}

impl WorkerPool {
    /// 构造工作者池
    pub fn new(queue: Arc<dyn Queue>) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            queue,
            initiated: AtomicBool::new(false),
            shutdown,
            tasks: Mutex::new(JoinSet::new()),
        })
    }

    /// 启动工作者
    pub async fn spawn(&self, worker: Worker) {
        let shutdown = self.shutdown.subscribe();
        let mut tasks = self.tasks.lock().await;
        tasks.spawn(async move { worker.run(shutdown).await });
    }

    /// 启动 `count` 个消费默认主题的工作者
    pub async fn spawn_many(&self, count: usize, handlers: Arc<HandlerRegistry>, options: WorkerOptions) {
        for _ in 0..count {
            let worker = Worker::new(Arc::clone(&self.queue), Arc::clone(&handlers), options.clone());
            self.spawn(worker).await;
        }
    }

    /// 优雅关闭：通知工作者，等待在途作业结算，再关闭队列
    pub async fn shutdown(&self) {
        if self
            .initiated
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            info!("开始优雅退出");
            self.shutdown.send_replace(true);
            let mut tasks = self.tasks.lock().await;
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    error!("工作者发生错误：{e}");
                }
            }
            self.queue.close().await;
            info!("优雅退出所有工作者");
        }
    }
}

/// 等待 Ctrl-C 信号
pub async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(_) => info!("收到 Ctrl-C 信号"),
        Err(e) => {
            error!("监听 Ctrl-C 信号失败: {e}");
            info!("启用备用关闭机制");
        }
    }
}
