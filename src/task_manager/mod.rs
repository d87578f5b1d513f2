//! 异步计算任务管理
//!
//! 基于 Actor Model 和消息传递的任务存储：
//!
//! 1. **Actor Model**: `JobStoreActor` 独占所有任务记录，不需要锁
//! 2. **Message Passing**: 句柄 `JobStore` 通过 mpsc + oneshot 与 Actor 通信
//! 3. **Supervision**: Actor 定期清理长时间无人领取的结果
//!
//! 任务状态只会沿 `Pending → {Done | Failed} → Consumed` 前进，
//! 领取（poll）在 Actor 内一次完成“检查并取走”，同一结果最多被领取一次。

pub mod dispatcher;
pub mod runner;

pub use dispatcher::{JobDispatcher, QueuedJob};
pub use runner::{ComputeRunner, ResolvedCalculation};

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};
use crate::models::{JobId, JobOutcome, JobRecord, JobState, JobSummary};

/// 任务存储配置
#[derive(Debug, Clone)]
pub struct JobStoreConfig {
    /// 已完成但未领取的结果保留时间
    pub result_ttl: Duration,
    /// 清理检查间隔
    pub cleanup_interval: Duration,
}

impl Default for JobStoreConfig {
    fn default() -> Self {
        Self {
            result_ttl: Duration::from_secs(3600),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

/// Actor 消息类型
#[derive(Debug)]
enum ActorMessage {
    /// 插入新的 Pending 任务
    Insert {
        record: JobRecord,
        respond_to: oneshot::Sender<Result<()>>,
    },
    /// 写入计算结果
    Complete {
        job_id: JobId,
        outcome: JobOutcome,
        respond_to: oneshot::Sender<bool>,
    },
    /// 领取结果
    Poll {
        job_id: JobId,
        requester: String,
        respond_to: oneshot::Sender<Result<JobOutcome>>,
    },
    /// 查看状态（不领取）
    Summary {
        job_id: JobId,
        respond_to: oneshot::Sender<Option<JobSummary>>,
    },
    /// 记录数量
    Count { respond_to: oneshot::Sender<usize> },
    /// 清理过期结果
    CleanupExpired {
        respond_to: oneshot::Sender<usize>,
    },
    /// 停止 Actor
    Shutdown,
}

/// 任务存储 Actor
struct JobStoreActor {
    jobs: HashMap<JobId, JobRecord>,
    config: JobStoreConfig,
}

impl JobStoreActor {
    fn new(config: JobStoreConfig) -> Self {
        Self {
            jobs: HashMap::new(),
            config,
        }
    }

    fn handle_message(&mut self, msg: ActorMessage) {
        match msg {
            ActorMessage::Insert { record, respond_to } => {
                let result = if self.jobs.contains_key(&record.job_id) {
                    Err(AppError::invariant(format!(
                        "job id {} issued twice",
                        record.job_id
                    )))
                } else {
                    debug!(job_id = %record.job_id, owner = %record.owner, "Job accepted");
                    self.jobs.insert(record.job_id.clone(), record);
                    Ok(())
                };
                let _ = respond_to.send(result);
            }
            ActorMessage::Complete {
                job_id,
                outcome,
                respond_to,
            } => {
                let updated = match self.jobs.get_mut(&job_id) {
                    Some(record) => record.complete(outcome),
                    None => {
                        warn!(job_id = %job_id, "Completed job is no longer tracked");
                        false
                    }
                };
                let _ = respond_to.send(updated);
            }
            ActorMessage::Poll {
                job_id,
                requester,
                respond_to,
            } => {
                let _ = respond_to.send(self.take(&job_id, &requester));
            }
            ActorMessage::Summary { job_id, respond_to } => {
                let _ = respond_to.send(self.jobs.get(&job_id).map(JobSummary::from));
            }
            ActorMessage::Count { respond_to } => {
                let _ = respond_to.send(self.jobs.len());
            }
            ActorMessage::CleanupExpired { respond_to } => {
                let _ = respond_to.send(self.cleanup_expired_jobs());
            }
            ActorMessage::Shutdown => {
                // Actor 将在消息循环结束后停止
            }
        }
    }

    /// 检查并取走结果
    ///
    /// 其他客户端的任务按不存在处理
    fn take(&mut self, job_id: &JobId, requester: &str) -> Result<JobOutcome> {
        let state = match self.jobs.get(job_id) {
            Some(record) if record.owner == requester => record.state,
            _ => return Err(AppError::job_not_found(job_id.as_str())),
        };

        match state {
            JobState::Pending => Err(AppError::NotReady(job_id.to_string())),
            JobState::Done | JobState::Failed => {
                let mut record = self
                    .jobs
                    .remove(job_id)
                    .ok_or_else(|| AppError::job_not_found(job_id.as_str()))?;
                record.state = JobState::Consumed;
                record.outcome.take().ok_or_else(|| {
                    AppError::invariant(format!("job {} finished without an outcome", job_id))
                })
            }
            JobState::Consumed => Err(AppError::job_not_found(job_id.as_str())),
        }
    }

    fn cleanup_expired_jobs(&mut self) -> usize {
        let now = Instant::now();
        let ttl = self.config.result_ttl;
        let before = self.jobs.len();

        self.jobs.retain(|job_id, record| {
            let expired = record
                .completed_at
                .map(|completed_at| now.duration_since(completed_at) >= ttl)
                .unwrap_or(false);
            if expired {
                info!(
                    job_id = %job_id,
                    owner = %record.owner,
                    state = ?record.state,
                    "Dropped unclaimed calculation result"
                );
            }
            !expired
        });

        before - self.jobs.len()
    }

    async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<ActorMessage>) {
        let mut cleanup_interval = interval(self.config.cleanup_interval);
        cleanup_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = receiver.recv() => {
                    match msg {
                        Some(ActorMessage::Shutdown) | None => break,
                        Some(msg) => self.handle_message(msg),
                    }
                }
                _ = cleanup_interval.tick() => {
                    self.cleanup_expired_jobs();
                }
            }
        }

        info!(remaining = self.jobs.len(), "Job store stopped");
    }
}

/// 任务存储句柄
///
/// 可以廉价克隆，所有克隆共享同一个 Actor
#[derive(Clone)]
pub struct JobStore {
    sender: mpsc::UnboundedSender<ActorMessage>,
}

fn stopped() -> AppError {
    AppError::Internal("job store has stopped".to_string())
}

impl JobStore {
    /// 创建任务存储并启动 Actor，必须在 tokio 运行时内调用
    pub fn new(config: JobStoreConfig) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let actor = JobStoreActor::new(config);

        tokio::spawn(async move {
            actor.run(receiver).await;
        });

        Self { sender }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> ActorMessage,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.sender.send(build(tx)).map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())
    }

    pub async fn insert(&self, record: JobRecord) -> Result<()> {
        self.request(|respond_to| ActorMessage::Insert { record, respond_to })
            .await?
    }

    /// 写入结果；任务已不存在或已不是 Pending 时返回 false
    pub async fn complete(&self, job_id: JobId, outcome: JobOutcome) -> Result<bool> {
        self.request(|respond_to| ActorMessage::Complete {
            job_id,
            outcome,
            respond_to,
        })
        .await
    }

    /// 领取结果
    ///
    /// 外层错误是领取本身的失败（`NotFound`/`NotReady`），
    /// 内层是计算的结果或计算时保存下来的错误
    pub async fn poll(&self, job_id: &JobId, requester: &str) -> Result<JobOutcome> {
        self.request(|respond_to| ActorMessage::Poll {
            job_id: job_id.clone(),
            requester: requester.to_string(),
            respond_to,
        })
        .await?
    }

    pub async fn summary(&self, job_id: &JobId) -> Result<Option<JobSummary>> {
        self.request(|respond_to| ActorMessage::Summary {
            job_id: job_id.clone(),
            respond_to,
        })
        .await
    }

    pub async fn len(&self) -> Result<usize> {
        self.request(|respond_to| ActorMessage::Count { respond_to })
            .await
    }

    /// 立即清理过期结果，返回删除的数量
    pub async fn cleanup_expired(&self) -> Result<usize> {
        self.request(|respond_to| ActorMessage::CleanupExpired { respond_to })
            .await
    }

    /// 停止 Actor
    pub fn shutdown(&self) {
        let _ = self.sender.send(ActorMessage::Shutdown);
    }

    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }
}
