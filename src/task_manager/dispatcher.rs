//! 有界工作池
//!
//! 提交的任务先进入容量固定的队列，再由最多 `workers` 个并发 worker 执行。
//! 队列满时立即拒绝（`Busy`），不会无限堆积。

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::runner::{ComputeRunner, ResolvedCalculation};
use super::JobStore;
use crate::error::{AppError, Result};
use crate::models::{JobId, JobRecord};

/// 等待执行的任务
#[derive(Debug)]
pub struct QueuedJob {
    pub job_id: JobId,
    pub calculation: ResolvedCalculation,
}

/// 任务分发器
pub struct JobDispatcher {
    queue: mpsc::Sender<QueuedJob>,
    store: JobStore,
    capacity: usize,
    workers: Arc<Semaphore>,
    worker_count: usize,
    token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl JobDispatcher {
    /// 启动分发循环，必须在 tokio 运行时内调用
    pub fn new(
        store: JobStore,
        runner: Arc<ComputeRunner>,
        worker_count: usize,
        capacity: usize,
    ) -> Self {
        let worker_count = worker_count.max(1);
        let capacity = capacity.max(1);
        let (queue, receiver) = mpsc::channel(capacity);
        let workers = Arc::new(Semaphore::new(worker_count));
        let token = CancellationToken::new();

        let handle = tokio::spawn(dispatch_loop(
            receiver,
            store.clone(),
            runner,
            workers.clone(),
            token.clone(),
        ));

        info!(workers = worker_count, capacity, "Job dispatcher started");
        Self {
            queue,
            store,
            capacity,
            workers,
            worker_count,
            token,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// 登记任务并放入队列
    ///
    /// 先占队列位置再登记，队列满时不会留下 Pending 记录
    pub async fn submit(
        &self,
        record: JobRecord,
        calculation: ResolvedCalculation,
    ) -> Result<()> {
        let slot = self.queue.try_reserve().map_err(|e| match e {
            mpsc::error::TrySendError::Full(()) => AppError::Busy(self.capacity),
            mpsc::error::TrySendError::Closed(()) => {
                AppError::Internal("job dispatcher has stopped".to_string())
            }
        })?;

        let job_id = record.job_id.clone();
        self.store.insert(record).await?;
        slot.send(QueuedJob {
            job_id,
            calculation,
        });
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 正在执行的任务数量
    pub fn in_flight(&self) -> usize {
        self.worker_count - self.workers.available_permits()
    }

    /// 停止接收新任务，等待正在执行的任务结束（最多 `grace`）
    ///
    /// 队列中尚未开始的任务被丢弃
    pub async fn shutdown(&self, grace: Duration) {
        self.token.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Dispatch loop ended abnormally");
            }
        }

        let drained = tokio::time::timeout(
            grace,
            self.workers.acquire_many(self.worker_count as u32),
        )
        .await;
        match drained {
            Ok(Ok(_permits)) => info!("Job dispatcher stopped"),
            Ok(Err(_)) => {}
            Err(_) => warn!(
                in_flight = self.in_flight(),
                "Calculations still running at shutdown"
            ),
        }
    }
}

async fn dispatch_loop(
    mut receiver: mpsc::Receiver<QueuedJob>,
    store: JobStore,
    runner: Arc<ComputeRunner>,
    workers: Arc<Semaphore>,
    token: CancellationToken,
) {
    loop {
        // 先拿到空闲 worker 再取任务，等待中的任务留在队列里计入容量
        let permit = tokio::select! {
            _ = token.cancelled() => break,
            permit = workers.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let job = tokio::select! {
            _ = token.cancelled() => break,
            job = receiver.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let store = store.clone();
        let runner = runner.clone();
        tokio::spawn(async move {
            let job_id = job.job_id;
            debug!(job_id = %job_id, structure_id = %job.calculation.structure_id, "Job started");
            let outcome = runner.run_blocking(job.calculation).await;
            if let Err(e) = store.complete(job_id.clone(), outcome).await {
                warn!(job_id = %job_id, error = %e, "Could not store job result");
            }
            drop(permit);
        });
    }

    receiver.close();
    debug!("Dispatch loop stopped");
}
