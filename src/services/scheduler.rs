//! 后台周期任务调度
//!
//! 负责配额衰减和过期清理两个定时任务。每个任务是一个 tokio 任务，
//! 通过共享的 CancellationToken 统一停止。任务体可能做阻塞 IO，
//! 因此放到 `spawn_blocking` 中执行。

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 后台调度器
pub struct BackgroundScheduler {
    token: CancellationToken,
    tasks: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl Default for BackgroundScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl BackgroundScheduler {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// 每隔 `period` 执行一次 `task`，第一次执行在一个周期之后
    ///
    /// 必须在 tokio 运行时内调用
    pub fn spawn_periodic<F>(&self, name: &str, period: Duration, task: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let task = Arc::new(task);
        let token = self.token.child_token();
        let task_name = name.to_string();

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!(task = %task_name, "Periodic task cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        let task = task.clone();
                        if let Err(e) = tokio::task::spawn_blocking(move || task()).await {
                            warn!(task = %task_name, error = %e, "Periodic task panicked");
                        }
                    }
                }
            }
        });

        info!(task = name, period_secs = period.as_secs_f64(), "Periodic task scheduled");
        self.tasks.lock().push((name.to_string(), handle));
    }

    /// 正在运行的任务数量
    pub fn running(&self) -> usize {
        self.tasks
            .lock()
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .count()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// 取消所有任务并等待它们退出
    ///
    /// 正在执行的任务体会先跑完
    pub async fn shutdown(&self) {
        self.token.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for (name, handle) in tasks {
            if let Err(e) = handle.await {
                warn!(task = %name, error = %e, "Periodic task ended abnormally");
            }
        }
        info!("Background scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_periodic_task_runs_until_shutdown() {
        let scheduler = BackgroundScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        scheduler.spawn_periodic("count", Duration::from_millis(10), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(scheduler.running(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.shutdown().await;
        let after_shutdown = counter.load(Ordering::SeqCst);
        assert!(after_shutdown >= 2);
        assert!(scheduler.is_cancelled());
        assert_eq!(scheduler.running(), 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), after_shutdown);
    }

    #[tokio::test]
    async fn test_first_run_waits_one_period() {
        let scheduler = BackgroundScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        scheduler.spawn_periodic("slow", Duration::from_secs(3600), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        scheduler.shutdown().await;
    }
}
