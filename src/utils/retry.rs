//! 文件删除重试
//!
//! 结构目录可能正被计算后端读取，删除时偶尔遇到暂时性错误，
//! 这里按指数退避重试有限次数。

use std::io;
use std::time::Duration;
use tracing::{debug, warn};

/// 重试策略
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// 删除结构目录时使用的策略
    pub const REMOVAL: RetryPolicy = RetryPolicy {
        max_retries: 3,
        base_delay: Duration::from_millis(50),
        max_delay: Duration::from_millis(500),
    };

    /// 第 `attempt` 次失败后的等待时间
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// 执行 `operation`，只对暂时性 IO 错误重试
    pub fn run<T>(&self, label: &str, operation: impl Fn() -> io::Result<T>) -> io::Result<T> {
        let mut attempt = 0;
        loop {
            match operation() {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(operation = label, retries = attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if is_transient(&e) && attempt < self.max_retries => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation = label,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient IO error, retrying"
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn is_transient(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::PermissionDenied
    ) || error.to_string().to_lowercase().contains("directory not empty")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    const FAST: RetryPolicy = RetryPolicy {
        max_retries: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(4),
    };

    #[test]
    fn test_transient_error_is_retried() {
        let attempts = Cell::new(0);
        let value = FAST
            .run("flaky", || {
                attempts.set(attempts.get() + 1);
                if attempts.get() < 3 {
                    Err(io::Error::new(io::ErrorKind::Interrupted, "interrupted"))
                } else {
                    Ok(7)
                }
            })
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(attempts.get(), 3);
    }

    #[test]
    fn test_gives_up_after_max_retries() {
        let attempts = Cell::new(0);
        let result: io::Result<()> = FAST.run("stuck", || {
            attempts.set(attempts.get() + 1);
            Err(io::Error::new(io::ErrorKind::TimedOut, "busy"))
        });
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::TimedOut);
        assert_eq!(attempts.get(), 4);
    }

    #[test]
    fn test_not_found_is_not_retried() {
        let attempts = Cell::new(0);
        let result: io::Result<()> = FAST.run("gone", || {
            attempts.set(attempts.get() + 1);
            Err(io::Error::new(io::ErrorKind::NotFound, "gone"))
        });
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::NotFound);
        assert_eq!(attempts.get(), 1);
    }

    #[test]
    fn test_delay_is_capped() {
        assert_eq!(FAST.delay_for(0), Duration::from_millis(1));
        assert_eq!(FAST.delay_for(2), Duration::from_millis(4));
        assert_eq!(FAST.delay_for(40), Duration::from_millis(4));
    }
}
