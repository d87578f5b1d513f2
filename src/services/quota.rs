//! 配额追踪器
//!
//! 按客户端记录两类用量：
//! - 磁盘占用（字节），上传时预留、删除时释放
//! - 耗时计算次数，每个衰减周期减一
//!
//! 所有操作都在同一把锁内完成，检查与修改不会被拆开。

use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, info};

use crate::error::{AppError, Result};
use crate::infrastructure::config::LimitsConfig;

/// 配额策略
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuotaPolicy {
    /// 为 false 时不做任何限制（用量仍然记录）
    pub enabled: bool,
    pub granted_space: u64,
    pub max_long_calc: u32,
}

impl From<&LimitsConfig> for QuotaPolicy {
    fn from(limits: &LimitsConfig) -> Self {
        Self {
            enabled: limits.on,
            granted_space: limits.granted_space,
            max_long_calc: limits.max_long_calc,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct ClientUsage {
    used_bytes: u64,
    long_calc_count: u32,
}

impl ClientUsage {
    fn is_idle(&self) -> bool {
        self.used_bytes == 0 && self.long_calc_count == 0
    }
}

/// 客户端用量快照
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UsageSnapshot {
    pub used_bytes: u64,
    pub long_calc_count: u32,
}

/// 配额追踪器
pub struct QuotaTracker {
    policy: QuotaPolicy,
    clients: Mutex<HashMap<String, ClientUsage>>,
}

impl QuotaTracker {
    pub fn new(policy: QuotaPolicy) -> Self {
        info!(
            enabled = policy.enabled,
            granted_space = policy.granted_space,
            max_long_calc = policy.max_long_calc,
            "QuotaTracker initialized"
        );
        Self {
            policy,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &QuotaPolicy {
        &self.policy
    }

    /// 尝试为客户端预留 `bytes` 字节
    ///
    /// 检查和累加在同一个临界区内完成，并发上传不会共同突破预算
    pub fn try_reserve(&self, client: &str, bytes: u64) -> bool {
        self.reserve(client, bytes).is_ok()
    }

    /// 同 [`QuotaTracker::try_reserve`]，拒绝时返回带用量的错误
    pub fn reserve(&self, client: &str, bytes: u64) -> Result<()> {
        let mut clients = self.clients.lock();
        let used = clients.get(client).map(|u| u.used_bytes).unwrap_or(0);

        if self.policy.enabled {
            let exceeds = used
                .checked_add(bytes)
                .map(|total| total > self.policy.granted_space)
                .unwrap_or(true);
            if exceeds {
                debug!(client, used, requested = bytes, "Disk quota denied");
                return Err(AppError::QuotaExceeded {
                    used,
                    budget: self.policy.granted_space,
                    requested: bytes,
                });
            }
        }

        let usage = clients.entry(client.to_string()).or_default();
        usage.used_bytes = usage.used_bytes.saturating_add(bytes);
        Ok(())
    }

    /// 释放 `bytes` 字节，最低为零
    pub fn release(&self, client: &str, bytes: u64) {
        let mut clients = self.clients.lock();
        if let Some(usage) = clients.get_mut(client) {
            usage.used_bytes = usage.used_bytes.saturating_sub(bytes);
            if usage.is_idle() {
                clients.remove(client);
            }
        }
    }

    /// 记录一次耗时计算
    pub fn record_long_calculation(&self, client: &str) {
        let mut clients = self.clients.lock();
        let usage = clients.entry(client.to_string()).or_default();
        usage.long_calc_count = usage.long_calc_count.saturating_add(1);
        debug!(client, count = usage.long_calc_count, "Recorded long calculation");
    }

    pub fn is_rate_limited(&self, client: &str) -> bool {
        self.check_rate_limit(client).is_err()
    }

    /// 耗时计算次数达到上限时返回 `RateLimited`
    pub fn check_rate_limit(&self, client: &str) -> Result<()> {
        if !self.policy.enabled {
            return Ok(());
        }
        let performed = self.long_calc_count(client);
        if performed >= self.policy.max_long_calc {
            return Err(AppError::RateLimited {
                performed,
                allowed: self.policy.max_long_calc,
            });
        }
        Ok(())
    }

    /// 衰减一次：每个客户端的耗时计算次数减一，归零后移除条目
    ///
    /// 返回本次被衰减的客户端数量
    pub fn decay_tick(&self) -> usize {
        let mut clients = self.clients.lock();
        let mut decayed = 0;
        clients.retain(|_, usage| {
            if usage.long_calc_count > 0 {
                usage.long_calc_count -= 1;
                decayed += 1;
            }
            !usage.is_idle()
        });

        if decayed > 0 {
            debug!(decayed, "Long calculation counters decayed");
        }
        decayed
    }

    pub fn used_bytes(&self, client: &str) -> u64 {
        self.usage(client).used_bytes
    }

    pub fn long_calc_count(&self, client: &str) -> u32 {
        self.usage(client).long_calc_count
    }

    /// 剩余可用的耗时计算次数
    pub fn remaining_long_calc(&self, client: &str) -> u32 {
        self.policy
            .max_long_calc
            .saturating_sub(self.long_calc_count(client))
    }

    pub fn usage(&self, client: &str) -> UsageSnapshot {
        self.clients
            .lock()
            .get(client)
            .map(|usage| UsageSnapshot {
                used_bytes: usage.used_bytes,
                long_calc_count: usage.long_calc_count,
            })
            .unwrap_or_default()
    }

    /// 当前有记录的客户端数量
    pub fn tracked_clients(&self) -> usize {
        self.clients.lock().len()
    }
}
