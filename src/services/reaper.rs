//! 结构过期清理
//!
//! 周期性扫描注册表，删除超过 TTL 未被修改的结构文件。
//! 所有者主动删除也走同一条路径：先在注册表锁内认领 ID 并释放配额，
//! 再删除磁盘目录，最后写审计日志。

use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};
use crate::infrastructure::audit::{AuditEntry, AuditSink, RemovalCause};
use crate::models::StructureRecord;
use crate::services::quota::QuotaTracker;
use crate::storage::{FileStore, Requester, StructureRegistry};

/// 单次扫描的结果
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// 扫描开始时快照中的 ID 数量
    pub examined: usize,
    /// 被删除的结构 ID
    pub removed: Vec<String>,
    /// 扫描期间已被其他调用方删除的 ID 数量
    pub already_gone: usize,
    /// 删除失败的数量（已记录日志）
    pub failures: usize,
}

/// 过期清理器
pub struct ExpiryReaper {
    registry: Arc<StructureRegistry>,
    quota: Arc<QuotaTracker>,
    files: FileStore,
    audit: Arc<dyn AuditSink>,
    ttl: Duration,
}

impl ExpiryReaper {
    pub fn new(
        registry: Arc<StructureRegistry>,
        quota: Arc<QuotaTracker>,
        files: FileStore,
        audit: Arc<dyn AuditSink>,
        ttl: Duration,
    ) -> Self {
        Self {
            registry,
            quota,
            files,
            audit,
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(SystemTime::now())
    }

    /// 以 `now` 为当前时间执行一次扫描
    ///
    /// 遍历的是 ID 快照；是否过期在注册表锁内重新判断，
    /// 扫描期间被使用过的结构不会被误删。
    pub fn sweep_at(&self, now: SystemTime) -> SweepReport {
        let ids = self.registry.ids_snapshot();
        let mut report = SweepReport {
            examined: ids.len(),
            ..Default::default()
        };

        for id in ids {
            // idle_for 读取文件 mtime，放在登记表锁内执行，与 touch 互斥
            let claimed = self.registry.release_if(
                &id,
                |record| record.idle_for(now) > self.ttl,
                |record| self.quota.release(&record.owner, record.size),
            );

            match claimed {
                Ok(Some(record)) => {
                    let idle = record.idle_for(now);
                    if self.dispose(&record, RemovalCause::Expired, idle) {
                        report.removed.push(record.id);
                    } else {
                        report.failures += 1;
                    }
                }
                Ok(None) => {}
                Err(AppError::NotFound(_)) => report.already_gone += 1,
                Err(e) => {
                    warn!(structure_id = %id, error = %e, "Expiry check failed");
                    report.failures += 1;
                }
            }
        }

        if !report.removed.is_empty() || report.failures > 0 {
            info!(
                examined = report.examined,
                removed = report.removed.len(),
                failures = report.failures,
                "Expiry sweep finished"
            );
        } else {
            debug!(examined = report.examined, "Expiry sweep found nothing to remove");
        }
        report
    }

    /// 所有者主动删除结构
    ///
    /// 非所有者返回 `Forbidden`，并发删除中只有一方成功，其余返回 `NotFound`。
    pub fn remove_owned(&self, id: &str, client: &str) -> Result<StructureRecord> {
        self.claim_owned(id, client, RemovalCause::OwnerRequest)
    }

    /// 撤销失败批次中已登记的结构，审计原因与主动删除区分开
    pub fn roll_back(&self, id: &str, client: &str) -> Result<StructureRecord> {
        self.claim_owned(id, client, RemovalCause::BatchRollback)
    }

    fn claim_owned(&self, id: &str, client: &str, cause: RemovalCause) -> Result<StructureRecord> {
        let record = self
            .registry
            .release_with(id, Requester::Client(client), |record| {
                self.quota.release(&record.owner, record.size)
            })?;

        let idle = record.idle_for(SystemTime::now());
        self.dispose(&record, cause, idle);
        Ok(record)
    }

    /// 删除已认领记录的磁盘目录并写审计日志
    ///
    /// ID 已经失效，磁盘删除失败只记录警告，返回 false。
    fn dispose(&self, record: &StructureRecord, cause: RemovalCause, idle: Duration) -> bool {
        let entry = AuditEntry::new(&record.id, &record.path, &record.owner, cause, idle);
        self.audit.record(&entry);

        match self.files.remove(&record.path) {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    structure_id = %record.id,
                    path = %record.path.display(),
                    error = %e,
                    "Failed to remove structure directory"
                );
                false
            }
        }
    }
}
