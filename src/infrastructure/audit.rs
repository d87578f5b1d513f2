//! 删除审计日志
//!
//! 结构被过期清理或被所有者删除时写一条审计记录。格式化与传输分离：
//! 调用方只构造 `AuditEntry`，由具体的 `AuditSink` 决定写到哪里。

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// 删除原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalCause {
    /// 超过 TTL 被清理
    Expired,
    /// 所有者主动删除
    OwnerRequest,
    /// 批量上传/下载失败，撤销同一批中已登记的结构
    BatchRollback,
}

/// 审计记录
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub structure_id: String,
    pub path: PathBuf,
    pub owner: String,
    pub cause: RemovalCause,
    /// 删除时文件已空闲的时长
    pub idle: Duration,
    pub at: DateTime<Local>,
}

impl AuditEntry {
    pub fn new(
        structure_id: impl Into<String>,
        path: impl Into<PathBuf>,
        owner: impl Into<String>,
        cause: RemovalCause,
        idle: Duration,
    ) -> Self {
        Self {
            structure_id: structure_id.into(),
            path: path.into(),
            owner: owner.into(),
            cause,
            idle,
            at: Local::now(),
        }
    }

    /// 一行文本形式
    pub fn to_line(&self) -> String {
        let prefix = format!(
            "{} Removing {}",
            self.at.format("%d/%m/%Y, %H:%M:%S"),
            self.path.display()
        );
        match self.cause {
            RemovalCause::Expired => format!(
                "{}, File was last modified before {:.2}s.",
                prefix,
                self.idle.as_secs_f64()
            ),
            RemovalCause::OwnerRequest => {
                format!("{}, Removed on request of {}.", prefix, self.owner)
            }
            RemovalCause::BatchRollback => {
                format!("{}, Batch of {} failed, upload rolled back.", prefix, self.owner)
            }
        }
    }
}

/// 审计日志接口
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: &AuditEntry);
}

/// 追加写入文件的审计日志
pub struct FileAuditLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileAuditLog {
    pub fn new(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(Self {
            path,
            lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for FileAuditLog {
    fn record(&self, entry: &AuditEntry) {
        let _guard = self.lock.lock();
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| writeln!(file, "{}", entry.to_line()));

        // 审计失败不影响删除流程
        if let Err(e) = result {
            warn!(
                path = %self.path.display(),
                error = %e,
                "Failed to append audit entry"
            );
        }
    }
}

/// 只写 tracing 的审计日志
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditLog;

impl AuditSink for TracingAuditLog {
    fn record(&self, entry: &AuditEntry) {
        info!(
            structure_id = %entry.structure_id,
            owner = %entry.owner,
            cause = ?entry.cause,
            "{}",
            entry.to_line()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expired_line_format() {
        let entry = AuditEntry::new(
            "1nerabc",
            "/tmp/acc2/x/1ner.cif",
            "10.0.0.1",
            RemovalCause::Expired,
            Duration::from_millis(86_401_500),
        );
        let line = entry.to_line();
        assert!(line.contains("Removing /tmp/acc2/x/1ner.cif"));
        assert!(line.ends_with("File was last modified before 86401.50s."));
    }

    #[test]
    fn test_file_audit_log_appends() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileAuditLog::new(dir.path().join("logs/removed.log")).unwrap();

        for cause in [
            RemovalCause::Expired,
            RemovalCause::OwnerRequest,
            RemovalCause::BatchRollback,
        ] {
            log.record(&AuditEntry::new(
                "id",
                "/tmp/x.pdb",
                "client",
                cause,
                Duration::from_secs(1),
            ));
        }

        let content = std::fs::read_to_string(log.path()).unwrap();
        assert_eq!(content.lines().count(), 3);
        assert!(content.contains("Removed on request of client."));
        assert!(content.contains("Batch of client failed, upload rolled back."));
    }
}
