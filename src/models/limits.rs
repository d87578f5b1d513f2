//! 配额快照与上传结果

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 客户端名下单个结构的信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructureFileInfo {
    pub structure_id: String,
    pub filename: String,
    /// 距离最近一次修改的秒数（保留两位小数）
    pub last_modified_secs_ago: f64,
}

/// 文件过期策略说明
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovalPolicy {
    pub older_than_secs: u64,
    pub every_x_seconds: u64,
}

/// 客户端配额快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    /// 配额是否启用
    pub enabled: bool,
    /// 单个文件的大小上限
    pub max_file_size: u64,
    /// 授予的磁盘空间
    pub granted_space: u64,
    /// 已使用的磁盘空间
    pub used_space: u64,
    /// 允许的耗时计算次数
    pub max_long_calc: u32,
    /// 剩余的耗时计算次数
    pub remaining_long_calc: u32,
    pub removal_policy: RemovalPolicy,
    pub files: Vec<StructureFileInfo>,
}

/// 批量上传结果
///
/// 配额不足时，已保存的文件仍然保留
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadOutcome {
    /// 文件名 -> 结构 ID
    pub structure_ids: BTreeMap<String, String>,
    /// 是否因为磁盘配额中途停止
    pub quota_exceeded: bool,
}

impl UploadOutcome {
    pub fn is_complete(&self) -> bool {
        !self.quota_exceeded
    }
}
