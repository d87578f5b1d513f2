//! 结构记录相关数据结构
//!
//! 本模块定义了上传/下载的分子结构文件在注册表中的记录，以及支持的文件格式。

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::error::{AppError, Result};

/// 支持的结构文件格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StructureFormat {
    Pdb,
    Cif,
    Sdf,
    Mol2,
}

impl StructureFormat {
    /// 根据文件名后缀识别格式
    ///
    /// 后缀比较不区分大小写，无法识别时返回 `UnsupportedFormat`
    pub fn from_filename(filename: &str) -> Result<Self> {
        let extension = Path::new(filename)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase());

        match extension.as_deref() {
            Some("pdb") => Ok(StructureFormat::Pdb),
            Some("cif") => Ok(StructureFormat::Cif),
            Some("sdf") => Ok(StructureFormat::Sdf),
            Some("mol2") => Ok(StructureFormat::Mol2),
            _ => Err(AppError::UnsupportedFormat(filename.to_string())),
        }
    }
}

/// 结构记录
///
/// 一个结构 ID 只属于一个所有者；ID 生成后不可变，删除后永久失效。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructureRecord {
    /// 不透明的结构 ID
    pub id: String,
    /// 结构文件的绝对路径
    pub path: PathBuf,
    /// 所有者（客户端键）
    pub owner: String,
    /// 注册时计入配额的字节数
    pub size: u64,
    /// 原始文件名（清理后）
    pub filename: String,
    /// 文件格式
    pub format: StructureFormat,
    /// 最近一次使用时间
    pub last_touched: SystemTime,
}

impl StructureRecord {
    /// 距离最近一次修改的时长
    ///
    /// 优先读取文件的 mtime；文件已不可读时退回到记录中的时间戳
    pub fn idle_for(&self, now: SystemTime) -> std::time::Duration {
        let last_modified = std::fs::metadata(&self.path)
            .and_then(|meta| meta.modified())
            .unwrap_or(self.last_touched);
        now.duration_since(last_modified).unwrap_or_default()
    }
}

/// 结构的组成信息
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructureInfo {
    /// 分子数
    pub molecules: usize,
    /// 原子总数
    pub atoms: usize,
    /// 元素符号 → 原子数
    pub atom_counts: BTreeMap<String, usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("1ner.pdb", StructureFormat::Pdb)]
    #[case("1NER.CIF", StructureFormat::Cif)]
    #[case("ligand.sdf", StructureFormat::Sdf)]
    #[case("a.b.mol2", StructureFormat::Mol2)]
    fn test_supported_formats(#[case] filename: &str, #[case] expected: StructureFormat) {
        assert_eq!(StructureFormat::from_filename(filename).unwrap(), expected);
    }

    #[rstest]
    #[case("notes.txt")]
    #[case("pdb")]
    #[case("archive.pdb.gz")]
    fn test_unsupported_formats(#[case] filename: &str) {
        let error = StructureFormat::from_filename(filename).unwrap_err();
        assert!(matches!(error, AppError::UnsupportedFormat(_)));
    }

    #[test]
    fn test_idle_for_falls_back_to_record_timestamp() {
        let touched = SystemTime::now() - std::time::Duration::from_secs(30);
        let record = StructureRecord {
            id: "missing".into(),
            path: PathBuf::from("/nonexistent/acc2/missing.pdb"),
            owner: "client".into(),
            size: 0,
            filename: "missing.pdb".into(),
            format: StructureFormat::Pdb,
            last_touched: touched,
        };
        assert!(record.idle_for(SystemTime::now()).as_secs() >= 30);
    }
}
