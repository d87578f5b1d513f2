//! 结构文件存储
//!
//! 每个结构在存储根目录下拥有独立的临时目录：
//!
//! ```text
//! save_user_files/
//! ├── acc2_Xk3d9a/
//! │   └── 1ner.cif
//! └── acc2_P0a7qe/
//!     └── ligand.sdf
//! ```
//!
//! 目录和文件作为一个整体创建和删除。

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::StructureFormat;
use crate::utils::cleanup::{purge_storage_root, remove_structure_dir};

const DIR_PREFIX: &str = "acc2_";
const MAX_STEM_LEN: usize = 32;

/// 已完整写入磁盘的结构文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub path: PathBuf,
    pub filename: String,
    pub format: StructureFormat,
    pub size: u64,
}

/// 上传和下载的结构所在的存储根目录
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        fs::create_dir_all(root)?;
        let root = root.canonicalize()?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 生成新的结构 ID：清理后的文件名主干加随机后缀
    pub fn generate_id(filename: &str) -> String {
        let stem: String = Path::new(filename)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
            .take(MAX_STEM_LEN)
            .collect();
        format!("{}{}", stem, Uuid::new_v4().simple())
    }

    /// 开始写入新的结构文件
    ///
    /// 文件名先清理，后缀必须是支持的格式。`limit` 限制可接受的字节数。
    pub fn begin(&self, filename: &str, limit: Option<u64>) -> Result<PendingStructure> {
        let filename = sanitize_filename::sanitize(filename);
        if filename.is_empty() {
            return Err(AppError::UnsupportedFormat("<empty filename>".to_string()));
        }
        let format = StructureFormat::from_filename(&filename)?;

        let dir = tempfile::Builder::new()
            .prefix(DIR_PREFIX)
            .tempdir_in(&self.root)?
            .keep();
        let path = dir.join(&filename);

        let file = match File::create(&path) {
            Ok(file) => file,
            Err(e) => {
                let _ = fs::remove_dir_all(&dir);
                return Err(e.into());
            }
        };

        Ok(PendingStructure {
            root: self.root.clone(),
            path,
            filename,
            format,
            file: Some(file),
            written: 0,
            limit,
            finished: false,
        })
    }

    /// 写入一次完整的内存上传
    pub fn store_bytes(
        &self,
        filename: &str,
        bytes: &[u8],
        limit: Option<u64>,
    ) -> Result<StoredFile> {
        let mut pending = self.begin(filename, limit)?;
        pending.write_chunk(bytes)?;
        pending.finish()
    }

    /// 连同所在目录一起删除结构文件
    pub fn remove(&self, path: &Path) -> io::Result<()> {
        remove_structure_dir(path, &self.root)
    }

    /// 清除上一个进程遗留的全部内容
    pub fn purge(&self) -> io::Result<usize> {
        purge_storage_root(&self.root)
    }
}

/// 正在写入的结构文件
///
/// 未调用 [`PendingStructure::finish`] 就被丢弃时，会删除残缺文件及其目录。
pub struct PendingStructure {
    root: PathBuf,
    path: PathBuf,
    filename: String,
    format: StructureFormat,
    file: Option<File>,
    written: u64,
    limit: Option<u64>,
    finished: bool,
}

impl PendingStructure {
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        let written = self.written + chunk.len() as u64;
        if let Some(limit) = self.limit {
            if written > limit {
                return Err(AppError::FileTooLarge {
                    name: self.filename.clone(),
                    limit,
                });
            }
        }

        let file = self
            .file
            .as_mut()
            .ok_or_else(|| AppError::Internal("structure file already closed".to_string()))?;
        file.write_all(chunk)?;
        self.written = written;
        Ok(())
    }

    /// 刷盘、统一换行符并返回最终大小
    pub fn finish(mut self) -> Result<StoredFile> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }
        let size = normalize_line_endings(&self.path)?;
        self.finished = true;

        Ok(StoredFile {
            path: self.path.clone(),
            filename: self.filename.clone(),
            format: self.format,
            size,
        })
    }
}

impl Drop for PendingStructure {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.file.take();
        if let Err(e) = remove_structure_dir(&self.path, &self.root) {
            warn!(path = %self.path.display(), error = %e, "Failed to discard partial structure");
        }
    }
}

/// 原地把 CRLF 换行转换为 LF，返回转换后的大小
pub fn normalize_line_endings(path: &Path) -> Result<u64> {
    let content = fs::read(path)?;
    if !content.windows(2).any(|w| w == b"\r\n") {
        return Ok(content.len() as u64);
    }

    let mut normalized = Vec::with_capacity(content.len());
    let mut iter = content.iter().peekable();
    while let Some(&byte) = iter.next() {
        if byte == b'\r' && iter.peek() == Some(&&b'\n') {
            continue;
        }
        normalized.push(byte);
    }

    fs::write(path, &normalized)?;
    debug!(
        path = %path.display(),
        before = content.len(),
        after = normalized.len(),
        "Normalized line endings"
    );
    Ok(normalized.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_bytes_creates_own_directory() {
        let root = tempfile::tempdir().unwrap();
        let store = FileStore::new(root.path()).unwrap();

        let first = store.store_bytes("1ner.pdb", b"ATOM\n", None).unwrap();
        let second = store.store_bytes("1ner.pdb", b"ATOM\n", None).unwrap();

        assert_ne!(first.path.parent(), second.path.parent());
        assert_eq!(first.size, 5);
        assert_eq!(first.format, StructureFormat::Pdb);
        assert_eq!(first.path.parent().unwrap().parent().unwrap(), store.root());
    }

    #[test]
    fn test_crlf_is_normalized() {
        let root = tempfile::tempdir().unwrap();
        let store = FileStore::new(root.path()).unwrap();

        let stored = store
            .store_bytes("mol.sdf", b"line1\r\nline2\r\n", None)
            .unwrap();
        assert_eq!(stored.size, 12);
        assert_eq!(fs::read(&stored.path).unwrap(), b"line1\nline2\n");
    }

    #[test]
    fn test_size_limit_discards_partial_file() {
        let root = tempfile::tempdir().unwrap();
        let store = FileStore::new(root.path()).unwrap();

        let error = store
            .store_bytes("big.cif", &[b'x'; 32], Some(16))
            .unwrap_err();
        assert!(matches!(error, AppError::FileTooLarge { limit: 16, .. }));
        assert_eq!(fs::read_dir(store.root()).unwrap().count(), 0);
    }

    #[test]
    fn test_unsupported_suffix_creates_nothing() {
        let root = tempfile::tempdir().unwrap();
        let store = FileStore::new(root.path()).unwrap();

        let error = store.store_bytes("notes.txt", b"hello", None).unwrap_err();
        assert!(matches!(error, AppError::UnsupportedFormat(_)));
        assert_eq!(fs::read_dir(store.root()).unwrap().count(), 0);
    }

    #[test]
    fn test_filename_is_sanitized() {
        let root = tempfile::tempdir().unwrap();
        let store = FileStore::new(root.path()).unwrap();

        let stored = store.store_bytes("../../etc/x.pdb", b"ATOM", None).unwrap();
        assert_eq!(stored.path.parent().unwrap().parent().unwrap(), store.root());
        assert!(!stored.filename.contains('/'));
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = FileStore::generate_id("1ner.cif");
        let b = FileStore::generate_id("1ner.cif");
        assert_ne!(a, b);
        assert!(a.starts_with("1ner"));
    }

    #[test]
    fn test_remove_deletes_directory() {
        let root = tempfile::tempdir().unwrap();
        let store = FileStore::new(root.path()).unwrap();
        let stored = store.store_bytes("1ner.pdb", b"ATOM", None).unwrap();

        store.remove(&stored.path).unwrap();
        assert!(!stored.path.parent().unwrap().exists());
    }
}
