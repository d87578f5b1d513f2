//! 结构目录清理工具
//!
//! 每个结构文件独占一个临时目录，删除时目录和文件作为一个整体移除。

use std::fs;
use std::io;
use std::path::Path;
use tracing::{info, warn};

use super::retry::RetryPolicy;

/// 删除结构文件及其所在的临时目录
///
/// 只允许删除 `root` 下的直接子目录，避免误删存储根目录以外的内容。
/// 文件已经不存在时视为成功。
pub fn remove_structure_dir(file: &Path, root: &Path) -> io::Result<()> {
    let dir = file.parent().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} has no parent directory", file.display()),
        )
    })?;

    if dir.parent() != Some(root) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "{} is not a structure directory under {}",
                dir.display(),
                root.display()
            ),
        ));
    }

    if !dir.exists() {
        return Ok(());
    }

    RetryPolicy::REMOVAL.run("remove_structure_dir", || match fs::remove_dir_all(dir) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    })
}

/// 清空存储根目录中遗留的结构目录
///
/// 进程重启后旧的结构 ID 全部失效，对应的目录不再可达。
/// 返回删除的目录数量，单个目录失败只记录警告。
pub fn purge_storage_root(root: &Path) -> io::Result<usize> {
    if !root.exists() {
        return Ok(0);
    }

    let mut removed = 0;
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let path = entry.path();
        let result = if entry.file_type()?.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };

        match result {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to purge stale entry"),
        }
    }

    if removed > 0 {
        info!(root = %root.display(), removed, "Purged stale structure directories");
    }
    Ok(removed)
}
