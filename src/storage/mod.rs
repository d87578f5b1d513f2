//! 结构存储
//!
//! - `registry`: id → 记录、客户端 → id 集合，结构是否存在以它为准
//! - `file_store`: 磁盘上每个结构文件一个临时目录

pub mod file_store;
pub mod registry;

pub use file_store::{normalize_line_endings, FileStore, PendingStructure, StoredFile};
pub use registry::{Requester, StructureRegistry};
