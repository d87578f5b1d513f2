//! 结构登记表
//!
//! `id -> 记录` 与 `客户端 -> id 集合` 两张表是结构是否存在的唯一依据。
//! 两张表放在同一把锁后面，检查所有权、认领 ID 和释放配额在一个临界区内完成。

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::SystemTime;
use tracing::debug;

use crate::error::{AppError, Result};
use crate::models::StructureRecord;

/// 请求释放结构的一方
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requester<'a> {
    /// 内部调用 (过期清理)，不做所有权检查
    System,
    /// 客户端密钥，必须是结构的所有者
    Client(&'a str),
}

#[derive(Default)]
struct RegistryInner {
    records: HashMap<String, StructureRecord>,
    owners: HashMap<String, HashSet<String>>,
}

impl RegistryInner {
    fn unlink_owner(&mut self, owner: &str, id: &str) {
        if let Some(ids) = self.owners.get_mut(owner) {
            ids.remove(id);
            if ids.is_empty() {
                self.owners.remove(owner);
            }
        }
    }
}

/// 结构 ID 登记表及其所有者索引
#[derive(Default)]
pub struct StructureRegistry {
    inner: Mutex<RegistryInner>,
}

impl StructureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记新结构并关联到所有者
    ///
    /// ID 重复说明生成器出了问题，按不变量违例报告
    pub fn register(&self, record: StructureRecord) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.records.contains_key(&record.id) {
            return Err(AppError::invariant(format!(
                "structure id {} registered twice",
                record.id
            )));
        }

        inner
            .owners
            .entry(record.owner.clone())
            .or_default()
            .insert(record.id.clone());
        debug!(structure_id = %record.id, owner = %record.owner, "Registered structure");
        inner.records.insert(record.id.clone(), record);
        Ok(())
    }

    pub fn resolve(&self, id: &str) -> Result<PathBuf> {
        self.get(id).map(|record| record.path)
    }

    pub fn owner_of(&self, id: &str) -> Result<String> {
        self.get(id).map(|record| record.owner)
    }

    pub fn get(&self, id: &str) -> Result<StructureRecord> {
        self.inner
            .lock()
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| AppError::structure_not_found(id))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().records.contains_key(id)
    }

    /// 标记结构刚被使用
    ///
    /// 同时刷新文件 mtime，过期判断以它为准
    pub fn touch(&self, id: &str) -> Result<StructureRecord> {
        let mut inner = self.inner.lock();
        let record = inner
            .records
            .get_mut(id)
            .ok_or_else(|| AppError::structure_not_found(id))?;

        // 持锁写 mtime，清理线程在同一把锁下复查时一定能看到这次刷新
        let now = SystemTime::now();
        record.last_touched = now;
        if let Err(e) = std::fs::File::options()
            .write(true)
            .open(&record.path)
            .and_then(|file| file.set_modified(now))
        {
            debug!(structure_id = %id, error = %e, "Could not refresh structure mtime");
        }
        Ok(record.clone())
    }

    /// 移除结构
    ///
    /// 并发调用中只有一个能认领某个 ID，其余得到 `NotFound`。
    /// `on_claimed` 在临界区内执行，调用方在这里释放该结构占用的配额。
    pub fn release_with<F>(
        &self,
        id: &str,
        requester: Requester<'_>,
        on_claimed: F,
    ) -> Result<StructureRecord>
    where
        F: FnOnce(&StructureRecord),
    {
        let mut inner = self.inner.lock();
        let owner = match inner.records.get(id) {
            Some(record) => record.owner.clone(),
            None => return Err(AppError::structure_not_found(id)),
        };

        if let Requester::Client(client) = requester {
            if client != owner {
                return Err(AppError::not_owner(id));
            }
        }

        let record = inner
            .records
            .remove(id)
            .ok_or_else(|| AppError::structure_not_found(id))?;
        inner.unlink_owner(&owner, id);
        on_claimed(&record);
        Ok(record)
    }

    /// 仅当 `predicate` 在持锁时仍然成立才移除结构
    ///
    /// 谓词可以读文件元数据，这段 IO 有意放在锁内，与 [`Self::touch`] 互斥。
    /// 谓词拒绝时返回 `Ok(None)`。
    pub fn release_if<P, F>(
        &self,
        id: &str,
        predicate: P,
        on_claimed: F,
    ) -> Result<Option<StructureRecord>>
    where
        P: FnOnce(&StructureRecord) -> bool,
        F: FnOnce(&StructureRecord),
    {
        let mut inner = self.inner.lock();
        let matches = match inner.records.get(id) {
            Some(record) => predicate(record),
            None => return Err(AppError::structure_not_found(id)),
        };
        if !matches {
            return Ok(None);
        }

        let record = inner
            .records
            .remove(id)
            .ok_or_else(|| AppError::structure_not_found(id))?;
        inner.unlink_owner(&record.owner, id);
        on_claimed(&record);
        Ok(Some(record))
    }

    /// 当前所有 ID 的快照
    pub fn ids_snapshot(&self) -> Vec<String> {
        self.inner.lock().records.keys().cloned().collect()
    }

    /// `owner` 名下的记录，按 ID 排序
    pub fn records_of(&self, owner: &str) -> Vec<StructureRecord> {
        let inner = self.inner.lock();
        let mut records: Vec<StructureRecord> = inner
            .owners
            .get(owner)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.records.get(id).cloned())
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// 每个所有者登记的文件大小之和
    pub fn usage_by_owner(&self) -> HashMap<String, u64> {
        let inner = self.inner.lock();
        let mut usage = HashMap::new();
        for record in inner.records.values() {
            *usage.entry(record.owner.clone()).or_insert(0) += record.size;
        }
        usage
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 检查两张表是否一致
    pub fn check_consistency(&self) -> Result<()> {
        let inner = self.inner.lock();
        for (owner, ids) in &inner.owners {
            if ids.is_empty() {
                return Err(AppError::invariant(format!("owner {} has an empty id set", owner)));
            }
            for id in ids {
                match inner.records.get(id) {
                    Some(record) if &record.owner == owner => {}
                    _ => {
                        return Err(AppError::invariant(format!(
                            "owner index lists {} for {} but the registry disagrees",
                            id, owner
                        )))
                    }
                }
            }
        }
        for (id, record) in &inner.records {
            let linked = inner
                .owners
                .get(&record.owner)
                .map(|ids| ids.contains(id))
                .unwrap_or(false);
            if !linked {
                return Err(AppError::invariant(format!(
                    "structure {} is missing from the owner index",
                    id
                )));
            }
        }
        Ok(())
    }
}
