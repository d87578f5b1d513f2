//! 异步计算任务记录

use serde::{Deserialize, Serialize};
use std::time::Instant;
use uuid::Uuid;

use super::charges::{ChargeRequest, ChargesPayload};
use crate::error::AppError;

/// 任务 ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// 任务状态
///
/// `Pending → {Done | Failed} → Consumed`，`Consumed` 后记录即被删除
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    /// 等待或运行中
    Pending,
    /// 计算成功
    Done,
    /// 计算失败
    Failed,
    /// 结果已被领取
    Consumed,
}

/// 任务结果：成功的电荷或保存下来的错误
pub type JobOutcome = std::result::Result<ChargesPayload, AppError>;

/// 任务记录
#[derive(Debug)]
pub struct JobRecord {
    pub job_id: JobId,
    pub owner: String,
    pub structure_id: String,
    pub request: ChargeRequest,
    pub state: JobState,
    pub outcome: Option<JobOutcome>,
    pub created_at: Instant,
    pub completed_at: Option<Instant>,
}

impl JobRecord {
    pub fn pending(
        job_id: JobId,
        owner: String,
        structure_id: String,
        request: ChargeRequest,
    ) -> Self {
        Self {
            job_id,
            owner,
            structure_id,
            request,
            state: JobState::Pending,
            outcome: None,
            created_at: Instant::now(),
            completed_at: None,
        }
    }

    /// 记录计算结果，Pending 之外的状态不再变化
    pub fn complete(&mut self, outcome: JobOutcome) -> bool {
        if self.state != JobState::Pending {
            return false;
        }
        self.state = if outcome.is_ok() {
            JobState::Done
        } else {
            JobState::Failed
        };
        self.outcome = Some(outcome);
        self.completed_at = Some(Instant::now());
        true
    }
}

/// 任务状态快照（不含结果）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobSummary {
    pub job_id: JobId,
    pub owner: String,
    pub structure_id: String,
    pub state: JobState,
}

impl From<&JobRecord> for JobSummary {
    fn from(record: &JobRecord) -> Self {
        Self {
            job_id: record.job_id.clone(),
            owner: record.owner.clone(),
            structure_id: record.structure_id.clone(),
            state: record.state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_completes_once() {
        let mut record = JobRecord::pending(
            JobId::generate(),
            "client".into(),
            "structure".into(),
            ChargeRequest::default(),
        );
        assert!(record.complete(Err(AppError::ComputationFailed("boom".into()))));
        assert_eq!(record.state, JobState::Failed);
        assert!(!record.complete(Err(AppError::ComputationFailed("again".into()))));
        assert!(record.completed_at.is_some());
    }

    #[test]
    fn test_job_ids_are_unique() {
        assert_ne!(JobId::generate(), JobId::generate());
    }
}
