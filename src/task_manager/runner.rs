//! 计算执行
//!
//! 同步计算和后台任务共用同一个执行逻辑：计时、调用计算后端、
//! 超过阈值时记一次耗时计算、整理结果。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::error::{AppError, Result};
use crate::models::{CalculationOptions, ChargesPayload};
use crate::services::{ChargeCalculator, QuotaTracker};

/// 已解析好的计算参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCalculation {
    pub owner: String,
    pub structure_id: String,
    pub path: PathBuf,
    pub method: String,
    pub parameters: Option<String>,
    pub options: CalculationOptions,
}

/// 计算执行器
pub struct ComputeRunner {
    calculator: Arc<dyn ChargeCalculator>,
    quota: Arc<QuotaTracker>,
    long_calc_threshold: Duration,
}

impl ComputeRunner {
    pub fn new(
        calculator: Arc<dyn ChargeCalculator>,
        quota: Arc<QuotaTracker>,
        long_calc_threshold: Duration,
    ) -> Self {
        Self {
            calculator,
            quota,
            long_calc_threshold,
        }
    }

    pub fn calculator(&self) -> &Arc<dyn ChargeCalculator> {
        &self.calculator
    }

    /// 执行计算（阻塞）
    ///
    /// 无论成功与否，耗时超过阈值都计入客户端的耗时计算次数
    pub fn run(&self, job: &ResolvedCalculation) -> Result<ChargesPayload> {
        let started = Instant::now();
        let result = self.calculator.calculate(
            &job.path,
            &job.method,
            job.parameters.as_deref(),
            job.options,
        );
        let elapsed = started.elapsed();

        if elapsed > self.long_calc_threshold {
            info!(
                client = %job.owner,
                structure_id = %job.structure_id,
                elapsed_secs = elapsed.as_secs_f64(),
                "Long calculation recorded"
            );
            self.quota.record_long_calculation(&job.owner);
        } else {
            debug!(
                structure_id = %job.structure_id,
                elapsed_secs = elapsed.as_secs_f64(),
                "Calculation finished"
            );
        }

        let charges = result?;
        Ok(ChargesPayload::rounded(
            charges,
            job.method.clone(),
            job.parameters.clone(),
            elapsed.as_secs_f64(),
        ))
    }

    /// 在阻塞线程池中执行计算
    pub async fn run_blocking(
        self: &Arc<Self>,
        job: ResolvedCalculation,
    ) -> Result<ChargesPayload> {
        let runner = Arc::clone(self);
        tokio::task::spawn_blocking(move || runner.run(&job))
            .await
            .map_err(|e| AppError::Internal(format!("calculation task failed: {}", e)))?
    }
}
