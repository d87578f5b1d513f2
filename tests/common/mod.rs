//! 集成测试共用的辅助工具
//!
//! - `MockCalculator`：可控耗时、可阻塞、可失败的计算后端
//! - `MockFetcher`：内存中的结构库
//! - `test_config` / `build_service`：指向临时目录的服务实例

#![allow(dead_code)]

use acc2_api::infrastructure::{AppConfig, TracingAuditLog};
use acc2_api::models::{CalculationOptions, MoleculeCharges, StructureInfo};
use acc2_api::services::{ChargeCalculator, MethodCandidates, RemoteSource, StructureFetcher};
use acc2_api::storage::PendingStructure;
use acc2_api::{AppError, ChargeService, Result};
use async_trait::async_trait;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const EEM_PARAMETERS: &str = "EEM_00_NEEMP_ccd2016_npa.json";

/// 手动开启的闸门，用来让计算停在半路
#[derive(Default)]
pub struct Gate {
    open: Mutex<bool>,
    cv: Condvar,
}

impl Gate {
    pub fn open(&self) {
        *self.open.lock() = true;
        self.cv.notify_all();
    }

    fn wait(&self) {
        let mut open = self.open.lock();
        while !*open {
            self.cv.wait(&mut open);
        }
    }
}

#[derive(Default)]
pub struct MockCalculator {
    pub delay: Duration,
    pub gate: Option<Arc<Gate>>,
    pub fail: bool,
    pub started: AtomicUsize,
}

impl MockCalculator {
    pub fn instant() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Default::default()
        })
    }

    pub fn gated(gate: Arc<Gate>) -> Arc<Self> {
        Arc::new(Self {
            gate: Some(gate),
            ..Default::default()
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Default::default()
        })
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }
}

impl ChargeCalculator for MockCalculator {
    fn available_methods(&self) -> Result<Vec<String>> {
        Ok(vec!["eem".to_string(), "veem".to_string()])
    }

    fn available_parameters(&self, method: &str) -> Result<Vec<String>> {
        match method {
            "eem" => Ok(vec![EEM_PARAMETERS.to_string()]),
            "veem" => Ok(Vec::new()),
            other => Err(AppError::MethodUnavailable(other.to_string())),
        }
    }

    fn suitable_methods(
        &self,
        _structure: &Path,
        _options: CalculationOptions,
    ) -> Result<MethodCandidates> {
        Ok(vec![
            ("eem".to_string(), vec![EEM_PARAMETERS.to_string()]),
            ("veem".to_string(), Vec::new()),
        ])
    }

    fn calculate(
        &self,
        structure: &Path,
        _method: &str,
        _parameters: Option<&str>,
        _options: CalculationOptions,
    ) -> Result<Vec<MoleculeCharges>> {
        self.started.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.wait();
        }
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if self.fail {
            return Err(AppError::ComputationFailed("molecule could not be parsed".into()));
        }

        let molecule = structure
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(vec![MoleculeCharges {
            molecule,
            charges: vec![0.123456, -0.123456],
        }])
    }

    fn structure_info(
        &self,
        _structure: &Path,
        options: CalculationOptions,
    ) -> Result<StructureInfo> {
        if self.fail {
            return Err(AppError::ComputationFailed("molecule could not be parsed".into()));
        }
        // 忽略水分子时少一个氧原子
        let oxygens = if options.ignore_water { 1 } else { 2 };
        Ok(StructureInfo {
            molecules: 1,
            atoms: 1 + oxygens,
            atom_counts: [("C".to_string(), 1), ("O".to_string(), oxygens)]
                .into_iter()
                .collect(),
        })
    }
}

/// 内存中的结构库，按块写入以模拟流式下载
#[derive(Default)]
pub struct MockFetcher {
    responses: HashMap<String, Vec<u8>>,
}

impl MockFetcher {
    pub fn with(mut self, id: &str, body: &[u8]) -> Self {
        self.responses.insert(id.to_string(), body.to_vec());
        self
    }
}

#[async_trait]
impl StructureFetcher for MockFetcher {
    async fn fetch(&self, source: &RemoteSource, sink: &mut PendingStructure) -> Result<()> {
        let body = self.responses.get(source.id()).ok_or_else(|| {
            AppError::upstream(Some(404), format!("404 Not Found for {}", source.id()))
        })?;
        for chunk in body.chunks(4) {
            sink.write_chunk(chunk)?;
        }
        Ok(())
    }
}

/// 指向临时目录的配置
pub fn test_config(root: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.paths.save_user_files = root.join("files").to_string_lossy().into_owned();
    config.paths.audit_log = root.join("removed_files.log").to_string_lossy().into_owned();
    config.jobs.workers = 2;
    config.jobs.queue_capacity = 8;
    config
}

pub fn build_service(config: AppConfig, calculator: Arc<MockCalculator>) -> ChargeService {
    build_service_with_fetcher(config, calculator, MockFetcher::default())
}

pub fn build_service_with_fetcher(
    config: AppConfig,
    calculator: Arc<MockCalculator>,
    fetcher: MockFetcher,
) -> ChargeService {
    ChargeService::new(config, calculator, Arc::new(fetcher), Arc::new(TracingAuditLog))
        .expect("service should start")
}

/// 轮询直到任务结束
pub async fn wait_for_outcome(
    service: &ChargeService,
    client: &str,
    job_id: &acc2_api::models::JobId,
) -> acc2_api::models::JobOutcome {
    for _ in 0..500 {
        match service.poll(client, job_id).await {
            Err(AppError::NotReady(_)) => tokio::time::sleep(Duration::from_millis(10)).await,
            Err(e) => panic!("poll failed: {:?}", e),
            Ok(outcome) => return outcome,
        }
    }
    panic!("job {} did not finish in time", job_id);
}

/// 等待计算后端被调用 `count` 次
pub async fn wait_until_started(calculator: &MockCalculator, count: usize) {
    for _ in 0..500 {
        if calculator.started() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("calculator was not started {} times", count);
}
