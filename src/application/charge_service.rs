//! 电荷计算服务
//!
//! 位于 HTTP 层和外部协作者（计算库、公共结构库）之间，负责：
//! - 结构上传/下载：写盘、扣配额、发放 ID
//! - 结构删除：所有者校验、释放配额、删除目录
//! - 同步计算与后台任务：速率限制、方法解析、结果一次性领取
//! - 后台定时任务：配额衰减与过期清理

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};
use crate::infrastructure::audit::AuditSink;
use crate::infrastructure::config::AppConfig;
use crate::infrastructure::logging::STATISTICS_TARGET;
use crate::models::{
    CalculationOptions, ChargeRequest, ChargesPayload, JobId, JobOutcome, JobRecord,
    QuotaSnapshot, RemovalPolicy, StructureFileInfo, StructureFormat, StructureInfo,
    StructureRecord, SuitableMethod, UploadOutcome,
};
use crate::services::{
    BackgroundScheduler, ChargeCalculator, ExpiryReaper, QuotaPolicy, QuotaTracker,
    RemoteSource, StructureFetcher,
};
use crate::storage::{FileStore, StoredFile, StructureRegistry};
use crate::task_manager::{
    ComputeRunner, JobDispatcher, JobStore, JobStoreConfig, ResolvedCalculation,
};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// 电荷计算服务
pub struct ChargeService {
    config: AppConfig,
    files: FileStore,
    registry: Arc<StructureRegistry>,
    quota: Arc<QuotaTracker>,
    reaper: Arc<ExpiryReaper>,
    fetcher: Arc<dyn StructureFetcher>,
    runner: Arc<ComputeRunner>,
    jobs: JobStore,
    dispatcher: JobDispatcher,
    scheduler: BackgroundScheduler,
}

impl ChargeService {
    /// 创建服务
    ///
    /// 存储根目录中上一个进程遗留的结构会被清空。必须在 tokio 运行时内调用。
    pub fn new(
        config: AppConfig,
        calculator: Arc<dyn ChargeCalculator>,
        fetcher: Arc<dyn StructureFetcher>,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self> {
        let files = FileStore::new(&config.paths.save_user_files)?;
        let purged = files.purge()?;
        if purged > 0 {
            info!(purged, root = %files.root().display(), "Removed structures of a previous run");
        }

        let registry = Arc::new(StructureRegistry::new());
        let quota = Arc::new(QuotaTracker::new(QuotaPolicy::from(&config.limits)));
        let reaper = Arc::new(ExpiryReaper::new(
            registry.clone(),
            quota.clone(),
            files.clone(),
            audit,
            config.remove_tmp.ttl(),
        ));
        let runner = Arc::new(ComputeRunner::new(
            calculator,
            quota.clone(),
            config.limits.long_calc_threshold(),
        ));
        let jobs = JobStore::new(JobStoreConfig {
            result_ttl: config.jobs.result_ttl(),
            cleanup_interval: config.jobs.cleanup_interval(),
        });
        let dispatcher = JobDispatcher::new(
            jobs.clone(),
            runner.clone(),
            config.jobs.workers,
            config.jobs.queue_capacity,
        );

        info!(
            root = %files.root().display(),
            quotas = config.limits.on,
            workers = config.jobs.workers,
            "Charge service ready"
        );

        Ok(Self {
            config,
            files,
            registry,
            quota,
            reaper,
            fetcher,
            runner,
            jobs,
            dispatcher,
            scheduler: BackgroundScheduler::new(),
        })
    }

    /// 启动配额衰减和过期清理定时任务
    pub fn start_background_tasks(&self) {
        let quota = self.quota.clone();
        self.scheduler.spawn_periodic(
            "quota_decay",
            self.config.limits.decay_interval(),
            move || {
                quota.decay_tick();
            },
        );

        let reaper = self.reaper.clone();
        self.scheduler.spawn_periodic(
            "expiry_sweep",
            self.config.remove_tmp.sweep_interval(),
            move || {
                reaper.sweep();
            },
        );
    }

    /// 停止定时任务和工作池
    pub async fn shutdown(&self) {
        info!("Charge service shutting down");
        self.scheduler.shutdown().await;
        self.dispatcher.shutdown(SHUTDOWN_GRACE).await;
        self.jobs.shutdown();
    }

    fn max_file_size(&self) -> Option<u64> {
        self.config.limits.on.then_some(self.config.limits.file_size)
    }

    /// 扣配额并登记，任一步失败都删除已写入的文件
    fn admit(&self, client: &str, stored: StoredFile) -> Result<String> {
        let files = self.files.clone();
        let guard = scopeguard::guard(stored.path.clone(), move |path| {
            if let Err(e) = files.remove(&path) {
                warn!(path = %path.display(), error = %e, "Failed to discard rejected structure");
            }
        });

        self.quota.reserve(client, stored.size)?;

        let id = FileStore::generate_id(&stored.filename);
        let record = StructureRecord {
            id: id.clone(),
            path: stored.path,
            owner: client.to_string(),
            size: stored.size,
            filename: stored.filename,
            format: stored.format,
            last_touched: SystemTime::now(),
        };
        if let Err(e) = self.registry.register(record) {
            self.quota.release(client, stored.size);
            return Err(e);
        }

        scopeguard::ScopeGuard::into_inner(guard);
        debug!(client, structure_id = %id, bytes = stored.size, "Structure admitted");
        Ok(id)
    }

    /// 上传单个结构文件，返回结构 ID
    pub fn upload(&self, client: &str, filename: &str, bytes: &[u8]) -> Result<String> {
        let stored = self
            .files
            .store_bytes(filename, bytes, self.max_file_size())?;
        let id = self.admit(client, stored)?;
        info!(
            target: STATISTICS_TARGET,
            client,
            endpoint = "send_files",
            number_of_sent_files = 1,
            "Structure uploaded"
        );
        Ok(id)
    }

    /// 批量上传
    ///
    /// 格式或大小不合法时整批拒绝；磁盘配额不足时保留已保存的文件，
    /// 并在结果中标记 `quota_exceeded`。一个文件都没保存时返回 `QuotaExceeded`。
    /// 其他错误会撤销本批已登记的结构再返回，客户端不会为拿不到 ID 的结构占用配额
    pub fn upload_batch(
        &self,
        client: &str,
        files: &[(String, Vec<u8>)],
    ) -> Result<UploadOutcome> {
        for (filename, bytes) in files {
            StructureFormat::from_filename(filename)?;
            if let Some(limit) = self.max_file_size() {
                if bytes.len() as u64 > limit {
                    return Err(AppError::FileTooLarge {
                        name: filename.clone(),
                        limit,
                    });
                }
            }
        }

        let mut outcome = UploadOutcome::default();
        for (filename, bytes) in files {
            let admitted = self
                .files
                .store_bytes(filename, bytes, self.max_file_size())
                .and_then(|stored| self.admit(client, stored));
            match admitted {
                Ok(id) => {
                    outcome.structure_ids.insert(filename.clone(), id);
                }
                Err(e @ AppError::QuotaExceeded { .. }) if outcome.structure_ids.is_empty() => {
                    return Err(e)
                }
                Err(AppError::QuotaExceeded { .. }) => {
                    outcome.quota_exceeded = true;
                    break;
                }
                Err(e) => {
                    self.roll_back_batch(client, &outcome);
                    return Err(e);
                }
            }
        }

        info!(
            target: STATISTICS_TARGET,
            client,
            endpoint = "send_files",
            number_of_sent_files = outcome.structure_ids.len(),
            quota_exceeded = outcome.quota_exceeded,
            "Structures uploaded"
        );
        Ok(outcome)
    }

    /// 从公共结构库下载结构
    pub async fn fetch_remote(&self, client: &str, source: &RemoteSource) -> Result<String> {
        let mut pending = self
            .files
            .begin(&source.filename(), self.max_file_size())?;
        self.fetcher.fetch(source, &mut pending).await?;
        let stored = pending.finish()?;
        let id = self.admit(client, stored)?;

        info!(
            target: STATISTICS_TARGET,
            client,
            endpoint = source.endpoint(),
            remote_id = source.id(),
            "Structure fetched"
        );
        Ok(id)
    }

    pub async fn fetch_pdb(&self, client: &str, pdb_id: &str) -> Result<String> {
        self.fetch_remote(client, &RemoteSource::pdb(pdb_id)?).await
    }

    pub async fn fetch_pubchem(&self, client: &str, cid: &str) -> Result<String> {
        self.fetch_remote(client, &RemoteSource::pubchem(cid)?).await
    }

    /// 批量下载，配额与失败撤销的语义同 [`ChargeService::upload_batch`]
    pub async fn fetch_batch(
        &self,
        client: &str,
        sources: &[RemoteSource],
    ) -> Result<UploadOutcome> {
        let mut outcome = UploadOutcome::default();
        for source in sources {
            match self.fetch_remote(client, source).await {
                Ok(id) => {
                    outcome.structure_ids.insert(source.id().to_string(), id);
                }
                Err(e @ AppError::QuotaExceeded { .. }) if outcome.structure_ids.is_empty() => {
                    return Err(e)
                }
                Err(AppError::QuotaExceeded { .. }) => {
                    outcome.quota_exceeded = true;
                    break;
                }
                Err(e) => {
                    self.roll_back_batch(client, &outcome);
                    return Err(e);
                }
            }
        }
        Ok(outcome)
    }

    /// 撤销失败批次中已登记的结构
    fn roll_back_batch(&self, client: &str, outcome: &UploadOutcome) {
        for id in outcome.structure_ids.values() {
            match self.reaper.roll_back(id, client) {
                Ok(_) | Err(AppError::NotFound(_)) => {}
                Err(e) => {
                    warn!(client, structure_id = %id, error = %e, "Failed to roll back structure")
                }
            }
        }
        if !outcome.structure_ids.is_empty() {
            info!(
                client,
                rolled_back = outcome.structure_ids.len(),
                "Batch failed, admitted structures rolled back"
            );
        }
    }

    /// 所有者删除结构
    pub fn remove(&self, client: &str, structure_id: &str) -> Result<()> {
        self.reaper.remove_owned(structure_id, client)?;
        info!(
            target: STATISTICS_TARGET,
            client,
            endpoint = "remove_file",
            structure_id,
            "Structure removed"
        );
        Ok(())
    }

    /// 可用的计算方法
    pub async fn available_methods(&self) -> Result<Vec<String>> {
        let runner = self.runner.clone();
        blocking(move || runner.calculator().available_methods()).await
    }

    /// 方法可用的参数集
    pub async fn available_parameters(&self, method: &str) -> Result<Vec<String>> {
        let runner = self.runner.clone();
        let method = method.to_string();
        blocking(move || runner.calculator().available_parameters(&method)).await
    }

    /// 适用于结构的方法，第一个是默认方法
    pub async fn suitable_methods(
        &self,
        structure_id: &str,
        options: CalculationOptions,
    ) -> Result<Vec<SuitableMethod>> {
        let record = self.registry.touch(structure_id)?;
        let runner = self.runner.clone();
        let candidates =
            blocking(move || runner.calculator().suitable_methods(&record.path, options)).await?;
        Ok(candidates
            .into_iter()
            .map(|(method, files)| SuitableMethod::from_parameter_files(method, files))
            .collect())
    }

    /// 结构的分子数、原子数和元素组成
    pub async fn info(
        &self,
        structure_id: &str,
        options: CalculationOptions,
    ) -> Result<StructureInfo> {
        let record = self.registry.touch(structure_id)?;
        let runner = self.runner.clone();
        let info =
            blocking(move || runner.calculator().structure_info(&record.path, options)).await?;

        info!(
            target: STATISTICS_TARGET,
            endpoint = "get_info",
            structure_id,
            molecules = info.molecules,
            atoms = info.atoms,
            "Structure info"
        );
        Ok(info)
    }

    /// 下载已保存的结构文件
    ///
    /// 返回的记录指向磁盘上的文件，由 HTTP 层负责打包发送；读取算作一次使用
    pub fn structure_file(&self, structure_id: &str) -> Result<StructureRecord> {
        let record = self.registry.touch(structure_id)?;
        info!(
            target: STATISTICS_TARGET,
            endpoint = "get_structure_file",
            structure_id,
            filename = %record.filename,
            "Structure file requested"
        );
        Ok(record)
    }

    /// 解析结构、检查速率限制、确定方法和参数
    async fn prepare(
        &self,
        client: &str,
        structure_id: &str,
        request: &ChargeRequest,
    ) -> Result<ResolvedCalculation> {
        let record = self.registry.touch(structure_id)?;
        self.quota.check_rate_limit(client)?;

        let runner = self.runner.clone();
        let request = request.clone();
        let owner = client.to_string();
        blocking(move || resolve_method(runner.calculator().as_ref(), owner, record, request))
            .await
    }

    /// 同步计算，阻塞到计算结束
    pub async fn compute(
        &self,
        client: &str,
        structure_id: &str,
        request: &ChargeRequest,
    ) -> Result<ChargesPayload> {
        let calculation = self.prepare(client, structure_id, request).await?;
        let payload = self.runner.run_blocking(calculation).await?;

        info!(
            target: STATISTICS_TARGET,
            client,
            endpoint = "calculate_charges",
            structure_id,
            method = %payload.method,
            calc_time = payload.calc_time,
            "Charges calculated"
        );
        Ok(payload)
    }

    /// 提交后台计算，立即返回任务 ID
    pub async fn submit(
        &self,
        client: &str,
        structure_id: &str,
        request: &ChargeRequest,
    ) -> Result<JobId> {
        let calculation = self.prepare(client, structure_id, request).await?;
        let job_id = JobId::generate();
        let record = JobRecord::pending(
            job_id.clone(),
            client.to_string(),
            structure_id.to_string(),
            ChargeRequest {
                method: Some(calculation.method.clone()),
                parameters: calculation.parameters.clone(),
                options: calculation.options,
            },
        );
        self.dispatcher.submit(record, calculation).await?;

        info!(
            target: STATISTICS_TARGET,
            client,
            endpoint = "submit_calculation",
            structure_id,
            job_id = %job_id,
            "Calculation submitted"
        );
        Ok(job_id)
    }

    /// 领取后台计算结果
    ///
    /// 结果只能领取一次
    pub async fn poll(&self, client: &str, job_id: &JobId) -> Result<JobOutcome> {
        self.jobs.poll(job_id, client).await
    }

    /// 客户端的配额和文件信息
    pub fn limits(&self, client: &str) -> QuotaSnapshot {
        let now = SystemTime::now();
        let usage = self.quota.usage(client);
        let files = self
            .registry
            .records_of(client)
            .into_iter()
            .map(|record| StructureFileInfo {
                last_modified_secs_ago: round2(record.idle_for(now).as_secs_f64()),
                structure_id: record.id,
                filename: record.filename,
            })
            .collect();

        QuotaSnapshot {
            enabled: self.config.limits.on,
            max_file_size: self.config.limits.file_size,
            granted_space: self.config.limits.granted_space,
            used_space: usage.used_bytes,
            max_long_calc: self.config.limits.max_long_calc,
            remaining_long_calc: self.quota.remaining_long_calc(client),
            removal_policy: RemovalPolicy {
                older_than_secs: self.config.remove_tmp.older_than_secs,
                every_x_seconds: self.config.remove_tmp.every_x_seconds,
            },
            files,
        }
    }

    pub fn registry(&self) -> &Arc<StructureRegistry> {
        &self.registry
    }

    pub fn quota(&self) -> &Arc<QuotaTracker> {
        &self.quota
    }

    pub fn reaper(&self) -> &Arc<ExpiryReaper> {
        &self.reaper
    }

    pub fn jobs(&self) -> &JobStore {
        &self.jobs
    }

    pub fn files(&self) -> &FileStore {
        &self.files
    }

    pub fn scheduler(&self) -> &BackgroundScheduler {
        &self.scheduler
    }

    /// 每个客户端的结构占用，供一致性检查使用
    pub fn usage_by_owner(&self) -> BTreeMap<String, u64> {
        self.registry.usage_by_owner().into_iter().collect()
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AppError::Internal(format!("calculator task failed: {}", e)))?
}

/// 参数名既可以是参数文件名，也可以是去掉后缀的名字
fn parameters_match(known: &str, requested: &str) -> bool {
    known == requested
        || std::path::Path::new(known)
            .file_stem()
            .map(|stem| stem == requested)
            .unwrap_or(false)
}

/// 校验或选择计算方法
///
/// 未指定方法时使用第一个适用方法及其第一组参数，此时忽略请求中的参数
fn resolve_method(
    calculator: &dyn ChargeCalculator,
    owner: String,
    record: StructureRecord,
    request: ChargeRequest,
) -> Result<ResolvedCalculation> {
    let options = request.options;
    let (method, parameters) = match request.method {
        Some(method) => {
            if !calculator.available_methods()?.contains(&method) {
                return Err(AppError::MethodUnavailable(method));
            }
            let parameters = match request.parameters {
                Some(parameters) => {
                    let known = calculator.available_parameters(&method)?;
                    if !known.iter().any(|k| parameters_match(k, &parameters)) {
                        return Err(AppError::ParametersInvalid { method, parameters });
                    }
                    Some(parameters)
                }
                None => None,
            };
            (method, parameters)
        }
        None => {
            let (method, files) = calculator
                .suitable_methods(&record.path, options)?
                .into_iter()
                .next()
                .ok_or_else(|| {
                    AppError::ComputationFailed(format!(
                        "no suitable method for structure {}",
                        record.id
                    ))
                })?;
            let suitable = SuitableMethod::from_parameter_files(method, files);
            let parameters = suitable.parameters.and_then(|p| p.into_iter().next());
            (suitable.method, parameters)
        }
    };

    Ok(ResolvedCalculation {
        owner,
        structure_id: record.id,
        path: record.path,
        method,
        parameters,
        options,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("EEM_00_NEEMP_ccd2016_npa.json", "EEM_00_NEEMP_ccd2016_npa", true)]
    #[case("EEM_00_NEEMP_ccd2016_npa.json", "EEM_00_NEEMP_ccd2016_npa.json", true)]
    #[case("EEM_00_NEEMP_ccd2016_npa.json", "EEM_10", false)]
    fn test_parameters_match(
        #[case] known: &str,
        #[case] requested: &str,
        #[case] expected: bool,
    ) {
        assert_eq!(parameters_match(known, requested), expected);
    }

    #[test]
    fn test_round2() {
        assert_eq!(round2(1.23456), 1.23);
        assert_eq!(round2(0.0), 0.0);
    }
}
