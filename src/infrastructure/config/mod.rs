//! 配置管理基础设施层
//!
//! 配置按以下顺序叠加：
//! - 内置默认值
//! - 可选的 TOML 配置文件
//! - `ACC2__` 前缀的环境变量（例如 `ACC2__LIMITS__GRANTED_SPACE=1048576`）

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use validator::{Validate, ValidationError};

use crate::error::AppError;

/// 配置错误类型
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("配置验证失败: {0}")]
    Validation(String),

    #[error("配置文件不存在: {0}")]
    FileNotFound(PathBuf),

    #[error("配置文件格式错误: {0}")]
    FormatError(String),
}

impl From<ConfigError> for AppError {
    fn from(error: ConfigError) -> Self {
        AppError::Config(error.to_string())
    }
}

/// 全局配置根结构
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct AppConfig {
    #[validate(nested)]
    pub paths: PathsConfig,

    #[validate(nested)]
    pub limits: LimitsConfig,

    #[validate(nested)]
    pub remove_tmp: RemoveTmpConfig,

    #[validate(nested)]
    pub jobs: JobsConfig,

    #[validate(nested)]
    pub upstream: UpstreamConfig,

    #[validate(nested)]
    pub calculator: CalculatorConfig,

    #[validate(nested)]
    pub monitoring: MonitoringConfig,
}

/// 路径配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct PathsConfig {
    /// 保存用户结构文件的根目录
    #[validate(length(min = 1, max = 500))]
    pub save_user_files: String,

    /// 删除审计日志
    #[validate(length(min = 1, max = 500))]
    pub audit_log: String,

    /// 滚动日志目录，为空时只输出到 stdout
    pub log_dir: Option<String>,
}

/// 配额配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LimitsConfig {
    /// 为 false 时关闭所有配额
    pub on: bool,

    /// 单个文件的大小上限（字节）
    #[validate(range(min = 1))]
    pub file_size: u64,

    /// 每个客户端的磁盘预算（字节）
    #[validate(range(min = 1))]
    pub granted_space: u64,

    /// 允许累计的耗时计算次数
    #[validate(range(min = 1, max = 10000))]
    pub max_long_calc: u32,

    /// 超过该时长（秒）的计算记为耗时计算
    #[validate(range(min = 0.0), custom(function = "validate_seconds"))]
    pub calc_time_secs: f64,

    /// 耗时计算计数每隔多少秒衰减一次
    #[validate(range(min = 1))]
    pub decrease_restriction_secs: u64,
}

/// 过期清理配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RemoveTmpConfig {
    /// 超过该时长（秒）未修改的结构会被删除
    #[validate(range(min = 1))]
    pub older_than_secs: u64,

    /// 清理间隔（秒）
    #[validate(range(min = 1))]
    pub every_x_seconds: u64,
}

/// 异步任务配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct JobsConfig {
    /// 同时运行的计算数量
    #[validate(range(min = 1, max = 1024))]
    pub workers: usize,

    /// 等待队列容量
    #[validate(range(min = 1, max = 100000))]
    pub queue_capacity: usize,

    /// 未领取结果的保留时间（秒）
    #[validate(range(min = 1))]
    pub result_ttl_secs: u64,

    /// 结果清理检查间隔（秒）
    #[validate(range(min = 1))]
    pub cleanup_interval_secs: u64,
}

/// 上游结构库配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct UpstreamConfig {
    /// PDB 下载地址模板，`{id}` 会被替换
    #[validate(length(min = 1))]
    pub pdb_url: String,

    /// PubChem 下载地址模板，`{id}` 会被替换
    #[validate(length(min = 1))]
    pub pubchem_url: String,

    #[validate(range(min = 1, max = 3600))]
    pub timeout_secs: u64,
}

/// 外部计算程序配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct CalculatorConfig {
    #[validate(length(min = 1, max = 500))]
    pub program: String,
}

/// 监控配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct MonitoringConfig {
    #[validate(length(min = 1, max = 100))]
    pub log_level: String,

    /// 以 JSON 格式输出日志
    pub json: bool,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            save_user_files: "./data/user_files".to_string(),
            audit_log: "./logs/removed_files.log".to_string(),
            log_dir: None,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            on: true,
            file_size: 10 * 1024 * 1024,
            granted_space: 50 * 1024 * 1024,
            max_long_calc: 5,
            calc_time_secs: 10.0,
            decrease_restriction_secs: 3600,
        }
    }
}

impl Default for RemoveTmpConfig {
    fn default() -> Self {
        Self {
            older_than_secs: 24 * 3600,
            every_x_seconds: 3600,
        }
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get().max(1),
            queue_capacity: 64,
            result_ttl_secs: 3600,
            cleanup_interval_secs: 60,
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            pdb_url: "https://files.rcsb.org/download/{id}.cif".to_string(),
            pubchem_url: "https://pubchem.ncbi.nlm.nih.gov/rest/pug/compound/CID/{id}/record/SDF/?record_type=3d&response_type=save&response_basename=Conformer3D_CID_{id}".to_string(),
            timeout_secs: 30,
        }
    }
}

impl Default for CalculatorConfig {
    fn default() -> Self {
        Self {
            program: "chargefw2-json".to_string(),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json: false,
        }
    }
}

impl LimitsConfig {
    pub fn long_calc_threshold(&self) -> Duration {
        Duration::try_from_secs_f64(self.calc_time_secs).unwrap_or(Duration::MAX)
    }

    pub fn decay_interval(&self) -> Duration {
        Duration::from_secs(self.decrease_restriction_secs)
    }
}

/// 秒数必须能表示为 `Duration`，`inf` 和 `nan` 都会被拒绝
fn validate_seconds(secs: f64) -> Result<(), ValidationError> {
    if Duration::try_from_secs_f64(secs).is_err() {
        return Err(ValidationError::new("Seconds must be a finite non-negative number"));
    }
    Ok(())
}

impl RemoveTmpConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.older_than_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.every_x_seconds)
    }
}

impl JobsConfig {
    pub fn result_ttl(&self) -> Duration {
        Duration::from_secs(self.result_ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

impl AppConfig {
    /// 加载配置
    ///
    /// `path` 为 `Some` 时文件必须存在
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let defaults = config::Config::try_from(&AppConfig::default())
            .map_err(|e| ConfigError::FormatError(e.to_string()))?;

        let mut builder = config::Config::builder().add_source(defaults);

        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::FileNotFound(path.to_path_buf()));
            }
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("ACC2")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ConfigError::FormatError(e.to_string()))?;

        config.validated()
    }

    /// 从 TOML 字符串解析（主要用于测试）
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig =
            toml::from_str(content).map_err(|e| ConfigError::FormatError(e.to_string()))?;
        config.validated()
    }

    fn validated(self) -> Result<Self, ConfigError> {
        self.validate()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.limits.on);
        assert_eq!(config.limits.file_size, 10 * 1024 * 1024);
        assert!(config.jobs.workers >= 1);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = AppConfig::from_toml(
            r#"
            [limits]
            granted_space = 1024
            max_long_calc = 2

            [remove_tmp]
            older_than_secs = 60
            "#,
        )
        .unwrap();

        assert_eq!(config.limits.granted_space, 1024);
        assert_eq!(config.limits.max_long_calc, 2);
        assert_eq!(config.remove_tmp.older_than_secs, 60);
        assert_eq!(config.remove_tmp.every_x_seconds, 3600);
        assert_eq!(config.calculator.program, "chargefw2-json");
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        let result = AppConfig::from_toml(
            r#"
            [remove_tmp]
            every_x_seconds = 0
            "#,
        );
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_non_finite_calc_time_is_rejected() {
        for value in ["inf", "nan", "-1.0"] {
            let result = AppConfig::from_toml(&format!("[limits]\ncalc_time_secs = {}", value));
            assert!(matches!(result, Err(ConfigError::Validation(_))), "{}", value);
        }

        let mut limits = AppConfig::default().limits;
        limits.calc_time_secs = f64::INFINITY;
        assert_eq!(limits.long_calc_threshold(), Duration::MAX);
        limits.calc_time_secs = 0.5;
        assert_eq!(limits.long_calc_threshold(), Duration::from_millis(500));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[jobs]\nworkers = 3\nqueue_capacity = 7").unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.jobs.workers, 3);
        assert_eq!(config.jobs.queue_capacity, 7);
    }

    #[test]
    fn test_missing_file_is_reported() {
        let result = AppConfig::load(Some(Path::new("/nonexistent/acc2.toml")));
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }
}
