//! ACC II API - 主入口
//!
//! 负责：
//! - 加载配置（命令行参数或 `ACC2_CONFIG` 指定的 TOML 文件）
//! - 初始化日志系统
//! - 启动服务核心和后台定时任务
//! - 收到 Ctrl-C 后优雅关闭

use acc2_api::infrastructure::{init_tracing, AppConfig, FileAuditLog};
use acc2_api::services::{CommandCalculator, HttpStructureFetcher};
use acc2_api::ChargeService;
use eyre::WrapErr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("ACC2_CONFIG").ok())
        .map(PathBuf::from);

    let config =
        AppConfig::load(config_path.as_deref()).wrap_err("failed to load configuration")?;

    // guard 必须持有到进程结束
    let _log_guard = init_tracing(
        &config.monitoring,
        config.paths.log_dir.as_deref().map(Path::new),
    );

    info!("🚀 ACC II API v{} - 启动中...", env!("CARGO_PKG_VERSION"));
    if let Some(path) = &config_path {
        info!(config = %path.display(), "Configuration loaded");
    }

    let calculator = Arc::new(CommandCalculator::new(&config.calculator.program));
    let fetcher = Arc::new(HttpStructureFetcher::new(&config.upstream)?);
    let audit = Arc::new(
        FileAuditLog::new(&config.paths.audit_log).wrap_err("failed to open audit log")?,
    );

    let service = ChargeService::new(config, calculator, fetcher, audit)?;
    service.start_background_tasks();
    info!("✅ 服务已启动，按 Ctrl-C 退出");

    tokio::signal::ctrl_c()
        .await
        .wrap_err("failed to listen for shutdown signal")?;

    service.shutdown().await;
    info!("👋 已退出");
    Ok(())
}
