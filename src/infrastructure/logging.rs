//! 日志系统初始化
//!
//! stdout 输出始终开启；配置了日志目录时额外写入按天滚动的日志文件。

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use super::config::MonitoringConfig;

/// 统计事件的 target（对应各个操作的使用统计）
pub const STATISTICS_TARGET: &str = "acc2::statistics";

/// 错误事件的 target
pub const ERRORS_TARGET: &str = "acc2::errors";

/// 初始化 tracing
///
/// `RUST_LOG` 优先于配置中的日志级别。返回的 guard 必须在进程退出前一直持有，
/// 否则文件日志可能丢失。重复初始化时只打印警告。
pub fn init_tracing(config: &MonitoringConfig, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "acc2-api.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry().with(filter).with(file_layer);

    let result = if config.json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer()).try_init()
    };

    if let Err(e) = result {
        eprintln!("[WARN] tracing already initialized: {}", e);
    }

    guard
}
