//! 基础设施层 - 技术实现
//!
//! 提供配置加载、日志初始化和审计日志等技术实现

pub mod audit;
pub mod config;
pub mod logging;

pub use audit::{AuditEntry, AuditSink, FileAuditLog, RemovalCause, TracingAuditLog};
pub use config::{AppConfig, ConfigError};
pub use logging::init_tracing;
