//! ACC II 电荷计算服务核心
//!
//! 管理临时上传的分子结构和计算任务：
//! - 为上传/下载的结构发放不透明 ID，记录所有者
//! - 按客户端限制磁盘占用和耗时计算次数（随时间衰减）
//! - 超过 TTL 未使用的结构自动清理
//! - 后台计算任务的结果只能领取一次
//!
//! HTTP 层和计算库不在本 crate 内，分别通过 [`application::ChargeService`]
//! 和 [`services::ChargeCalculator`] 对接。

pub mod application;
pub mod error;
pub mod infrastructure;
pub mod models;
pub mod services;
pub mod storage;
pub mod task_manager;
pub mod utils;

pub use application::ChargeService;
pub use error::{ApiResponse, AppError, ErrorKind, ErrorResponse, Result, UsageReport};
pub use infrastructure::AppConfig;
pub use task_manager::{JobDispatcher, JobStore};
