//! 应用层
//!
//! 协调存储、配额、任务与外部协作者，实现对外用例

pub mod charge_service;

pub use charge_service::ChargeService;
