//! 通用工具函数模块
//!
//! 提供重试机制和结构目录清理功能。

pub mod cleanup;
pub mod retry;

pub use cleanup::*;
pub use retry::*;
