use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::infrastructure::logging::ERRORS_TARGET;

/**
 * 应用错误类型 - 使用 miette 提供用户友好的错误诊断
 *
 * 每个变体对应一个稳定的 `ErrorKind`，由 HTTP 层转换为结构化错误响应
 */
#[derive(Error, Debug, Diagnostic)]
pub enum AppError {
    #[error("{0}")]
    #[diagnostic(code(acc2::not_found))]
    NotFound(String),

    #[error("{0}")]
    #[diagnostic(code(acc2::forbidden))]
    Forbidden(String),

    #[error(
        "You have exceeded the granted disk space ({used} of {budget} bytes used, {requested} bytes requested)."
    )]
    #[diagnostic(
        code(acc2::quota_exceeded),
        help("Remove some of your structures or wait until they expire")
    )]
    QuotaExceeded { used: u64, budget: u64, requested: u64 },

    #[error("You can perform only {allowed} time demanding calculations at once ({performed} recorded).")]
    #[diagnostic(
        code(acc2::rate_limited),
        help("The allowance is restored gradually; try again later")
    )]
    RateLimited { performed: u32, allowed: u32 },

    #[error("Calculation {0} is still running.")]
    #[diagnostic(code(acc2::not_ready), help("Poll again later"))]
    NotReady(String),

    #[error("Unsupported format. Send only .sdf, .mol2, .cif and .pdb files (got {0}).")]
    #[diagnostic(code(acc2::unsupported_format))]
    UnsupportedFormat(String),

    #[error("Not possible to upload {name}. It is bigger than {limit} bytes.")]
    #[diagnostic(code(acc2::file_too_large))]
    FileTooLarge { name: String, limit: u64 },

    #[error("Upstream fetch failed: {message}")]
    #[diagnostic(code(acc2::upstream_fetch))]
    UpstreamFetch { status: Option<u16>, message: String },

    #[error("Method {0} is not available.")]
    #[diagnostic(code(acc2::method_unavailable))]
    MethodUnavailable(String),

    #[error("Parameters {parameters} are not valid for method {method}.")]
    #[diagnostic(code(acc2::parameters_invalid))]
    ParametersInvalid { method: String, parameters: String },

    #[error("Calculation failed: {0}")]
    #[diagnostic(code(acc2::computation_failed))]
    ComputationFailed(String),

    #[error("Calculation queue is full ({0} jobs waiting).")]
    #[diagnostic(code(acc2::busy), help("Retry the request later"))]
    Busy(usize),

    #[error("Invariant violation: {0}")]
    #[diagnostic(code(acc2::invariant_violation), severity(Error))]
    InvariantViolation(String),

    #[error("IO error: {0}")]
    #[diagnostic(code(acc2::io_error))]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    #[diagnostic(code(acc2::config_error))]
    Config(String),

    #[error("Internal error: {0}")]
    #[diagnostic(code(acc2::internal_error))]
    Internal(String),
}

/// 稳定的错误分类，对外暴露给客户端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Forbidden,
    QuotaExceeded,
    RateLimited,
    NotReady,
    UnsupportedFormat,
    FileTooLarge,
    UpstreamFetchError,
    MethodUnavailable,
    ParametersInvalid,
    ComputationFailed,
    Busy,
    InvariantViolation,
    Internal,
}

impl AppError {
    pub fn structure_not_found(structure_id: &str) -> Self {
        AppError::NotFound(format!("Structure ID {} does not exist.", structure_id))
    }

    pub fn job_not_found(job_id: &str) -> Self {
        AppError::NotFound(format!(
            "Calculation {} does not exist or its result was already collected.",
            job_id
        ))
    }

    pub fn not_owner(structure_id: &str) -> Self {
        AppError::Forbidden(format!(
            "You are not allowed to access {}. It is not your structure.",
            structure_id
        ))
    }

    /**
     * 创建内部不变量错误
     *
     * 以最高级别记录，属于编程错误信号而不是普通的用户错误
     */
    pub fn invariant(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::error!(target: ERRORS_TARGET, invariant = %message, "Invariant violation");
        AppError::InvariantViolation(message)
    }

    pub fn upstream(status: Option<u16>, message: impl Into<String>) -> Self {
        AppError::UpstreamFetch {
            status,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::NotFound(_) => ErrorKind::NotFound,
            AppError::Forbidden(_) => ErrorKind::Forbidden,
            AppError::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            AppError::RateLimited { .. } => ErrorKind::RateLimited,
            AppError::NotReady(_) => ErrorKind::NotReady,
            AppError::UnsupportedFormat(_) => ErrorKind::UnsupportedFormat,
            AppError::FileTooLarge { .. } => ErrorKind::FileTooLarge,
            AppError::UpstreamFetch { .. } => ErrorKind::UpstreamFetchError,
            AppError::MethodUnavailable(_) => ErrorKind::MethodUnavailable,
            AppError::ParametersInvalid { .. } => ErrorKind::ParametersInvalid,
            AppError::ComputationFailed(_) => ErrorKind::ComputationFailed,
            AppError::Busy(_) => ErrorKind::Busy,
            AppError::InvariantViolation(_) => ErrorKind::InvariantViolation,
            AppError::Io(_) | AppError::Config(_) | AppError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// HTTP 层使用的状态码
    pub fn status_code(&self) -> u16 {
        match self.kind() {
            ErrorKind::NotFound => 404,
            ErrorKind::Forbidden => 403,
            ErrorKind::QuotaExceeded | ErrorKind::FileTooLarge => 413,
            ErrorKind::RateLimited => 429,
            ErrorKind::NotReady => 425,
            ErrorKind::UnsupportedFormat
            | ErrorKind::MethodUnavailable
            | ErrorKind::ParametersInvalid => 400,
            ErrorKind::UpstreamFetchError => match self {
                AppError::UpstreamFetch {
                    status: Some(status),
                    ..
                } if (400..600).contains(status) => *status,
                _ => 502,
            },
            ErrorKind::ComputationFailed => 422,
            ErrorKind::Busy => 503,
            ErrorKind::InvariantViolation | ErrorKind::Internal => 500,
        }
    }

    /// 配额相关错误附带当前用量，方便客户端退避
    pub fn usage(&self) -> Option<UsageReport> {
        match self {
            AppError::QuotaExceeded {
                used,
                budget,
                requested,
            } => Some(UsageReport {
                used_bytes: Some(*used),
                granted_space: Some(*budget),
                requested_bytes: Some(*requested),
                ..UsageReport::default()
            }),
            AppError::RateLimited { performed, allowed } => Some(UsageReport {
                long_calculations: Some(*performed),
                max_long_calc: Some(*allowed),
                ..UsageReport::default()
            }),
            _ => None,
        }
    }
}

/// 配额错误中附带的用量信息
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub granted_space: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub long_calculations: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_long_calc: Option<u32>,
}

/// 结构化错误响应
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub status_code: u16,
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageReport>,
}

impl From<&AppError> for ErrorResponse {
    fn from(error: &AppError) -> Self {
        Self {
            status_code: error.status_code(),
            kind: error.kind(),
            message: error.to_string(),
            usage: error.usage(),
        }
    }
}

/**
 * 对外响应 - `Ok(data) | Err(kind, message)` 的带标签变体
 */
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ApiResponse<T: Serialize> {
    Ok {
        status_code: u16,
        #[serde(flatten)]
        data: T,
    },
    Error(ErrorResponse),
}

impl<T: Serialize> From<Result<T>> for ApiResponse<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(data) => ApiResponse::Ok {
                status_code: 200,
                data,
            },
            Err(error) => ApiResponse::Error(ErrorResponse::from(&error)),
        }
    }
}

/**
 * 统一结果类型
 */
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds_are_stable() {
        assert_eq!(
            AppError::structure_not_found("abc").kind(),
            ErrorKind::NotFound
        );
        assert_eq!(AppError::not_owner("abc").kind(), ErrorKind::Forbidden);
        assert_eq!(
            AppError::upstream(Some(404), "Not Found").kind(),
            ErrorKind::UpstreamFetchError
        );
        let kind = serde_json::to_string(&ErrorKind::UpstreamFetchError).unwrap();
        assert_eq!(kind, "\"upstream_fetch_error\"");
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(AppError::structure_not_found("x").status_code(), 404);
        assert_eq!(AppError::Busy(3).status_code(), 503);
        assert_eq!(AppError::upstream(Some(404), "gone").status_code(), 404);
        assert_eq!(AppError::upstream(None, "timeout").status_code(), 502);
        assert_eq!(
            AppError::RateLimited {
                performed: 2,
                allowed: 2
            }
            .status_code(),
            429
        );
    }

    #[test]
    fn test_quota_error_reports_usage() {
        let error = AppError::QuotaExceeded {
            used: 5,
            budget: 10,
            requested: 6,
        };
        let response = ErrorResponse::from(&error);
        assert_eq!(response.kind, ErrorKind::QuotaExceeded);
        let usage = response.usage.expect("usage should be reported");
        assert_eq!(usage.used_bytes, Some(5));
        assert_eq!(usage.granted_space, Some(10));
        assert!(response.message.contains("granted disk space"));
    }

    #[test]
    fn test_api_response_tagging() {
        #[derive(Serialize)]
        struct Removed {
            removed: String,
        }

        let ok: ApiResponse<Removed> = Ok(Removed {
            removed: "id".into(),
        })
        .into();
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["removed"], "id");

        let err: ApiResponse<Removed> = Err(AppError::structure_not_found("id")).into();
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["kind"], "not_found");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "File not found");
        let app_error: AppError = io_error.into();
        assert!(matches!(app_error, AppError::Io(_)));
        assert_eq!(app_error.kind(), ErrorKind::Internal);
    }
}
