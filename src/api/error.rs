// ==========================================
// FWC 对账引擎 - API层错误类型
// ==========================================
// 职责: 定义API层错误类型，转换各层错误为带稳定错误码的响应
// 响应: { success: false, error: { message, code, statusCode } }
// ==========================================

use crate::config::ConfigError;
use crate::engine::ReconcileError;
use crate::importer::ImportError;
use crate::repository::error::RepositoryError;
use serde_json::{json, Value};
use thiserror::Error;

/// API层错误类型
/// 所有错误信息必须包含显式原因（批次号 / 行号 / 列名）
#[derive(Error, Debug)]
pub enum ApiError {
    // ==========================================
    // 输入错误
    // ==========================================
    #[error("无效输入: {0}")]
    InvalidInput(String),

    #[error("文件不存在: {0}")]
    FileNotFound(String),

    #[error("文件格式不支持: {0}")]
    UnsupportedFormat(String),

    // ==========================================
    // 导入错误（批次不创建）
    // ==========================================
    #[error("表头缺少必需列: {column}")]
    MissingRequiredColumn { column: String },

    #[error("报表中没有可用数据行（共扫描 {scanned_rows} 行,拒绝 {rejected_rows} 行）")]
    NoUsableRows {
        scanned_rows: usize,
        rejected_rows: usize,
    },

    #[error("文件导入失败: {0}")]
    ImportError(String),

    // ==========================================
    // 批次状态错误
    // ==========================================
    #[error("批次不存在: {0}")]
    BatchNotFound(String),

    #[error("资源未找到: {0}")]
    NotFound(String),

    #[error("批次已完成匹配: {0}")]
    BatchAlreadyMatched(String),

    #[error("批次正在匹配中: {0}")]
    BatchMatchingInProgress(String),

    #[error("批次已失败,请删除后重新导入: {0}")]
    BatchFailed(String),

    #[error("批次尚未完成匹配: batch_id={batch_id}, status={status}")]
    BatchNotCompleted { batch_id: String, status: String },

    #[error("无效的状态转换: from={from} to={to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("匹配执行失败: batch_id={batch_id}, 已处理 {processed_rows} 行, 原因: {message}")]
    MatchingFailed {
        batch_id: String,
        processed_rows: usize,
        message: String,
    },

    // ==========================================
    // 数据访问错误
    // ==========================================
    #[error("数据库错误: {0}")]
    DatabaseError(String),

    #[error("数据库连接失败: {0}")]
    DatabaseConnectionError(String),

    #[error("数据库事务失败: {0}")]
    DatabaseTransactionError(String),

    // ==========================================
    // 通用错误
    // ==========================================
    #[error("内部错误: {0}")]
    InternalError(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ApiError {
    /// 机器可读的稳定错误码
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidInput(_) => "INVALID_INPUT",
            ApiError::FileNotFound(_) => "FILE_NOT_FOUND",
            ApiError::UnsupportedFormat(_) => "UNSUPPORTED_FORMAT",
            ApiError::MissingRequiredColumn { .. } => "MISSING_REQUIRED_COLUMN",
            ApiError::NoUsableRows { .. } => "NO_USABLE_ROWS",
            ApiError::ImportError(_) => "INVALID_INPUT",
            ApiError::BatchNotFound(_) => "BATCH_NOT_FOUND",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::BatchAlreadyMatched(_) => "BATCH_ALREADY_MATCHED",
            ApiError::BatchMatchingInProgress(_) => "BATCH_MATCHING_IN_PROGRESS",
            ApiError::BatchFailed(_) => "BATCH_FAILED",
            ApiError::BatchNotCompleted { .. } => "BATCH_NOT_COMPLETED",
            ApiError::InvalidStateTransition { .. } => "INVALID_STATE_TRANSITION",
            ApiError::MatchingFailed { .. } => "MATCHING_FAILED",
            ApiError::DatabaseError(_)
            | ApiError::DatabaseConnectionError(_)
            | ApiError::DatabaseTransactionError(_) => "DATABASE_ERROR",
            ApiError::InternalError(_) | ApiError::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP 风格状态码
    pub fn status_code(&self) -> u16 {
        match self {
            ApiError::InvalidInput(_)
            | ApiError::UnsupportedFormat(_)
            | ApiError::MissingRequiredColumn { .. }
            | ApiError::NoUsableRows { .. }
            | ApiError::ImportError(_) => 400,
            ApiError::FileNotFound(_) | ApiError::BatchNotFound(_) | ApiError::NotFound(_) => 404,
            ApiError::BatchAlreadyMatched(_)
            | ApiError::BatchMatchingInProgress(_)
            | ApiError::BatchFailed(_)
            | ApiError::BatchNotCompleted { .. }
            | ApiError::InvalidStateTransition { .. } => 409,
            ApiError::MatchingFailed { .. }
            | ApiError::DatabaseError(_)
            | ApiError::DatabaseConnectionError(_)
            | ApiError::DatabaseTransactionError(_)
            | ApiError::InternalError(_)
            | ApiError::Other(_) => 500,
        }
    }

    /// 失败响应信封
    pub fn to_response(&self) -> Value {
        json!({
            "success": false,
            "error": {
                "message": self.to_string(),
                "code": self.code(),
                "statusCode": self.status_code(),
            }
        })
    }
}

// ==========================================
// 从 RepositoryError 转换
// ==========================================
impl From<RepositoryError> for ApiError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound { entity, id } => {
                if entity == "ReconciliationBatch" {
                    ApiError::BatchNotFound(id)
                } else {
                    ApiError::NotFound(format!("{}(id={})不存在", entity, id))
                }
            }
            RepositoryError::DatabaseConnectionError(msg) => ApiError::DatabaseConnectionError(msg),
            RepositoryError::DatabaseTransactionError(msg) => {
                ApiError::DatabaseTransactionError(msg)
            }
            RepositoryError::LockError(msg) => {
                ApiError::DatabaseConnectionError(format!("数据库锁获取失败: {}", msg))
            }
            RepositoryError::DatabaseQueryError(msg) => ApiError::DatabaseError(msg),
            RepositoryError::UniqueConstraintViolation(msg) => {
                ApiError::DatabaseError(format!("唯一约束违反: {}", msg))
            }
            RepositoryError::ForeignKeyViolation(msg) => {
                ApiError::DatabaseError(format!("外键约束违反: {}", msg))
            }
            RepositoryError::InvalidStateTransition { from, to } => {
                ApiError::InvalidStateTransition { from, to }
            }
            RepositoryError::FieldValueError { field, message } => {
                ApiError::DatabaseError(format!("字段{}错误: {}", field, message))
            }
            RepositoryError::SerializationError(msg) => ApiError::DatabaseError(msg),
            RepositoryError::InternalError(msg) => ApiError::InternalError(msg),
            RepositoryError::Other(err) => ApiError::Other(err),
        }
    }
}

// ==========================================
// 从 ImportError 转换
// ==========================================
impl From<ImportError> for ApiError {
    fn from(err: ImportError) -> Self {
        match err {
            ImportError::FileNotFound(path) => ApiError::FileNotFound(path),
            ImportError::UnsupportedFormat(ext) => ApiError::UnsupportedFormat(ext),
            ImportError::MissingRequiredColumn { column } => {
                ApiError::MissingRequiredColumn { column }
            }
            ImportError::NoUsableRows {
                scanned_rows,
                rejected_rows,
            } => ApiError::NoUsableRows {
                scanned_rows,
                rejected_rows,
            },
            e @ (ImportError::FileReadError(_)
            | ImportError::ExcelParseError(_)
            | ImportError::CsvParseError(_)) => ApiError::ImportError(e.to_string()),
            ImportError::DatabaseTransactionError(msg) => ApiError::DatabaseTransactionError(msg),
            ImportError::DatabaseQueryError(msg) => ApiError::DatabaseError(msg),
            ImportError::InternalError(msg) => ApiError::InternalError(msg),
            ImportError::Other(err) => ApiError::Other(err),
        }
    }
}

// ==========================================
// 从 ReconcileError 转换
// ==========================================
impl From<ReconcileError> for ApiError {
    fn from(err: ReconcileError) -> Self {
        match err {
            ReconcileError::BatchNotFound(id) => ApiError::BatchNotFound(id),
            ReconcileError::BatchAlreadyMatched(id) => ApiError::BatchAlreadyMatched(id),
            ReconcileError::BatchMatchingInProgress(id) => ApiError::BatchMatchingInProgress(id),
            ReconcileError::BatchFailed(id) => ApiError::BatchFailed(id),
            ReconcileError::BatchNotCompleted { batch_id, status } => {
                ApiError::BatchNotCompleted {
                    batch_id,
                    status: status.as_str().to_string(),
                }
            }
            ReconcileError::MatchingFailed {
                batch_id,
                processed_rows,
                message,
            } => ApiError::MatchingFailed {
                batch_id,
                processed_rows,
                message,
            },
            ReconcileError::ReferenceLookup(msg) => ApiError::DatabaseError(msg),
            ReconcileError::Repository(e) => ApiError::from(e),
            ReconcileError::Other(e) => ApiError::Other(e),
        }
    }
}

// ==========================================
// 从配置错误转换
// ==========================================
impl From<ConfigError> for ApiError {
    fn from(err: ConfigError) -> Self {
        ApiError::InternalError(format!("配置读取失败: {}", err))
    }
}

/// Result 类型别名
pub type ApiResult<T> = Result<T, ApiError>;
