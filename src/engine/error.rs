// ==========================================
// FWC 对账引擎 - 引擎层错误类型
// ==========================================
// 说明: 匹配原因码不是错误; 这里只有批次级失败
// ==========================================

use crate::domain::types::BatchStatus;
use crate::repository::RepositoryError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("批次不存在: {0}")]
    BatchNotFound(String),

    #[error("批次已完成匹配,如需重新匹配请删除后重新导入: {0}")]
    BatchAlreadyMatched(String),

    #[error("批次正在匹配中: {0}")]
    BatchMatchingInProgress(String),

    #[error("批次匹配失败,只能删除后重新导入: {0}")]
    BatchFailed(String),

    #[error("批次尚未完成匹配: batch_id={batch_id}, status={status}")]
    BatchNotCompleted { batch_id: String, status: BatchStatus },

    #[error("匹配执行失败: batch_id={batch_id}, 已处理 {processed_rows} 行, 原因: {message}")]
    MatchingFailed {
        batch_id: String,
        processed_rows: usize,
        message: String,
    },

    #[error("参考数据读取失败: {0}")]
    ReferenceLookup(String),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ReconcileError {
    /// 按批次当前状态给出"不可开始匹配"的原因
    pub fn not_startable(batch_id: &str, status: BatchStatus) -> Self {
        match status {
            BatchStatus::Completed => ReconcileError::BatchAlreadyMatched(batch_id.to_string()),
            BatchStatus::Matching => ReconcileError::BatchMatchingInProgress(batch_id.to_string()),
            BatchStatus::Failed => ReconcileError::BatchFailed(batch_id.to_string()),
            // CAS 未生效但重读仍为 PENDING: 按并发竞争处理
            BatchStatus::Pending => ReconcileError::BatchMatchingInProgress(batch_id.to_string()),
        }
    }
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;
