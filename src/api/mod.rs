// ==========================================
// FWC 对账引擎 - API 层
// ==========================================
// 职责: 提供对账业务接口,供命令行 / 管理端调用
// ==========================================

pub mod error;
pub mod reconciliation_api;

// 重导出核心类型
pub use error::{ApiError, ApiResult};
pub use reconciliation_api::{
    BatchDetailResponse, DeleteBatchResponse, ExportResponse, FileIngestResult, IngestResponse,
    ReconciliationApi, RecordView,
};
