// ==========================================
// FWC 对账引擎 - 领域模型层
// ==========================================
// 职责: 定义领域实体、类型
// 红线: 不含数据访问逻辑,不含引擎逻辑
// ==========================================

pub mod reconciliation;
pub mod reference;
pub mod types;

// 重导出核心类型
pub use reconciliation::{
    ExternalRecord, IngestSummary, MatchDetails, MatchOutcome, MatchedInternalRecord,
    OrphanInternalRecord, Page, Pagination, PartialInternalRecord, ReconciliationBatch,
    RowRejection,
};
pub use reference::{Card, Member, Redemption, RedemptionView};
pub use types::{BatchStatus, CellValue, MatchReason, RowRejectReason};
