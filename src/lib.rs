// ==========================================
// FWC 对账引擎 - 核心库
// ==========================================
// 职责: 合作方售票报表与内部核销记录的对账
// 技术栈: Rust + SQLite
// ==========================================

// ==========================================
// 模块声明
// ==========================================

// 领域层 - 实体与类型
pub mod domain;

// 数据仓储层 - 数据访问
pub mod repository;

// 引擎层 - 匹配与批次编排
pub mod engine;

// 导入层 - 合作方报表
pub mod importer;

// 配置层 - 对账参数
pub mod config;

// 数据库基础设施（连接初始化/PRAGMA 统一）
pub mod db;

// 日志系统
pub mod logging;

// 性能统计
pub mod perf;

// API 层 - 业务接口
pub mod api;

// ==========================================
// 重导出核心类型
// ==========================================

// 领域类型
pub use domain::types::{BatchStatus, CellValue, MatchReason, RowRejectReason};

// 领域实体
pub use domain::{
    ExternalRecord, MatchDetails, MatchOutcome, OrphanInternalRecord, Page, Pagination,
    ReconciliationBatch,
};

// 引擎
pub use engine::{BatchOrchestrator, Matcher, OrphanScanner, ReferenceSnapshot};

// API
pub use api::{ApiError, ReconciliationApi};

// ==========================================
// 常量定义
// ==========================================

// 系统版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// 系统名称
pub const APP_NAME: &str = "FWC 对账引擎";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
