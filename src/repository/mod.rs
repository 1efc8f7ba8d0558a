// ==========================================
// FWC 对账引擎 - 数据仓储层
// ==========================================
// 红线: Repository 不含业务逻辑
// 约束: 所有查询使用参数化,防止 SQL 注入
// ==========================================

pub mod error;
pub mod reconciliation_repo;
pub mod reference_repo;

// 重导出核心仓储
pub use error::{RepositoryError, RepositoryResult};
pub use reconciliation_repo::ReconciliationRepository;
pub use reference_repo::ReferenceRepository;
