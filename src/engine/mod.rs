// ==========================================
// FWC 对账引擎 - 引擎层
// ==========================================
// 职责: 参考数据索引 / 两层匹配 / 批次编排 / 孤儿扫描
// 红线: Engine 不拼 SQL, 每行结果必须输出 reason
// ==========================================

pub mod error;
pub mod matcher;
pub mod orchestrator;
pub mod orphan_scanner;
pub mod reference_index;

// 重导出核心引擎
pub use error::{ReconcileError, ReconcileResult};
pub use matcher::{IdentityDateTier, MatchStrategy, Matcher, SerialTier, TierHit};
pub use orchestrator::{BatchOrchestrator, MatchingOptions};
pub use orphan_scanner::OrphanScanner;
pub use reference_index::{ReferenceIndex, ReferenceSnapshot};
