// ==========================================
// FWC 对账引擎 - 配置层
// ==========================================
// 职责: 对账参数管理（前缀、扫描行数、分页上限、孤儿上限、并行度）
// 存储: config_kv 表
// ==========================================

pub mod config_manager;
pub mod recon_config_trait;

// 重导出核心配置管理器
pub use config_manager::{config_keys, ConfigManager, ReconConfig};
pub use recon_config_trait::{ConfigError, ReconConfigReader};
